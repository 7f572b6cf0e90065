//! Connection and message-correlation engine for automation hub WebSocket APIs.
//!
//! [`HubConnection`] authenticates against the hub, correlates requests with responses by
//! message id, fans subscribed events out to handlers and restores subscriptions after a
//! reconnect. The socket itself sits behind [`transport::WsTransport`]; the wire format behind
//! [`codec::HubCodec`].

pub mod codec;
pub mod config;
pub mod core;
pub mod testing;
pub mod tls;
pub mod transport;
pub mod ws;

pub use codec::{HubCodec, HubEvent, HubResponse, IncomingMessage, JsonCodec, OutgoingMessage, ServerErrorInfo};
pub use config::{ConnectionParameters, HubConfig, WEBSOCKET_API_PATH};
pub use core::{ConnectionState, HubError, HubResult, RetryBudget};
pub use transport::WsTransport;
pub use transport::tungstenite::TungsteniteTransport;
pub use ws::{EventFilter, EventHandler, HubConnection, event_handler};
