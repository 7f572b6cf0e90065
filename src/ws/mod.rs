pub mod connection;
pub(crate) mod dispatch;
pub(crate) mod handshake;
pub mod ids;
pub mod pending;
pub mod subscriptions;
pub mod writer;

pub use connection::HubConnection;
pub use ids::MessageIdAllocator;
pub use pending::PendingRequests;
pub use subscriptions::{EventFilter, EventHandler, SubscriptionRegistry, event_handler};
pub use writer::{WriterWrite, WsWriterActor};
