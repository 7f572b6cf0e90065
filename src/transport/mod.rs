use std::future::Future;
use std::pin::Pin;

use futures_util::{Sink, Stream};

use crate::core::{HubError, WebSocketBufferConfig, WsFrame, WsTlsConfig};

pub mod tungstenite;

pub type WsTransportConnectFuture<R, W> =
    Pin<Box<dyn Future<Output = Result<(R, W), HubError>> + Send>>;

/// Transport boundary for websocket IO.
///
/// A transport opens one duplex, message-framed session per `connect` call. Reading ends when
/// the stream yields `None` or an error; writing goes through the sink. The connection engine
/// never reuses a session across reconnects.
pub trait WsTransport: Clone + Send + Sync + 'static {
    type Reader: Stream<Item = Result<WsFrame, HubError>> + Send + Unpin + 'static;
    type Writer: Sink<WsFrame, Error = HubError> + Send + Sync + Unpin + 'static;

    fn connect(
        &self,
        url: String,
        buffers: WebSocketBufferConfig,
        tls: WsTlsConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer>;
}
