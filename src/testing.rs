//! Reusable test utilities for exercising [`HubConnection`](crate::HubConnection) without a
//! real socket.
//!
//! [`MockTransport`] hands out one [`MockServer`] per physical connection through a
//! [`MockHub`], so tests can script the hub side (handshake, results, events, socket drops)
//! across reconnects.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Sink;
use sonic_rs::{JsonValueTrait, Value};
use tokio::sync::mpsc;

use crate::core::{HubError, WebSocketBufferConfig, WsFrame, WsTlsConfig, data_bytes};
use crate::transport::{WsTransport, WsTransportConnectFuture};

/// Version banner reported by [`MockServer::send_auth_required`] and [`MockServer::send_auth_ok`].
pub const MOCK_HUB_VERSION: &str = "2024.6.0";

struct MockShared {
    servers_tx: mpsc::UnboundedSender<MockServer>,
    fail_next: AtomicUsize,
    connect_attempts: AtomicUsize,
    writes: AtomicUsize,
}

/// A transport that uses in-memory channels so tests can emulate hub behavior.
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<MockShared>,
}

impl MockTransport {
    /// Build a transport and the hub handle that receives one [`MockServer`] per connect.
    pub fn new() -> (Self, MockHub) {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        (
            Self {
                shared: Arc::new(MockShared {
                    servers_tx,
                    fail_next: AtomicUsize::new(0),
                    connect_attempts: AtomicUsize::new(0),
                    writes: AtomicUsize::new(0),
                }),
            },
            MockHub { servers_rx },
        )
    }

    /// Make the next `n` connect attempts fail with a connection error.
    pub fn fail_next_connects(&self, n: usize) {
        self.shared.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Data frames written across every connection made through this transport.
    pub fn write_count(&self) -> usize {
        self.shared.writes.load(Ordering::SeqCst)
    }
}

impl WsTransport for MockTransport {
    type Reader = MockReader;
    type Writer = MockWriter;

    fn connect(
        &self,
        _url: String,
        _buffers: WebSocketBufferConfig,
        _tls: WsTlsConfig,
    ) -> WsTransportConnectFuture<Self::Reader, Self::Writer> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
            let refused = shared
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(HubError::ConnectionFailed(
                    "mock connection refused".to_string(),
                ));
            }

            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let server = MockServer {
                outbound_rx: sent_rx,
                inbound_tx: Some(inbound_tx),
            };
            // Tests that never look at the hub side drop it; the connection then sees EOF.
            let _ = shared.servers_tx.send(server);
            Ok((
                MockReader { rx: inbound_rx },
                MockWriter {
                    sent_tx,
                    shared: Arc::clone(&shared),
                },
            ))
        })
    }
}

/// Receives the server side of every connection opened through a [`MockTransport`].
pub struct MockHub {
    servers_rx: mpsc::UnboundedReceiver<MockServer>,
}

impl MockHub {
    pub async fn next_connection(&mut self) -> Option<MockServer> {
        self.servers_rx.recv().await
    }

    pub async fn next_connection_timeout(&mut self, timeout: Duration) -> Option<MockServer> {
        tokio::time::timeout(timeout, self.servers_rx.recv())
            .await
            .unwrap_or_default()
    }

    /// Accept the next connection and complete the handshake with `auth_ok`.
    pub async fn accept_authenticated(&mut self) -> Option<MockServer> {
        let mut server = self.next_connection().await?;
        server.send_auth_required().ok()?;
        let auth = server.recv_json().await?;
        if auth["type"].as_str() != Some("auth") {
            return None;
        }
        server.send_auth_ok().ok()?;
        Some(server)
    }
}

/// Error surface for operations on [`MockServer`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MockServerError {
    /// The inbound socket side was intentionally dropped.
    SocketDropped,
    /// The connection side is no longer reading inbound frames.
    ChannelClosed,
}

impl std::fmt::Display for MockServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MockServerError::SocketDropped => f.write_str("mock socket already dropped"),
            MockServerError::ChannelClosed => f.write_str("mock connection channel is closed"),
        }
    }
}

impl std::error::Error for MockServerError {}

/// Hub-side test handle for one physical connection.
pub struct MockServer {
    outbound_rx: mpsc::UnboundedReceiver<WsFrame>,
    inbound_tx: Option<mpsc::UnboundedSender<Result<WsFrame, HubError>>>,
}

impl MockServer {
    /// Receive the next frame written by the client, including control frames.
    pub async fn recv_frame(&mut self) -> Option<WsFrame> {
        self.outbound_rx.recv().await
    }

    /// Receive the next data frame and parse it as JSON.
    pub async fn recv_json(&mut self) -> Option<Value> {
        loop {
            let frame = self.outbound_rx.recv().await?;
            if let Some(bytes) = data_bytes(&frame) {
                return sonic_rs::from_slice(bytes).ok();
            }
        }
    }

    pub async fn recv_json_timeout(&mut self, timeout: Duration) -> Option<Value> {
        tokio::time::timeout(timeout, self.recv_json())
            .await
            .unwrap_or_default()
    }

    /// Receive the next request and return it with its id.
    pub async fn recv_request(&mut self) -> Option<(u64, Value)> {
        let request = self.recv_json().await?;
        let id = request["id"].as_u64()?;
        Some((id, request))
    }

    pub fn send_frame(&self, frame: WsFrame) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(Ok(frame)).map_err(|_| MockServerError::ChannelClosed)
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), MockServerError> {
        self.send_frame(WsFrame::text(text))
    }

    pub fn send_auth_required(&self) -> Result<(), MockServerError> {
        self.send_text(format!(
            r#"{{"type":"auth_required","ha_version":"{MOCK_HUB_VERSION}"}}"#
        ))
    }

    pub fn send_auth_ok(&self) -> Result<(), MockServerError> {
        self.send_text(format!(
            r#"{{"type":"auth_ok","ha_version":"{MOCK_HUB_VERSION}"}}"#
        ))
    }

    pub fn send_auth_invalid(&self, message: &str) -> Result<(), MockServerError> {
        self.send_text(format!(r#"{{"type":"auth_invalid","message":"{message}"}}"#))
    }

    /// Successful `result` frame; `result_json` is raw JSON (`"null"` for no payload).
    pub fn reply_ok(&self, id: u64, result_json: &str) -> Result<(), MockServerError> {
        self.send_text(format!(
            r#"{{"id":{id},"type":"result","success":true,"result":{result_json}}}"#
        ))
    }

    pub fn reply_error(&self, id: u64, code: &str, message: &str) -> Result<(), MockServerError> {
        self.send_text(format!(
            r#"{{"id":{id},"type":"result","success":false,"error":{{"code":"{code}","message":"{message}"}}}}"#
        ))
    }

    pub fn reply_pong(&self, id: u64) -> Result<(), MockServerError> {
        self.send_text(format!(r#"{{"id":{id},"type":"pong"}}"#))
    }

    /// Push an event for `subscription`; `event_json` is the raw event object.
    pub fn send_event(&self, subscription: u64, event_json: &str) -> Result<(), MockServerError> {
        self.send_text(format!(
            r#"{{"id":{subscription},"type":"event","event":{event_json}}}"#
        ))
    }

    /// Surface a transport read error to the client.
    pub fn fail_read(&self, error: &str) -> Result<(), MockServerError> {
        let Some(tx) = self.inbound_tx.as_ref() else {
            return Err(MockServerError::SocketDropped);
        };
        tx.send(Err(HubError::transport("mock_read", error)))
            .map_err(|_| MockServerError::ChannelClosed)
    }

    /// Simulate a hub-side socket drop by closing the inbound channel.
    pub fn drop_socket(&mut self) {
        self.inbound_tx = None;
    }
}

/// Reader side for [`MockTransport`].
pub struct MockReader {
    rx: mpsc::UnboundedReceiver<Result<WsFrame, HubError>>,
}

impl futures_util::Stream for MockReader {
    type Item = Result<WsFrame, HubError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_recv(cx)
    }
}

/// Writer side for [`MockTransport`].
pub struct MockWriter {
    sent_tx: mpsc::UnboundedSender<WsFrame>,
    shared: Arc<MockShared>,
}

impl Sink<WsFrame> for MockWriter {
    type Error = HubError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: WsFrame) -> Result<(), Self::Error> {
        let this = self.get_mut();
        if data_bytes(&item).is_some() {
            this.shared.writes.fetch_add(1, Ordering::SeqCst);
        }
        this.sent_tx
            .send(item)
            .map_err(|_| HubError::transport("mock_transport_write", "mock outbound channel closed"))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}
