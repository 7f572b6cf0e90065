#![allow(dead_code)]

use std::time::Duration;

use hub_ws::testing::{MockHub, MockServer, MockTransport};
use hub_ws::{ConnectionParameters, ConnectionState, HubConfig, HubConnection, RetryBudget};
use tokio::sync::broadcast;

pub type MockConnection = HubConnection<MockTransport>;

pub fn test_config() -> HubConfig {
    HubConfig::new()
        .ping_interval(None)
        .retry_delay(Duration::from_millis(50))
        .auth_timeout(Duration::from_secs(2))
        .request_timeout(Some(Duration::from_secs(5)))
}

pub fn params() -> ConnectionParameters {
    ConnectionParameters::new("ws://hub.test/api/websocket", "secret-token")
}

pub fn mock_connection(config: HubConfig) -> (MockConnection, MockTransport, MockHub) {
    let (transport, hub) = MockTransport::new();
    let conn = HubConnection::new(transport.clone(), config).expect("valid config");
    (conn, transport, hub)
}

/// Connect through the mock hub and return the server side of the live session.
pub async fn connect(conn: &MockConnection, hub: &mut MockHub) -> MockServer {
    let connecting = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.connect(params(), RetryBudget::None, None).await })
    };
    let server = hub.accept_authenticated().await.expect("handshake");
    connecting.await.expect("join").expect("connect");
    assert_eq!(conn.connection_state(), ConnectionState::Connected);
    server
}

pub async fn connected(config: HubConfig) -> (MockConnection, MockTransport, MockHub, MockServer) {
    let (conn, transport, mut hub) = mock_connection(config);
    let server = connect(&conn, &mut hub).await;
    (conn, transport, hub, server)
}

pub async fn wait_for_state(conn: &MockConnection, target: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while conn.connection_state() != target {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("state never became {target}, stuck at {}", conn.connection_state()));
}

pub async fn wait_for_pending(conn: &MockConnection, count: usize) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while conn.pending_request_count() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("pending requests never reached the expected count");
}

pub fn drain_states(rx: &mut broadcast::Receiver<ConnectionState>) -> Vec<ConnectionState> {
    let mut states = Vec::new();
    while let Ok(state) = rx.try_recv() {
        states.push(state);
    }
    states
}
