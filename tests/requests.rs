mod support;

use std::collections::HashSet;
use std::time::Duration;

use hub_ws::{ConnectionState, HubError, OutgoingMessage};
use serde::Deserialize;
use sonic_rs::JsonValueTrait;
use support::{connected, mock_connection, test_config, wait_for_pending, wait_for_state};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize, PartialEq)]
struct Echo {
    n: u64,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_requests_receive_their_own_responses() {
    const CALLERS: u64 = 16;
    let (conn, _transport, _hub, mut server) = connected(test_config()).await;
    let token = CancellationToken::new();

    let mut callers = Vec::new();
    for n in 0..CALLERS {
        let conn = conn.clone();
        let token = token.clone();
        callers.push(tokio::spawn(async move {
            let message = OutgoingMessage::new("echo").with_field("n", n);
            let echo: Echo = conn.send_typed(message, &token).await?;
            Ok::<_, HubError>((n, echo))
        }));
    }

    let mut requests = Vec::new();
    let mut ids = HashSet::new();
    for _ in 0..CALLERS {
        let (id, request) = server.recv_request().await.expect("request");
        assert!(ids.insert(id), "identifier {id} reused");
        requests.push((id, request["n"].as_u64().expect("payload")));
    }
    // Answer out of order.
    for (id, n) in requests.into_iter().rev() {
        server
            .reply_ok(id, &format!(r#"{{"n":{n}}}"#))
            .expect("reply");
    }

    for caller in callers {
        let (n, echo) = caller.await.expect("join").expect("response");
        assert_eq!(echo, Echo { n });
    }
    assert_eq!(conn.pending_request_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identifiers_restart_after_reconnect() {
    let (conn, _transport, mut hub, mut server) = connected(test_config()).await;
    let token = CancellationToken::new();

    for expected in 1..=3 {
        let sending = {
            let conn = conn.clone();
            let token = token.clone();
            tokio::spawn(async move { conn.send(OutgoingMessage::new("get_config"), &token).await })
        };
        let (id, _) = server.recv_request().await.expect("request");
        assert_eq!(id, expected);
        server.reply_ok(id, "null").expect("reply");
        sending.await.expect("join").expect("response");
    }

    server.drop_socket();
    let mut server = hub.accept_authenticated().await.expect("reconnect");
    wait_for_state(&conn, ConnectionState::Connected).await;

    let sending = {
        let conn = conn.clone();
        let token = token.clone();
        tokio::spawn(async move { conn.send(OutgoingMessage::new("get_config"), &token).await })
    };
    let (id, _) = server.recv_request().await.expect("request after reconnect");
    assert_eq!(id, 1);
    server.reply_ok(id, "null").expect("reply");
    sending.await.expect("join").expect("response");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_results_surface_the_server_error() {
    let (conn, _transport, _hub, mut server) = connected(test_config()).await;
    let token = CancellationToken::new();

    let raw = {
        let conn = conn.clone();
        let token = token.clone();
        tokio::spawn(async move { conn.send(OutgoingMessage::new("call_service"), &token).await })
    };
    let (id, _) = server.recv_request().await.expect("request");
    server
        .reply_error(id, "service_not_found", "Service not found.")
        .expect("reply");
    let response = raw.await.expect("join").expect("raw response");
    assert!(!response.success);
    assert_eq!(
        response.error.as_ref().map(|e| e.code.as_str()),
        Some("service_not_found")
    );

    let typed = {
        let conn = conn.clone();
        let token = token.clone();
        tokio::spawn(async move {
            conn.send_typed::<Echo>(OutgoingMessage::new("call_service"), &token)
                .await
        })
    };
    let (id, _) = server.recv_request().await.expect("request");
    server
        .reply_error(id, "unauthorized", "Unauthorized")
        .expect("reply");
    let err = typed.await.expect("join").expect_err("typed failure");
    assert!(
        matches!(err, HubError::ServerError { ref code, .. } if code == "unauthorized"),
        "unexpected error: {err:?}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reused_identifier_is_an_invalid_operation() {
    let (conn, _transport, _hub, mut server) = connected(test_config()).await;
    let sending = {
        let conn = conn.clone();
        tokio::spawn(async move {
            conn.send(OutgoingMessage::new("get_states"), &CancellationToken::new())
                .await
        })
    };
    let (id, _) = server.recv_request().await.expect("request");
    server
        .reply_error(id, "id_reuse", "Identifier values have to increase.")
        .expect("reply");
    let err = sending.await.expect("join").expect_err("id reuse");
    assert!(matches!(err, HubError::InvalidOperation(_)), "unexpected error: {err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn requests_outside_connected_state_never_touch_the_wire() {
    let (conn, transport, _hub) = mock_connection(test_config());
    let err = conn
        .send(OutgoingMessage::new("get_states"), &CancellationToken::new())
        .await
        .expect_err("disconnected");
    assert!(matches!(err, HubError::InvalidState(_)), "unexpected error: {err:?}");
    assert_eq!(transport.write_count(), 0);
    assert_eq!(conn.pending_request_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reserved_fields_are_rejected_before_sending() {
    let (conn, transport, _hub, _server) = connected(test_config()).await;
    let writes = transport.write_count();
    let err = conn
        .send(
            OutgoingMessage::new("get_states").with_field("id", 7u64),
            &CancellationToken::new(),
        )
        .await
        .expect_err("reserved key");
    assert!(matches!(err, HubError::InvalidArgument(_)), "unexpected error: {err:?}");
    assert_eq!(transport.write_count(), writes);
    assert_eq!(conn.pending_request_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_request_is_forgotten() {
    let (conn, _transport, _hub, mut server) = connected(test_config()).await;
    let token = CancellationToken::new();
    let sending = {
        let conn = conn.clone();
        let token = token.clone();
        tokio::spawn(async move { conn.send(OutgoingMessage::new("get_states"), &token).await })
    };
    let (id, _) = server.recv_request().await.expect("request");
    wait_for_pending(&conn, 1).await;

    token.cancel();
    let err = sending.await.expect("join").expect_err("cancelled");
    assert!(err.is_cancelled(), "unexpected error: {err:?}");
    assert_eq!(conn.pending_request_count(), 0);

    // A late reply is dropped and the session keeps working.
    server.reply_ok(id, "null").expect("late reply");
    let next = {
        let conn = conn.clone();
        tokio::spawn(async move {
            conn.send(OutgoingMessage::new("get_config"), &CancellationToken::new())
                .await
        })
    };
    let (next_id, _) = server.recv_request().await.expect("request");
    assert_eq!(next_id, id + 1);
    server.reply_ok(next_id, "null").expect("reply");
    next.await.expect("join").expect("response");
    assert_eq!(conn.connection_state(), ConnectionState::Connected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unanswered_request_times_out() {
    let config = test_config().request_timeout(Some(Duration::from_millis(100)));
    let (conn, _transport, _hub, mut server) = connected(config).await;
    let sending = {
        let conn = conn.clone();
        tokio::spawn(async move {
            conn.send(OutgoingMessage::new("get_states"), &CancellationToken::new())
                .await
        })
    };
    server.recv_request().await.expect("request");
    let err = sending.await.expect("join").expect_err("timeout");
    assert!(matches!(err, HubError::Timeout { .. }), "unexpected error: {err:?}");
    assert_eq!(conn.pending_request_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pending_table_is_bounded() {
    let config = test_config().max_pending_requests(2);
    let (conn, _transport, _hub, mut server) = connected(config).await;
    let token = CancellationToken::new();

    let mut outstanding = Vec::new();
    for _ in 0..2 {
        let conn = conn.clone();
        let token = token.clone();
        outstanding.push(tokio::spawn(async move {
            conn.send(OutgoingMessage::new("get_states"), &token).await
        }));
    }
    server.recv_request().await.expect("first");
    server.recv_request().await.expect("second");
    wait_for_pending(&conn, 2).await;

    let err = conn
        .send(OutgoingMessage::new("get_states"), &token)
        .await
        .expect_err("table full");
    assert!(matches!(err, HubError::TooManyPending { max: 2 }), "unexpected error: {err:?}");

    token.cancel();
    for request in outstanding {
        assert!(request.await.expect("join").is_err());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn coalesced_results_resolve_each_request() {
    let (conn, _transport, _hub, mut server) = connected(test_config()).await;
    let token = CancellationToken::new();
    let mut callers = Vec::new();
    for _ in 0..2 {
        let conn = conn.clone();
        let token = token.clone();
        callers.push(tokio::spawn(async move {
            conn.send(OutgoingMessage::new("get_states"), &token).await
        }));
    }
    let (a, _) = server.recv_request().await.expect("first");
    let (b, _) = server.recv_request().await.expect("second");
    server
        .send_text(format!(
            r#"[{{"id":{a},"type":"result","success":true,"result":null}},{{"id":{b},"type":"result","success":true,"result":null}}]"#
        ))
        .expect("batch");

    let mut resolved: Vec<u64> = Vec::new();
    for caller in callers {
        resolved.push(caller.await.expect("join").expect("response").id);
    }
    resolved.sort_unstable();
    let mut expected = vec![a, b];
    expected.sort_unstable();
    assert_eq!(resolved, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_batch_entry_does_not_lose_its_neighbours() {
    let (conn, _transport, _hub, mut server) = connected(test_config()).await;
    let caller = {
        let conn = conn.clone();
        tokio::spawn(async move {
            conn.send(OutgoingMessage::new("get_states"), &CancellationToken::new())
                .await
        })
    };
    let (id, _) = server.recv_request().await.expect("request");
    server
        .send_text(format!(
            r#"[{{"id":{id},"type":"result","success":true,"result":null}},{{"type":"result","success":true}}]"#
        ))
        .expect("batch");

    let response = caller.await.expect("join").expect("response");
    assert_eq!(response.id, id);
    assert!(response.success);
    assert_eq!(conn.pending_request_count(), 0);
    assert_eq!(conn.connection_state(), ConnectionState::Connected);
}
