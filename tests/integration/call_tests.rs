//! Integration tests for request/response correlation over a live process.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use toolpipe::client::{ClientEvent, ConnectionState};
use toolpipe::AppError;

use super::test_helpers::{ready_client, wait_for_event, PATIENCE};

const FIVE_SECONDS: Duration = Duration::from_secs(5);

// ── Correlation ─────────────────────────────────────────────────────────────

/// A generic call resolves with the peer's result.
#[tokio::test]
async fn call_round_trips_result() {
    let (client, _events) = ready_client().await;

    let params = json!({"nested": {"values": [1, 2, 3]}, "text": "héllo\nworld"});
    let result = client
        .call("echo", params.clone(), FIVE_SECONDS)
        .await
        .expect("echo");

    assert_eq!(result, params);
    assert_eq!(client.pending_requests(), 0);
    client.stop().await.expect("stop");
}

/// 10,000 concurrent calls each receive their own response.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ten_thousand_concurrent_calls_route_to_their_callers() {
    let (client, _events) = ready_client().await;
    let client = Arc::new(client);

    let tasks: Vec<_> = (0..10_000_u64)
        .map(|n| {
            let client = Arc::clone(&client);
            tokio::spawn(async move {
                let result = client
                    .call("echo", json!({ "n": n }), Duration::from_secs(60))
                    .await;
                (n, result)
            })
        })
        .collect();

    for task in tasks {
        let (n, result) = task.await.expect("call task");
        let value = result.unwrap_or_else(|err| panic!("call {n} failed: {err}"));
        assert_eq!(value, json!({ "n": n }), "call {n} got another caller's response");
    }
    assert_eq!(client.pending_requests(), 0);
    client.stop().await.expect("stop");
}

/// Slow and fast calls overlap; completion order follows the peer.
#[tokio::test]
async fn responses_may_complete_out_of_order() {
    let (client, _events) = ready_client().await;

    let slow = {
        let client = client.clone();
        tokio::spawn(async move { client.call_tool("delay", json!({"ms": 300})).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let fast = client.call_tool("echo", json!({"text": "quick"})).await.expect("fast");
    assert_eq!(fast.text(), "quick");
    assert!(!slow.is_finished(), "slow call is still waiting");

    let slow = slow.await.expect("slow task").expect("slow call");
    assert_eq!(slow.text(), "slept 300ms");
    client.stop().await.expect("stop");
}

// ── Per-call failures ───────────────────────────────────────────────────────

/// A peer error reaches only its caller; the connection stays ready.
#[tokio::test]
async fn peer_error_is_surfaced_to_caller() {
    let (client, _events) = ready_client().await;

    let err = client
        .call("no/such/method", json!({}), FIVE_SECONDS)
        .await
        .expect_err("must fail");

    assert!(
        matches!(&err, AppError::Rpc { code: -32601, message, .. } if message.contains("no/such/method")),
        "got {err:?}"
    );
    assert_eq!(client.state(), ConnectionState::Ready);
    client.ping().await.expect("connection still usable");
    client.stop().await.expect("stop");
}

/// An unanswered call times out near its deadline without harming others.
#[tokio::test]
async fn unanswered_call_times_out() {
    let (client, _events) = ready_client().await;

    let started = tokio::time::Instant::now();
    let err = client
        .call(
            "tools/call",
            json!({"name": "hang", "arguments": {}}),
            Duration::from_millis(200),
        )
        .await
        .expect_err("must time out");
    let elapsed = started.elapsed();

    assert!(
        matches!(&err, AppError::Timeout { method, .. } if method == "tools/call"),
        "got {err:?}"
    );
    assert!(elapsed >= Duration::from_millis(200), "fired early: {elapsed:?}");
    assert!(elapsed < PATIENCE, "fired late: {elapsed:?}");
    assert_eq!(client.pending_requests(), 0);

    client.ping().await.expect("connection still usable");
    client.stop().await.expect("stop");
}

/// A response that arrives after its deadline is ignored.
#[tokio::test]
async fn late_response_after_timeout_is_ignored() {
    let (client, _events) = ready_client().await;

    let err = client
        .call(
            "tools/call",
            json!({"name": "delay", "arguments": {"ms": 300}}),
            Duration::from_millis(50),
        )
        .await
        .expect_err("must time out");
    assert!(matches!(err, AppError::Timeout { .. }), "got {err:?}");

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(client.state(), ConnectionState::Ready);
    let echoed = client.call("echo", json!({"after": true}), FIVE_SECONDS).await;
    assert_eq!(echoed.expect("echo"), json!({"after": true}));
    client.stop().await.expect("stop");
}

// ── Framing over a real pipe ────────────────────────────────────────────────

/// An undecodable line from the server is dropped; the call still resolves.
#[tokio::test]
async fn garbage_line_does_not_break_framing() {
    let (client, mut events) = ready_client().await;

    let result = client.call_tool("garbage", json!({})).await.expect("garbage tool");

    assert_eq!(result.text(), "after garbage");
    wait_for_event(&mut events, |e| matches!(e, ClientEvent::FrameDropped { .. })).await;
    client.stop().await.expect("stop");
}

/// A response written in two chunks is reassembled.
#[tokio::test]
async fn chunked_response_is_reassembled() {
    let (client, _events) = ready_client().await;

    let result = client.call_tool("split", json!({})).await.expect("split tool");

    assert_eq!(result.text(), "reassembled");
    client.stop().await.expect("stop");
}

// ── Server-initiated traffic ────────────────────────────────────────────────

/// Notifications from the server are delivered as events.
#[tokio::test]
async fn server_notification_becomes_event() {
    let (client, mut events) = ready_client().await;

    client.call_tool("notify", json!({})).await.expect("notify tool");

    let event = wait_for_event(&mut events, |e| matches!(e, ClientEvent::Notification { .. })).await;
    assert_eq!(
        event,
        ClientEvent::Notification {
            method: "notifications/message".into(),
            params: Some(json!({"level": "info", "data": "tool invoked"})),
        }
    );
    client.stop().await.expect("stop");
}

/// Requests from the server are delivered as events and do not disturb
/// correlation.
#[tokio::test]
async fn server_request_becomes_event() {
    let (client, mut events) = ready_client().await;

    let result = client.call_tool("ask", json!({})).await.expect("ask tool");
    assert_eq!(result.text(), "asked");

    let event = wait_for_event(&mut events, |e| matches!(e, ClientEvent::ServerRequest { .. })).await;
    assert_eq!(
        event,
        ClientEvent::ServerRequest {
            id: json!("srv-1"),
            method: "roots/list".into(),
            params: None,
        }
    );
    client.stop().await.expect("stop");
}

/// Notifications to the server need no response.
#[tokio::test]
async fn notify_writes_without_waiting() {
    let (client, _events) = ready_client().await;

    client
        .notify("notifications/cancelled", json!({"requestId": 99}))
        .await
        .expect("notify");

    assert_eq!(client.pending_requests(), 0);
    client.ping().await.expect("ping after notify");
    client.stop().await.expect("stop");
}
