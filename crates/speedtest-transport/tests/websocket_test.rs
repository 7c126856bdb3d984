//! Push channel against a local WebSocket server.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use serde_json::json;
use speedtest_core::{ClientMessage, MessageDispatcher, ReconnectPolicy};
use speedtest_transport::websocket::{
    ConnectionError, ConnectionEvent, ConnectionManager, NORMAL_CLOSURE,
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc},
    time::timeout,
};
use tokio_tungstenite::{WebSocketStream, tungstenite::Message};

const WAIT: Duration = Duration::from_secs(5);

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        max_attempts: 3,
    }
}

/// Address nothing listens on.
async fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);
    url
}

/// Accept connections forever, handing each one to `handler` with its
/// 1-based accept number.
async fn spawn_server<F, Fut>(handler: F) -> (String, Arc<AtomicUsize>)
where
    F: Fn(WebSocketStream<TcpStream>, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                continue;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::spawn(handler(ws, n));
        }
    });

    (format!("ws://{addr}"), accepted)
}

async fn wait_for<F>(rx: &mut broadcast::Receiver<ConnectionEvent>, mut pred: F) -> ConnectionEvent
where
    F: FnMut(&ConnectionEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = rx.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for connection event")
}

async fn wait_connected(manager: &ConnectionManager, want: bool) {
    let mut rx = manager.connected();
    timeout(WAIT, rx.wait_for(|c| *c == want))
        .await
        .expect("timed out waiting for connection state")
        .unwrap();
}

#[tokio::test]
async fn test_frames_reach_dispatcher_in_order() {
    let (url, _) = spawn_server(|mut ws, _| async move {
        for name in ["alpha", "beta", "gamma"] {
            let frame = json!({
                "type": "session-result",
                "data": {"target_name": name, "target_type": "vmess", "status": "success"}
            });
            ws.send(Message::Text(frame.to_string().into())).await.unwrap();
        }
        let _ = ws.next().await;
    })
    .await;

    let dispatcher = Arc::new(MessageDispatcher::new());
    let manager = ConnectionManager::new(url, fast_policy(), Arc::clone(&dispatcher));
    let mut updates = dispatcher.subscribe();
    manager.connect();

    for _ in 0..3 {
        timeout(WAIT, updates.recv()).await.unwrap().unwrap();
    }
    let names: Vec<_> = dispatcher
        .snapshot()
        .results()
        .iter()
        .map(|r| r.target_name.clone())
        .collect();
    assert_eq!(names, ["alpha", "beta", "gamma"]);
}

#[tokio::test]
async fn test_send_only_while_open() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    let (url, _) = spawn_server(move |mut ws, _| {
        let seen_tx = seen_tx.clone();
        async move {
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let _ = seen_tx.send(text.as_str().to_string());
                }
            }
        }
    })
    .await;

    let manager = ConnectionManager::new(url, fast_policy(), Arc::new(MessageDispatcher::new()));
    assert!(!manager.send(&ClientMessage::stop_test("early")));

    manager.connect();
    wait_connected(&manager, true).await;
    assert!(manager.send(&ClientMessage::stop_test("task-9")));

    let raw = timeout(WAIT, seen_rx.recv()).await.unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["type"], "stop_test");
    assert_eq!(value["taskId"], "task-9");
}

#[tokio::test]
async fn test_disconnect_closes_normally_without_reconnect() {
    let (close_tx, mut close_rx) = mpsc::unbounded_channel();
    let (url, accepted) = spawn_server(move |mut ws, _| {
        let close_tx = close_tx.clone();
        async move {
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Close(frame) = msg {
                    let _ = close_tx.send(frame.map(|f| u16::from(f.code)));
                }
            }
        }
    })
    .await;

    let manager = ConnectionManager::new(url, fast_policy(), Arc::new(MessageDispatcher::new()));
    let mut events = manager.subscribe();
    manager.connect();
    wait_connected(&manager, true).await;

    manager.disconnect();
    assert!(!manager.is_connected());
    let closed = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Closed { .. })).await;
    assert!(matches!(closed, ConnectionEvent::Closed { code: NORMAL_CLOSURE, .. }));

    let code = timeout(WAIT, close_rx.recv()).await.unwrap().unwrap();
    assert_eq!(code, Some(NORMAL_CLOSURE));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert!(!manager.send(&ClientMessage::stop_test("late")));
}

#[tokio::test]
async fn test_retries_stop_at_cap_until_manual_connect() {
    let url = refused_url().await;
    let dispatcher = Arc::new(MessageDispatcher::new());
    let manager = ConnectionManager::new(url, fast_policy(), Arc::clone(&dispatcher));
    let mut events = manager.subscribe();
    manager.connect();

    let mut scheduled = Vec::new();
    let gave_up = wait_for(&mut events, |e| {
        if let ConnectionEvent::RetryScheduled { attempt, delay } = e {
            scheduled.push((*attempt, *delay));
        }
        matches!(e, ConnectionEvent::GaveUp(_))
    })
    .await;

    assert!(matches!(gave_up, ConnectionEvent::GaveUp(_)));
    assert_eq!(
        scheduled,
        [
            (1, Duration::from_millis(10)),
            (2, Duration::from_millis(20)),
            (3, Duration::from_millis(40)),
        ]
    );
    assert_eq!(manager.retry_count(), 3);
    assert_eq!(
        dispatcher
            .snapshot()
            .last_error()
            .and_then(|e| e.code.as_deref()),
        Some("RECONNECT_EXHAUSTED")
    );

    manager.connect();
    assert_eq!(manager.retry_count(), 0);
    let next = wait_for(&mut events, |e| matches!(e, ConnectionEvent::RetryScheduled { .. })).await;
    assert!(matches!(next, ConnectionEvent::RetryScheduled { attempt: 1, .. }));
    manager.disconnect();
}

#[tokio::test]
async fn test_abnormal_drop_reconnects_and_resets_count() {
    let (url, accepted) = spawn_server(|ws, n| async move {
        if n == 1 {
            // Vanish without a close frame.
            drop(ws);
            return;
        }
        let mut ws = ws;
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;

    let manager = ConnectionManager::new(url, fast_policy(), Arc::new(MessageDispatcher::new()));
    let mut events = manager.subscribe();
    manager.connect();

    wait_for(&mut events, |e| matches!(e, ConnectionEvent::RetryScheduled { attempt: 1, .. })).await;
    wait_for(&mut events, |e| matches!(e, ConnectionEvent::Opened)).await;

    assert!(manager.is_connected());
    assert_eq!(manager.retry_count(), 0);
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let (url, accepted) = spawn_server(|mut ws, _| async move {
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;

    let manager = ConnectionManager::new(url, fast_policy(), Arc::new(MessageDispatcher::new()));
    manager.connect();
    manager.connect();
    wait_connected(&manager, true).await;
    manager.connect();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_refused_connection_reports_error() {
    let dispatcher = Arc::new(MessageDispatcher::new());
    let manager = ConnectionManager::new(refused_url().await, fast_policy(), Arc::clone(&dispatcher));
    let mut events = manager.subscribe();
    manager.connect();

    let event = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Error(_))).await;
    assert!(matches!(event, ConnectionEvent::Error(ConnectionError::Connect(_))));

    let state = dispatcher.snapshot();
    let error = state.last_error().unwrap();
    assert_eq!(error.code.as_deref(), Some("CONNECTION_FAILED"));
    assert_eq!(error.message, "Failed to create WebSocket connection");
    manager.disconnect();
}

#[tokio::test]
async fn test_protocol_violation_reports_websocket_error() {
    let (url, _) = spawn_server(|mut ws, n| async move {
        if n == 1 {
            // Frame header with reserved bits set.
            let _ = ws.get_mut().write_all(&[0xF1, 0x00]).await;
        }
        while let Some(Ok(_)) = ws.next().await {}
    })
    .await;

    let dispatcher = Arc::new(MessageDispatcher::new());
    let manager = ConnectionManager::new(url, fast_policy(), Arc::clone(&dispatcher));
    let mut events = manager.subscribe();
    manager.connect();

    let event = wait_for(&mut events, |e| matches!(e, ConnectionEvent::Error(_))).await;
    assert!(matches!(event, ConnectionEvent::Error(ConnectionError::WebSocket(_))));

    let state = dispatcher.snapshot();
    let error = state.last_error().unwrap();
    assert_eq!(error.code.as_deref(), Some("WEBSOCKET_ERROR"));
    assert_eq!(error.message, "WebSocket connection error");

    wait_for(&mut events, |e| matches!(e, ConnectionEvent::RetryScheduled { attempt: 1, .. })).await;
    manager.disconnect();
}

#[tokio::test]
async fn test_disconnect_cancels_scheduled_retry() {
    let (url, accepted) = spawn_server(|ws, _| async move {
        drop(ws);
    })
    .await;

    let policy = ReconnectPolicy {
        base_delay: Duration::from_millis(200),
        ..fast_policy()
    };
    let manager = ConnectionManager::new(url, policy, Arc::new(MessageDispatcher::new()));
    let mut events = manager.subscribe();
    manager.connect();

    wait_for(&mut events, |e| matches!(e, ConnectionEvent::RetryScheduled { .. })).await;
    manager.disconnect();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert!(!manager.is_connected());
    assert_eq!(manager.retry_count(), 0);
}

#[tokio::test]
async fn test_default_policy_gives_up_after_five_attempts() {
    let policy = ReconnectPolicy {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        ..ReconnectPolicy::default()
    };
    let manager = ConnectionManager::new(refused_url().await, policy, Arc::new(MessageDispatcher::new()));
    let mut events = manager.subscribe();
    manager.connect();

    let mut attempts = Vec::new();
    let gave_up = wait_for(&mut events, |e| {
        if let ConnectionEvent::RetryScheduled { attempt, .. } = e {
            attempts.push(*attempt);
        }
        matches!(e, ConnectionEvent::GaveUp(_))
    })
    .await;

    assert_eq!(attempts, [1, 2, 3, 4, 5]);
    assert_eq!(
        gave_up,
        ConnectionEvent::GaveUp(ConnectionError::RetriesExhausted { attempts: 5 })
    );
    assert_eq!(manager.retry_count(), 5);
}
