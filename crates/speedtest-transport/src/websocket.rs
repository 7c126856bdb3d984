//! WebSocket push channel with exponential-backoff reconnect.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use speedtest_core::{
    ClientMessage, MessageDispatcher, PushChannel, ReconnectPolicy, protocol::ErrorInfo,
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

/// Close code of a deliberate, orderly shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Reported when the peer closed without a status code.
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Reported when the socket dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connection error carried by [`ConnectionEvent`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("Failed to open push channel: {0}")]
    Connect(String),
    #[error("Push channel unavailable after {attempts} reconnect attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("No async runtime to drive the push channel")]
    NoRuntime,
}

impl ConnectionError {
    /// Stable code recorded in the session's last error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::WebSocket(_) => "WEBSOCKET_ERROR",
            Self::Connect(_) | Self::NoRuntime => "CONNECTION_FAILED",
            Self::RetriesExhausted { .. } => "RECONNECT_EXHAUSTED",
        }
    }

    /// Message shown to users; transport detail stays in the logs.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::WebSocket(_) => "WebSocket connection error".to_string(),
            Self::Connect(_) | Self::NoRuntime => {
                "Failed to create WebSocket connection".to_string()
            }
            Self::RetriesExhausted { .. } => self.to_string(),
        }
    }
}

/// Lifecycle event of the push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    Closed { code: u16, reason: String },
    Error(ConnectionError),
    RetryScheduled { attempt: u32, delay: Duration },
    /// Automatic reconnection stopped; only a manual `connect` resumes it.
    GaveUp(ConnectionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Closed,
    Opening,
    Open,
}

struct ConnState {
    should_reconnect: bool,
    phase: Phase,
    retry_count: u32,
    /// Bumped on every open and on disconnect; stale driver tasks and
    /// timers compare against it and stand down.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    retry_timer: Option<JoinHandle<()>>,
}

struct Inner {
    url: String,
    policy: ReconnectPolicy,
    dispatcher: Arc<MessageDispatcher>,
    state: Mutex<ConnState>,
    connected_tx: watch::Sender<bool>,
    events_tx: broadcast::Sender<ConnectionEvent>,
}

/// Owns one push-channel connection to a runner.
///
/// Inbound text frames are handed to the [`MessageDispatcher`] in arrival
/// order from a single driver task. Dropping the manager disconnects.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager for `url`. Nothing is opened until [`connect`].
    ///
    /// [`connect`]: ConnectionManager::connect
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        policy: ReconnectPolicy,
        dispatcher: Arc<MessageDispatcher>,
    ) -> Self {
        let (connected_tx, _) = watch::channel(false);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                policy,
                dispatcher,
                state: Mutex::new(ConnState {
                    should_reconnect: false,
                    phase: Phase::Closed,
                    retry_count: 0,
                    generation: 0,
                    outbound: None,
                    retry_timer: None,
                }),
                connected_tx,
                events_tx,
            }),
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Open the channel unless it is already open or opening.
    ///
    /// Enables automatic reconnection and resets the retry count. Returns
    /// immediately; watch [`connected`](Self::connected) for the outcome.
    pub fn connect(&self) {
        let mut st = self.inner.lock();
        st.should_reconnect = true;
        st.retry_count = 0;

        if st.phase != Phase::Closed {
            tracing::debug!(url = %self.inner.url, "Push channel already open or opening");
            return;
        }
        if let Some(timer) = st.retry_timer.take() {
            timer.abort();
        }
        self.inner.open(&mut st);
    }

    /// Close the channel with a normal-closure code and stop reconnecting.
    pub fn disconnect(&self) {
        let mut st = self.inner.lock();
        st.should_reconnect = false;
        if let Some(timer) = st.retry_timer.take() {
            timer.abort();
        }
        if let Some(outbound) = st.outbound.take() {
            let _ = outbound.send(Message::Close(Some(normal_close_frame())));
        }

        let was_closed = st.phase == Phase::Closed;
        st.phase = Phase::Closed;
        st.generation += 1;
        drop(st);

        self.inner.connected_tx.send_replace(false);
        if !was_closed {
            tracing::info!(url = %self.inner.url, "Push channel disconnected");
            self.inner.emit(ConnectionEvent::Closed {
                code: NORMAL_CLOSURE,
                reason: CLIENT_CLOSE_REASON.to_string(),
            });
        }
    }

    /// Queue a message on the open channel.
    ///
    /// Returns `false` if the channel is not open; the message is dropped.
    pub fn send(&self, message: &ClientMessage) -> bool {
        let st = self.inner.lock();
        let outbound = match (&st.outbound, st.phase) {
            (Some(outbound), Phase::Open) => outbound,
            _ => {
                tracing::debug!("Push channel not open, message not sent");
                return false;
            }
        };

        match serde_json::to_string(message) {
            Ok(json) => outbound.send(Message::Text(json.into())).is_ok(),
            Err(e) => {
                tracing::error!("Failed to serialize client message: {e}");
                false
            }
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        *self.inner.connected_tx.borrow()
    }

    /// Receiver of the connected/disconnected signal.
    #[must_use]
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.inner.connected_tx.subscribe()
    }

    /// Receiver of lifecycle events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Reconnect attempts made since the last successful open.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.inner.lock().retry_count
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl PushChannel for ConnectionManager {
    fn is_connected(&self) -> bool {
        Self::is_connected(self)
    }

    fn connect(&self) {
        Self::connect(self);
    }

    fn send(&self, message: &ClientMessage) -> bool {
        Self::send(self, message)
    }
}

const CLIENT_CLOSE_REASON: &str = "Client disconnected";

fn normal_close_frame() -> CloseFrame {
    CloseFrame {
        code: CloseCode::Normal,
        reason: CLIENT_CLOSE_REASON.into(),
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn report_error(&self, error: ConnectionError) {
        self.dispatcher
            .report_error(ErrorInfo::new(error.user_message(), error.code()));
        self.emit(ConnectionEvent::Error(error));
    }

    /// Spawn a driver task for a new channel. Caller holds the state lock.
    fn open(self: &Arc<Self>, st: &mut ConnState) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(url = %self.url, "Cannot open push channel outside a tokio runtime");
            self.report_error(ConnectionError::NoRuntime);
            return;
        };

        st.phase = Phase::Opening;
        st.generation += 1;
        let generation = st.generation;
        let inner = Arc::clone(self);
        runtime.spawn(async move { inner.run(generation).await });
    }

    async fn run(self: Arc<Self>, generation: u64) {
        tracing::debug!(url = %self.url, generation, "Opening push channel");

        let ws = match connect_async(self.url.as_str()).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                tracing::warn!(url = %self.url, error = %e, "Failed to open push channel");
                self.report_error(ConnectionError::Connect(e.to_string()));
                self.on_closed(generation, ABNORMAL_CLOSURE, e.to_string());
                return;
            }
        };

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let stale = {
            let mut st = self.lock();
            let stale = st.generation != generation;
            if !stale {
                st.phase = Phase::Open;
                st.retry_count = 0;
                st.outbound = Some(outbound_tx);
            }
            stale
        };
        if stale {
            tracing::debug!(url = %self.url, "Disconnected during handshake, closing");
            let mut ws = ws;
            let _ = ws.close(Some(normal_close_frame())).await;
            return;
        }
        self.connected_tx.send_replace(true);
        self.emit(ConnectionEvent::Opened);
        tracing::info!(url = %self.url, "Push channel connected");

        let (mut sink, mut stream) = ws.split();
        let (code, reason) = loop {
            tokio::select! {
                outbound = outbound_rx.recv() => {
                    let Some(msg) = outbound else {
                        let _ = sink.send(Message::Close(Some(normal_close_frame()))).await;
                        break (NORMAL_CLOSURE, CLIENT_CLOSE_REASON.to_string());
                    };
                    let closing = matches!(msg, Message::Close(_));
                    if let Err(e) = sink.send(msg).await {
                        self.report_error(ConnectionError::WebSocket(e.to_string()));
                        break (ABNORMAL_CLOSURE, e.to_string());
                    }
                    if closing {
                        break (NORMAL_CLOSURE, CLIENT_CLOSE_REASON.to_string());
                    }
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        self.dispatcher.dispatch(text.as_str());
                    }
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => {
                            self.dispatcher.dispatch(text);
                        }
                        Err(_) => tracing::warn!("Non UTF-8 binary frame, dropping"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or_else(
                            || (NO_STATUS_RECEIVED, String::new()),
                            |f| (u16::from(f.code), f.reason.as_str().to_string()),
                        );
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!(url = %self.url, error = %e, "WebSocket error");
                        self.report_error(ConnectionError::WebSocket(e.to_string()));
                        break (ABNORMAL_CLOSURE, e.to_string());
                    }
                    None => break (ABNORMAL_CLOSURE, "connection reset".to_string()),
                },
            }
        };

        self.on_closed(generation, code, reason);
    }

    fn on_closed(self: &Arc<Self>, generation: u64, code: u16, reason: String) {
        let mut st = self.lock();
        if st.generation != generation {
            return;
        }
        st.phase = Phase::Closed;
        st.outbound = None;
        self.connected_tx.send_replace(false);
        tracing::info!(url = %self.url, code, %reason, "Push channel closed");
        self.emit(ConnectionEvent::Closed { code, reason });

        if code == NORMAL_CLOSURE || !st.should_reconnect {
            return;
        }

        if st.retry_count >= self.policy.max_attempts {
            let error = ConnectionError::RetriesExhausted {
                attempts: st.retry_count,
            };
            tracing::warn!(url = %self.url, attempts = st.retry_count, "Giving up on push channel");
            self.dispatcher
                .report_error(ErrorInfo::new(error.user_message(), error.code()));
            self.emit(ConnectionEvent::GaveUp(error));
            return;
        }

        let delay = self.policy.delay_for(st.retry_count);
        let attempt = st.retry_count + 1;
        tracing::info!(url = %self.url, attempt, ?delay, "Scheduling push channel reconnect");
        self.emit(ConnectionEvent::RetryScheduled { attempt, delay });

        let weak = Arc::downgrade(self);
        st.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.reconnect(generation);
            }
        }));
    }

    fn reconnect(self: &Arc<Self>, generation: u64) {
        let mut st = self.lock();
        st.retry_timer = None;
        if !st.should_reconnect || st.phase != Phase::Closed || st.generation != generation {
            return;
        }
        st.retry_count += 1;
        tracing::info!(url = %self.url, attempt = st.retry_count, "Reconnecting push channel");
        self.open(&mut st);
    }
}
