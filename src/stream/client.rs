//! Resilient Event Stream Client
//!
//! Keeps exactly one live connection to the configured event source and
//! forwards well-formed frames to a single registered handler.
//!
//! ```text
//!   Disconnected ──connect()──▶ Connecting ──open──▶ Open
//!        ▲                          │                  │
//!        │                          └──error/close─────┤
//!        │                                             ▼
//!        └──────── fixed-delay timer ◀──────── Disconnected
//!                  (until attempt budget is exhausted)
//! ```
//!
//! Transport errors never reach the caller; they are logged and funnel into
//! the reconnect path. Exhausting the attempt budget is the only terminal
//! outcome and is reported through [`StreamStatus::exhausted`].

use crate::domain::ports::EventSource;
use crate::error::Error;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::StreamFrame;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the event stream client
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// Event source endpoint
    pub url: String,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay: Duration,
    /// Maximum number of consecutive reconnect attempts
    pub max_reconnect_attempts: u32,
    /// Upper bound for establishing a connection
    pub connect_timeout: Duration,
}

impl Default for StreamClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/events".to_string(),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            connect_timeout: Duration::from_secs(15),
        }
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Transport state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No connection; a reconnect may be pending
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Connected and receiving frames
    Open,
    /// Intentional shutdown in progress
    Closing,
    /// Closed by [`EventStreamClient::disconnect`]
    Closed,
    /// Unrecognized state value
    Unknown,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Open => 2,
            ConnectionState::Closing => 3,
            ConnectionState::Closed => 4,
            ConnectionState::Unknown => u8::MAX,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Open,
            3 => ConnectionState::Closing,
            4 => ConnectionState::Closed,
            _ => ConnectionState::Unknown,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Open => write!(f, "OPEN"),
            ConnectionState::Closing => write!(f, "CLOSING"),
            ConnectionState::Closed => write!(f, "CLOSED"),
            ConnectionState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Point-in-time view of the client
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub reconnect_pending: bool,
    /// Attempt budget spent; no further reconnects will be made
    pub exhausted: bool,
    pub frames_received: u64,
    pub frames_dropped: u64,
}

/// Callback invoked for every well-formed frame
pub type FrameHandler = Arc<dyn Fn(StreamFrame) + Send + Sync>;

#[derive(Debug, Default)]
struct ReconnectState {
    attempts: u32,
    in_flight: bool,
    exhausted: bool,
    /// Set by `disconnect`; no reconnect may start until `connect` is called again
    stopped: bool,
    timer: Option<CancellationToken>,
}

// =============================================================================
// Client
// =============================================================================

struct ClientInner {
    config: StreamClientConfig,
    source: Arc<dyn EventSource>,
    handler: RwLock<Option<FrameHandler>>,
    state: AtomicU8,
    reconnect: Mutex<ReconnectState>,
    /// Cancels the active connection task
    connection: Mutex<Option<CancellationToken>>,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Reconnecting event stream client
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct EventStreamClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for EventStreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStreamClient")
            .field("url", &self.inner.config.url)
            .field("state", &self.connection_state())
            .finish()
    }
}

impl EventStreamClient {
    /// Create a disconnected client
    pub fn new(config: StreamClientConfig, source: Arc<dyn EventSource>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                source,
                handler: RwLock::new(None),
                state: AtomicU8::new(ConnectionState::Disconnected.as_u8()),
                reconnect: Mutex::new(ReconnectState::default()),
                connection: Mutex::new(None),
                frames_received: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Register the frame handler, replacing any previous one
    pub fn on_data<F>(&self, handler: F)
    where
        F: Fn(StreamFrame) + Send + Sync + 'static,
    {
        let replaced = self.inner.handler.write().replace(Arc::new(handler)).is_some();
        if replaced {
            debug!("Replaced event stream handler");
        }
    }

    /// Start a connection attempt
    ///
    /// Does nothing while a connection is already being established or open,
    /// or after the reconnect budget has been exhausted.
    pub fn connect(&self) {
        self.inner.reconnect.lock().stopped = false;
        self.inner.connect();
    }

    /// Close the active connection and cancel any pending reconnect
    pub fn disconnect(&self) {
        // Lock order: connection, then reconnect
        let mut connection = self.inner.connection.lock();
        let timer = {
            let mut reconnect = self.inner.reconnect.lock();
            reconnect.stopped = true;
            reconnect.in_flight = false;
            reconnect.timer.take()
        };
        if let Some(timer) = timer {
            timer.cancel();
            info!("Cancelled pending event stream reconnect");
        }

        if let Some(token) = connection.take() {
            self.inner.set_state(ConnectionState::Closing);
            token.cancel();
            info!(url = %self.inner.config.url, "Event stream disconnected");
        }
        self.inner.set_state(ConnectionState::Closed);
    }

    /// Whether the connection is open
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Open
    }

    /// Current transport state
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Snapshot of connection and retry status
    pub fn status(&self) -> StreamStatus {
        let reconnect = self.inner.reconnect.lock();
        StreamStatus {
            state: self.inner.state(),
            reconnect_attempts: reconnect.attempts,
            reconnect_pending: reconnect.in_flight,
            exhausted: reconnect.exhausted,
            frames_received: self.inner.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.inner.frames_dropped.load(Ordering::Relaxed),
        }
    }

    /// Configured endpoint
    pub fn url(&self) -> &str {
        &self.inner.config.url
    }
}

impl ClientInner {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn connect(self: &Arc<Self>) {
        let token = {
            let mut connection = self.connection.lock();
            {
                let reconnect = self.reconnect.lock();
                if reconnect.exhausted {
                    warn!(url = %self.config.url, "Event stream reconnect budget exhausted; connect ignored");
                    return;
                }
                if reconnect.stopped {
                    debug!("Event stream stopped; connect ignored");
                    return;
                }
            }
            if matches!(
                self.state(),
                ConnectionState::Connecting | ConnectionState::Open
            ) {
                debug!("Event stream already connecting or open");
                return;
            }
            let token = CancellationToken::new();
            if let Some(previous) = connection.replace(token.clone()) {
                previous.cancel();
            }
            self.set_state(ConnectionState::Connecting);
            token
        };

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_connection(token).await });
    }

    async fn run_connection(self: Arc<Self>, cancel: CancellationToken) {
        let url = self.config.url.clone();
        info!(url = %url, "Connecting to event stream");

        let opened = tokio::select! {
            _ = cancel.cancelled() => return,
            opened = tokio::time::timeout(self.config.connect_timeout, self.source.open(&url)) => opened,
        };

        let mut frames = match opened {
            Ok(Ok(frames)) => frames,
            Ok(Err(e)) => {
                warn!(url = %url, error = %e, "Event stream connection failed");
                self.handle_close(&cancel);
                return;
            }
            Err(_) => {
                let e = Error::ConnectTimeout {
                    url: url.clone(),
                    timeout: self.config.connect_timeout,
                };
                warn!(error = %e, "Event stream connection failed");
                self.handle_close(&cancel);
                return;
            }
        };

        if !self.handle_open(&url, &cancel) {
            return;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Event stream reader stopped by disconnect");
                    return;
                }
                next = frames.next() => match next {
                    Some(Ok(raw)) => self.dispatch(&raw),
                    Some(Err(e)) => {
                        warn!(url = %url, error = %e, "Event stream transport error");
                        break;
                    }
                    None => {
                        info!(url = %url, "Event stream closed by remote");
                        break;
                    }
                }
            }
        }

        drop(frames);
        self.handle_close(&cancel);
    }

    /// Returns false if the connection was cancelled while opening
    fn handle_open(&self, url: &str, cancel: &CancellationToken) -> bool {
        let _connection = self.connection.lock();
        if cancel.is_cancelled() {
            return false;
        }
        {
            let mut reconnect = self.reconnect.lock();
            reconnect.attempts = 0;
            reconnect.in_flight = false;
            reconnect.timer = None;
        }
        self.set_state(ConnectionState::Open);
        info!(url = %url, "Event stream connected");
        true
    }

    fn handle_close(self: &Arc<Self>, cancel: &CancellationToken) {
        {
            // Checked under the lock so a concurrent disconnect is never overridden
            let mut connection = self.connection.lock();
            if cancel.is_cancelled() {
                return;
            }
            *connection = None;
            self.set_state(ConnectionState::Disconnected);
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let (timer, attempt) = {
            let mut reconnect = self.reconnect.lock();
            if reconnect.in_flight {
                debug!("Reconnect already pending");
                return;
            }
            if reconnect.exhausted || reconnect.stopped {
                return;
            }
            if reconnect.attempts >= self.config.max_reconnect_attempts {
                reconnect.exhausted = true;
                let e = Error::StreamExhausted {
                    attempts: reconnect.attempts,
                };
                error!(
                    url = %self.config.url,
                    error = %e,
                    "Event stream permanently disconnected; no further reconnect attempts"
                );
                return;
            }
            reconnect.attempts += 1;
            reconnect.in_flight = true;
            let timer = CancellationToken::new();
            reconnect.timer = Some(timer.clone());
            (timer, reconnect.attempts)
        };

        let delay = self.config.reconnect_delay;
        info!(
            attempt = attempt,
            max_attempts = self.config.max_reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling event stream reconnect"
        );

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {
                    debug!(attempt = attempt, "Pending reconnect cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    {
                        let mut reconnect = inner.reconnect.lock();
                        if reconnect.stopped {
                            return;
                        }
                        reconnect.in_flight = false;
                        reconnect.timer = None;
                    }
                    inner.connect();
                }
            }
        });
    }

    fn dispatch(&self, raw: &str) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);

        let frame = match StreamFrame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, bytes = raw.len(), "Dropping malformed event stream frame");
                return;
            }
        };

        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => handler(frame),
            None => debug!(event = %frame.event, "No event stream handler registered; frame discarded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::FrameStream;
    use crate::error::Result;
    use async_trait::async_trait;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// What the next `open` call does
    enum Script {
        Fail,
        /// Deliver frames, then the remote closes
        Close(Vec<&'static str>),
        /// Deliver frames, then stay open
        Hold(Vec<&'static str>),
    }

    struct ScriptedSource {
        scripts: Mutex<VecDeque<Script>>,
        opens: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                opens: AtomicUsize::new(0),
            })
        }

        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn open(&self, _url: &str) -> Result<FrameStream> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let script = self.scripts.lock().pop_front().unwrap_or(Script::Fail);
            match script {
                Script::Fail => Err(Error::Transport("connection refused".into())),
                Script::Close(frames) => Ok(stream::iter(
                    frames.into_iter().map(|f| Ok::<_, Error>(f.to_string())).collect::<Vec<_>>(),
                )
                .boxed()),
                Script::Hold(frames) => Ok(stream::iter(
                    frames.into_iter().map(|f| Ok::<_, Error>(f.to_string())).collect::<Vec<_>>(),
                )
                .chain(stream::pending())
                .boxed()),
            }
        }
    }

    const RECEIPT_FRAME: &str = r#"{"event":"receipt","data":"{}"}"#;

    fn test_config(delay_ms: u64, max_attempts: u32) -> StreamClientConfig {
        StreamClientConfig {
            url: "ws://test/events".to_string(),
            reconnect_delay: Duration::from_millis(delay_ms),
            max_reconnect_attempts: max_attempts,
            connect_timeout: Duration::from_secs(1),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_exhausts_after_max_attempts() {
        let source = ScriptedSource::new(vec![Script::Fail, Script::Fail, Script::Fail]);
        let client = EventStreamClient::new(test_config(10, 2), source.clone());

        client.connect();
        wait_until(|| client.status().exhausted).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Initial attempt plus two reconnects, never a third
        assert_eq!(source.opens(), 3);
        let status = client.status();
        assert_eq!(status.reconnect_attempts, 2);
        assert!(!status.reconnect_pending);
        assert_eq!(status.state, ConnectionState::Disconnected);

        client.connect();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(source.opens(), 3);
    }

    #[tokio::test]
    async fn test_open_resets_attempts() {
        let source = ScriptedSource::new(vec![Script::Fail, Script::Hold(vec![])]);
        let client = EventStreamClient::new(test_config(10, 5), source.clone());

        client.connect();
        wait_until(|| client.is_connected()).await;

        let status = client.status();
        assert_eq!(status.reconnect_attempts, 0);
        assert!(!status.reconnect_pending);
        assert_eq!(source.opens(), 2);
    }

    #[tokio::test]
    async fn test_remote_close_reconnects() {
        let source = ScriptedSource::new(vec![
            Script::Close(vec![RECEIPT_FRAME]),
            Script::Hold(vec![RECEIPT_FRAME]),
        ]);
        let client = EventStreamClient::new(test_config(10, 3), source.clone());
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        client.on_data(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        client.connect();
        wait_until(|| received.load(Ordering::SeqCst) == 2).await;

        assert_eq!(source.opens(), 2);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_malformed_frame_dropped() {
        let source = ScriptedSource::new(vec![Script::Hold(vec![
            "not json",
            r#"{"event":"receipt"}"#,
            RECEIPT_FRAME,
        ])]);
        let client = EventStreamClient::new(test_config(10, 3), source.clone());
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        client.on_data(move |frame| sink.lock().push(frame));

        client.connect();
        wait_until(|| client.status().frames_received == 3).await;

        let status = client.status();
        assert_eq!(status.frames_dropped, 2);
        assert_eq!(status.state, ConnectionState::Open);
        assert_eq!(received.lock().len(), 1);
        assert_eq!(received.lock()[0].event, "receipt");
        assert_eq!(source.opens(), 1);
    }

    #[tokio::test]
    async fn test_on_data_replaces_handler() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let source = ScriptedSource::new(vec![Script::Hold(vec![RECEIPT_FRAME])]);
        let client = EventStreamClient::new(test_config(10, 3), source);

        let counter = first.clone();
        client.on_data(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = second.clone();
        client.on_data(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        client.connect();
        wait_until(|| second.load(Ordering::SeqCst) == 1).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_reconnect() {
        let source = ScriptedSource::new(vec![Script::Fail]);
        let client = EventStreamClient::new(test_config(100, 5), source.clone());

        client.connect();
        wait_until(|| client.status().reconnect_pending).await;
        client.disconnect();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(source.opens(), 1);
        assert_eq!(client.connection_state(), ConnectionState::Closed);
        assert!(!client.status().reconnect_pending);
    }

    #[tokio::test]
    async fn test_disconnect_closes_open_connection() {
        let source = ScriptedSource::new(vec![Script::Hold(vec![])]);
        let client = EventStreamClient::new(test_config(10, 3), source.clone());

        client.connect();
        wait_until(|| client.is_connected()).await;
        client.disconnect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.connection_state(), ConnectionState::Closed);
        assert_eq!(source.opens(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_blocks_internal_reconnect_paths() {
        let source = ScriptedSource::new(vec![Script::Hold(vec![])]);
        let client = EventStreamClient::new(test_config(10, 3), source.clone());

        client.disconnect();

        // A reader that lost the race with disconnect must not reschedule
        let stale = CancellationToken::new();
        stale.cancel();
        client.inner.handle_close(&stale);
        client.inner.schedule_reconnect();
        assert!(!client.status().reconnect_pending);
        assert_eq!(client.status().reconnect_attempts, 0);

        // A timer that already fired lands in connect after disconnect
        client.inner.connect();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(source.opens(), 0);
        assert_eq!(client.connection_state(), ConnectionState::Closed);

        client.connect();
        wait_until(|| client.is_connected()).await;
        assert_eq!(source.opens(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_open_stays_closed() {
        let source = ScriptedSource::new(vec![]);
        let client = EventStreamClient::new(test_config(10, 3), source);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(!client.inner.handle_open("ws://test/events", &cancel));
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_state_encoding() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ] {
            assert_eq!(ConnectionState::from_u8(state.as_u8()), state);
        }
        assert_eq!(ConnectionState::from_u8(42), ConnectionState::Unknown);
        assert_eq!(ConnectionState::Open.to_string(), "OPEN");
    }
}
