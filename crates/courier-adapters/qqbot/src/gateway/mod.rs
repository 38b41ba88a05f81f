//! QQ WebSocket gateway client.
//!
//! A [`GatewayClient`] owns one long-lived socket to the QQ gateway and drives
//! it through the connection state machine:
//!
//! ```text
//!            start()
//!   Idle ───────────► Connecting ──open──► Authenticating ──READY/RESUMED──► Ready
//!                        ▲    │                  │                              │
//!                        │    └──────failure─────┴────close / op 7 / op 9 ──────┤
//!                        │                                 heartbeat timeout    │
//!                        │                                                      ▼
//!                        └──────────────── backoff delay ◄────────────── Reconnecting
//!
//!   stop() from any state ──► Stopped
//! ```
//!
//! Reconnect delays follow a [`BackoffSchedule`] indexed by the number of
//! consecutive failed attempts; the counter resets only on `READY`/`RESUMED`.
//! When a session id is held the client resumes (op 6) instead of
//! identifying (op 2); "invalid session" (op 9) and close codes 4006/4007/4009
//! drop the session first.
//!
//! The outcome of the first connection attempt is reported by
//! [`GatewayClient::start`]:
//!
//! | First attempt | `start()` |
//! |---------------|-----------|
//! | reached `Ready` | `Ok` |
//! | credentials rejected | `Err`, client stopped |
//! | transport failure | `Ok`, reconnecting in the background |
//!
//! Everything else is published as [`GatewayEvent`]s on an `mpsc` channel in
//! arrival order.

mod frame;

pub use frame::{CloseAction, Frame, Intents, OpCode, close_action};

use std::future::pending;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use courier_core::{ApiError, ApiResult, AuthError, ChannelError, ChannelResult, ConnectionError};
use courier_transport::websocket::{self, Message, WsSink, WsSource};
use courier_transport::{Backoff, BackoffSchedule};

use crate::event::{self, QqMessageEvent};

const EVENT_BUFFER: usize = 256;

// =============================================================================
// Public Types
// =============================================================================

/// State of the gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    /// Constructed, never started.
    Idle,
    /// Resolving credentials and opening the socket.
    Connecting,
    /// Socket open, handshake in progress.
    Authenticating,
    /// Session established, events flowing.
    Ready,
    /// Waiting out a backoff delay.
    Reconnecting,
    /// Stopped for good.
    Stopped,
}

impl std::fmt::Display for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Session data needed to resume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewaySession {
    /// Id assigned by `READY`.
    pub session_id: Option<String>,
    /// Highest sequence number seen.
    pub last_sequence: Option<u64>,
}

impl GatewaySession {
    /// Raises the tracked sequence; never lowers it.
    pub fn observe(&mut self, seq: u64) {
        if self.last_sequence.is_none_or(|last| seq > last) {
            self.last_sequence = Some(seq);
        }
    }

    /// Forgets the session so the next connection identifies afresh.
    pub fn reset(&mut self) {
        self.session_id = None;
        self.last_sequence = None;
    }

    fn resumable(&self) -> Option<(&str, u64)> {
        Some((self.session_id.as_deref()?, self.last_sequence.unwrap_or(0)))
    }
}

/// Event published by the gateway.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A new session was established.
    Ready {
        /// Session id.
        session_id: String,
        /// Bot user name, if the server sent one.
        username: Option<String>,
    },
    /// A previous session was resumed.
    Resumed,
    /// A message event arrived.
    Message(Box<QqMessageEvent>),
    /// The connection was lost; a reconnect is scheduled.
    Disconnected {
        /// Why the connection ended.
        reason: String,
        /// Zero-based index of the reconnect attempt.
        attempt: usize,
        /// Delay before the attempt.
        retry_in: Duration,
    },
    /// A non-fatal error worth surfacing.
    Error(String),
}

/// Source of gateway credentials and endpoint.
#[async_trait]
pub trait GatewayCredentials: Send + Sync {
    /// Returns a valid access token.
    async fn access_token(&self) -> Result<String, AuthError>;

    /// Returns the WebSocket endpoint.
    async fn gateway_url(&self) -> ApiResult<String>;

    /// Forgets the cached token after the gateway rejected it.
    fn invalidate_token(&self);
}

/// Tunables of the gateway client.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Subscribed intents.
    pub intents: Intents,
    /// Reconnect delays.
    pub backoff: BackoffSchedule,
    /// Deadline for the socket to open.
    pub connect_timeout: Duration,
    /// Deadline for Hello plus READY/RESUMED after the socket opened.
    pub handshake_timeout: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            intents: Intents::default(),
            backoff: BackoffSchedule::default(),
            connect_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

// =============================================================================
// Gateway Client
// =============================================================================

#[derive(Debug)]
struct Shared {
    state: RwLock<GatewayState>,
    session: Mutex<GatewaySession>,
}

impl Shared {
    fn set_state(&self, state: GatewayState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(from = %*current, to = %state, "Gateway state changed");
            *current = state;
        }
    }
}

/// Client for one QQ gateway connection.
///
/// A client runs once: after [`stop`](Self::stop) it stays `Stopped` and a
/// new client is needed to connect again.
pub struct GatewayClient {
    credentials: Arc<dyn GatewayCredentials>,
    options: GatewayOptions,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayClient {
    /// Creates an idle client.
    pub fn new(credentials: Arc<dyn GatewayCredentials>, options: GatewayOptions) -> Self {
        Self {
            credentials,
            options,
            shared: Arc::new(Shared {
                state: RwLock::new(GatewayState::Idle),
                session: Mutex::new(GatewaySession::default()),
            }),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> GatewayState {
        *self.shared.state.read()
    }

    /// Copy of the session data.
    pub fn session(&self) -> GatewaySession {
        self.shared.session.lock().clone()
    }

    /// Spawns the connection task and waits for the first attempt's outcome.
    pub async fn start(&self) -> ChannelResult<mpsc::Receiver<GatewayEvent>> {
        if self.state() != GatewayState::Idle {
            return Err(ChannelError::other(format!(
                "gateway client cannot start from state {}",
                self.state()
            )));
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (first_tx, first_rx) = oneshot::channel();
        let runner = Runner {
            credentials: self.credentials.clone(),
            options: self.options.clone(),
            shared: self.shared.clone(),
            cancel: self.cancel.clone(),
            events: events_tx,
            backoff: Backoff::new(self.options.backoff.clone()),
            first_outcome: Some(first_tx),
        };
        self.shared.set_state(GatewayState::Connecting);
        *self.task.lock() = Some(tokio::spawn(supervise(runner)));

        match first_rx.await {
            Ok(Ok(())) => Ok(events_rx),
            Ok(Err(e)) => {
                self.stop().await;
                Err(e)
            }
            Err(_) => {
                self.stop().await;
                Err(ChannelError::other("gateway task ended before connecting"))
            }
        }
    }

    /// Cancels reconnects and heartbeats, closes the socket and joins the task.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!(error = %e, "Gateway task panicked");
        }
        self.shared.set_state(GatewayState::Stopped);
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// =============================================================================
// Connection Loop
// =============================================================================

/// Why a connection attempt ended.
enum Ending {
    /// `stop()` was called.
    Cancelled,
    /// The platform refused the credentials.
    AuthRejected(AuthError),
    /// Transport or protocol trouble; reconnect.
    Reconnect {
        reason: String,
        reset_session: bool,
    },
}

impl Ending {
    fn reconnect(reason: impl std::fmt::Display) -> Self {
        Self::Reconnect {
            reason: reason.to_string(),
            reset_session: false,
        }
    }

    fn invalid_session(reason: impl std::fmt::Display) -> Self {
        Self::Reconnect {
            reason: reason.to_string(),
            reset_session: true,
        }
    }
}

fn classify_api_error(err: ApiError) -> Ending {
    match err {
        ApiError::Auth(AuthError::Rejected { code, message }) => {
            Ending::AuthRejected(AuthError::Rejected { code, message })
        }
        ApiError::Status { status: 401, body, .. } => {
            Ending::AuthRejected(AuthError::rejected(401, body))
        }
        other => Ending::reconnect(other),
    }
}

type FirstOutcome = oneshot::Sender<ChannelResult<()>>;

/// Runs the connection loop and reports a crash to the event receiver.
async fn supervise(runner: Runner) {
    let events = runner.events.clone();
    let shared = runner.shared.clone();
    let cancel = runner.cancel.clone();
    if AssertUnwindSafe(runner.run()).catch_unwind().await.is_err() && !cancel.is_cancelled() {
        error!("Gateway task panicked");
        shared.set_state(GatewayState::Stopped);
        let _ = events.try_send(GatewayEvent::Error("gateway task panicked".into()));
    }
}

struct Runner {
    credentials: Arc<dyn GatewayCredentials>,
    options: GatewayOptions,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    events: mpsc::Sender<GatewayEvent>,
    backoff: Backoff,
    first_outcome: Option<FirstOutcome>,
}

/// Per-connection bookkeeping.
struct Connection {
    sink: WsSink,
    heartbeat: Option<Interval>,
    awaiting_ack: bool,
    ready: bool,
    handshake_deadline: Instant,
}

impl Runner {
    async fn run(mut self) {
        loop {
            self.shared.set_state(GatewayState::Connecting);
            let ending = self.connect_once().await;

            let (reason, reset_session) = match ending {
                Ending::Cancelled => break,
                Ending::AuthRejected(err) => {
                    self.credentials.invalidate_token();
                    if let Some(first) = self.first_outcome.take() {
                        error!(error = %err, "Gateway authentication rejected");
                        let _ = first.send(Err(err.into()));
                        break;
                    }
                    warn!(error = %err, "Gateway authentication rejected, reconnecting");
                    self.emit(GatewayEvent::Error(err.to_string())).await;
                    (err.to_string(), true)
                }
                Ending::Reconnect {
                    reason,
                    reset_session,
                } => (reason, reset_session),
            };

            if reset_session {
                self.shared.session.lock().reset();
            }
            if let Some(first) = self.first_outcome.take() {
                // The channel runs; the initial failure is reported as an event.
                let _ = first.send(Ok(()));
            }

            self.shared.set_state(GatewayState::Reconnecting);
            let attempt = self.backoff.attempt();
            let delay = self.backoff.next_delay();
            warn!(attempt, ?delay, %reason, "Gateway disconnected, reconnecting");
            self.emit(GatewayEvent::Disconnected {
                reason,
                attempt,
                retry_in: delay,
            })
            .await;

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.shared.set_state(GatewayState::Stopped);
        debug!("Gateway task finished");
    }

    /// Publishes an event; gives up once the client is stopped, since the
    /// receiver may be the very task waiting for the stop.
    async fn emit(&self, event: GatewayEvent) {
        tokio::select! {
            _ = self.cancel.cancelled() => trace!("Gateway stopped, dropping event"),
            sent = self.events.send(event) => {
                if sent.is_err() {
                    trace!("Gateway event receiver dropped");
                }
            }
        }
    }

    async fn connect_once(&mut self) -> Ending {
        let token = match self.credentials.access_token().await {
            Ok(token) => token,
            Err(AuthError::Rejected { code, message }) => {
                return Ending::AuthRejected(AuthError::Rejected { code, message });
            }
            Err(e) => return Ending::reconnect(e),
        };
        let url = match self.credentials.gateway_url().await {
            Ok(url) => url,
            Err(e) => return classify_api_error(e),
        };

        info!(%url, "Connecting to QQ gateway");
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return Ending::Cancelled,
            opened = websocket::connect(&url, self.options.connect_timeout) => opened,
        };
        let (sink, mut source) = match opened {
            Ok(halves) => halves,
            Err(e) => return Ending::reconnect(e),
        };

        self.shared.set_state(GatewayState::Authenticating);
        let mut conn = Connection {
            sink,
            heartbeat: None,
            awaiting_ack: false,
            ready: false,
            handshake_deadline: Instant::now() + self.options.handshake_timeout,
        };

        let ending = self.drive(&mut conn, &mut source, &token).await;
        if !matches!(ending, Ending::Cancelled) {
            let _ = conn.sink.close().await;
        }
        ending
    }

    async fn drive(&mut self, conn: &mut Connection, source: &mut WsSource, token: &str) -> Ending {
        loop {
            let ready = conn.ready;
            let deadline = conn.handshake_deadline;
            let interval = conn.heartbeat.as_mut();
            let heartbeat_tick = async move {
                match interval {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => pending::<()>().await,
                }
            };
            let handshake_deadline = async move {
                if ready {
                    pending::<()>().await;
                } else {
                    tokio::time::sleep_until(deadline).await;
                }
            };

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    let _ = conn.sink.send(Message::Close(None)).await;
                    return Ending::Cancelled;
                }
                _ = handshake_deadline => {
                    return Ending::reconnect(ConnectionError::Timeout("gateway handshake".into()));
                }
                message = source.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(ending) = self.handle_frame(conn, text.as_str(), token).await {
                            return ending;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let err = websocket::closed(frame.as_ref());
                        let code = match &err {
                            ConnectionError::Closed { code, .. } => *code,
                            _ => 0,
                        };
                        return match close_action(code) {
                            CloseAction::AuthRejected => {
                                Ending::AuthRejected(AuthError::rejected(i64::from(code), err.to_string()))
                            }
                            CloseAction::InvalidateSession => Ending::invalid_session(err),
                            CloseAction::Reconnect => Ending::reconnect(err),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Ending::reconnect(ConnectionError::Closed {
                        code: 0,
                        reason: e.to_string(),
                    }),
                    None => return Ending::reconnect(websocket::closed(None)),
                },
                // After the socket: an ack already queued must count before
                // an overdue tick declares the link dead.
                _ = heartbeat_tick => {
                    if conn.awaiting_ack {
                        return Ending::reconnect(ConnectionError::Timeout("heartbeat not acknowledged".into()));
                    }
                    if let Err(e) = self.send_heartbeat(conn).await {
                        return Ending::reconnect(e);
                    }
                    conn.awaiting_ack = true;
                }
            }
        }
    }

    async fn send_frame(&self, conn: &mut Connection, frame: &Frame) -> Result<(), ConnectionError> {
        conn.sink
            .send(Message::Text(frame.to_text().into()))
            .await
            .map_err(|e| ConnectionError::SendFailed(e.to_string()))
    }

    async fn send_heartbeat(&self, conn: &mut Connection) -> Result<(), ConnectionError> {
        let seq = self.shared.session.lock().last_sequence;
        trace!(?seq, "Sending heartbeat");
        self.send_frame(conn, &Frame::heartbeat(seq)).await
    }

    /// Handles one text frame; returns `Some` when the connection must end.
    async fn handle_frame(&mut self, conn: &mut Connection, text: &str, token: &str) -> Option<Ending> {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed gateway frame");
                return None;
            }
        };
        if let Some(seq) = frame.s {
            self.shared.session.lock().observe(seq);
        }

        match frame.opcode() {
            Some(OpCode::Hello) => {
                if conn.heartbeat.is_some() {
                    return None;
                }
                let interval_ms = frame.heartbeat_interval_ms().unwrap_or(41_250).max(1);
                let period = Duration::from_millis(interval_ms);
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                conn.heartbeat = Some(interval);

                let resume = self
                    .shared
                    .session
                    .lock()
                    .resumable()
                    .map(|(id, seq)| (id.to_string(), seq));
                let handshake = match resume {
                    Some((session_id, seq)) => {
                        info!(%session_id, seq, "Resuming gateway session");
                        Frame::resume(token, &session_id, seq)
                    }
                    None => {
                        debug!(intents = self.options.intents.bits(), "Identifying");
                        Frame::identify(token, self.options.intents)
                    }
                };
                if let Err(e) = self.send_frame(conn, &handshake).await {
                    return Some(Ending::reconnect(e));
                }
            }
            Some(OpCode::HeartbeatAck) => {
                trace!("Heartbeat acknowledged");
                conn.awaiting_ack = false;
            }
            Some(OpCode::Heartbeat) => {
                trace!("Server requested heartbeat");
                if let Err(e) = self.send_heartbeat(conn).await {
                    return Some(Ending::reconnect(e));
                }
            }
            Some(OpCode::Reconnect) => {
                info!("Server requested reconnect");
                return Some(Ending::reconnect("server requested reconnect"));
            }
            Some(OpCode::InvalidSession) => {
                warn!("Gateway session invalidated");
                return Some(Ending::invalid_session("invalid session"));
            }
            Some(OpCode::Dispatch) => {
                self.handle_dispatch(conn, frame.t.as_deref().unwrap_or_default(), &frame.d)
                    .await;
            }
            Some(OpCode::Identify | OpCode::Resume) | None => {
                debug!(op = frame.op, "Ignoring unexpected gateway frame");
            }
        }
        None
    }

    async fn handle_dispatch(&mut self, conn: &mut Connection, tag: &str, data: &Value) {
        match tag {
            "READY" => {
                let session_id = data
                    .get("session_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let username = data
                    .pointer("/user/username")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.shared.session.lock().session_id = Some(session_id.clone());
                info!(%session_id, username = ?username, "Gateway ready");
                self.on_ready(conn);
                self.emit(GatewayEvent::Ready {
                    session_id,
                    username,
                })
                .await;
            }
            "RESUMED" => {
                info!("Gateway session resumed");
                self.on_ready(conn);
                self.emit(GatewayEvent::Resumed).await;
            }
            _ => match event::decode(tag, data) {
                Some(Ok(message)) => {
                    trace!(tag, id = %message.id, "Message event");
                    self.emit(GatewayEvent::Message(Box::new(message))).await;
                }
                Some(Err(e)) => warn!(tag, error = %e, "Dropping undecodable event"),
                None => debug!(tag, "Ignoring event"),
            },
        }
    }

    fn on_ready(&mut self, conn: &mut Connection) {
        conn.ready = true;
        self.backoff.reset();
        self.shared.set_state(GatewayState::Ready);
        if let Some(first) = self.first_outcome.take() {
            let _ = first.send(Ok(()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::WebSocketStream;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    type ServerSocket = WebSocketStream<TcpStream>;

    struct FakeCredentials {
        url: Mutex<String>,
        invalidated: AtomicUsize,
    }

    #[async_trait]
    impl GatewayCredentials for FakeCredentials {
        async fn access_token(&self) -> Result<String, AuthError> {
            Ok("test-token".into())
        }

        async fn gateway_url(&self) -> ApiResult<String> {
            Ok(self.url.lock().clone())
        }

        fn invalidate_token(&self) {
            self.invalidated.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct TestServer {
        url: String,
        connections: mpsc::UnboundedReceiver<ServerSocket>,
    }

    impl TestServer {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("ws://{}", listener.local_addr().unwrap());
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(async move {
                while let Ok((tcp, _)) = listener.accept().await {
                    if let Ok(ws) = tokio_tungstenite::accept_async(tcp).await {
                        if tx.send(ws).is_err() {
                            break;
                        }
                    }
                }
            });
            Self {
                url,
                connections: rx,
            }
        }

        async fn accept(&mut self) -> ServerSocket {
            tokio::time::timeout(Duration::from_secs(5), self.connections.recv())
                .await
                .expect("no connection")
                .expect("server closed")
        }
    }

    async fn send(ws: &mut ServerSocket, value: Value) {
        ws.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    async fn recv(ws: &mut ServerSocket) -> Value {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("no frame")
                .expect("socket ended")
                .unwrap();
            if let Message::Text(text) = message {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn hello(ws: &mut ServerSocket, interval_ms: u64) {
        send(ws, json!({"op": 10, "d": {"heartbeat_interval": interval_ms}})).await;
    }

    async fn next_event(rx: &mut mpsc::Receiver<GatewayEvent>) -> GatewayEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event")
            .expect("event channel closed")
    }

    fn client(url: &str) -> (Arc<GatewayClient>, Arc<FakeCredentials>) {
        let credentials = Arc::new(FakeCredentials {
            url: Mutex::new(url.to_string()),
            invalidated: AtomicUsize::new(0),
        });
        let options = GatewayOptions {
            backoff: BackoffSchedule::from_millis(&[10, 20, 50]),
            handshake_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        (Arc::new(GatewayClient::new(credentials.clone(), options)), credentials)
    }

    fn spawn_start(
        client: &Arc<GatewayClient>,
    ) -> JoinHandle<ChannelResult<mpsc::Receiver<GatewayEvent>>> {
        let client = client.clone();
        tokio::spawn(async move { client.start().await })
    }

    /// Accepts a connection and completes a fresh identify.
    async fn handshake(server: &mut TestServer, session_id: &str, seq: u64) -> ServerSocket {
        let mut ws = server.accept().await;
        hello(&mut ws, 60_000).await;
        let identify = recv(&mut ws).await;
        assert_eq!(identify["op"], 2);
        send(
            &mut ws,
            json!({"op": 0, "s": seq, "t": "READY", "d": {"session_id": session_id, "user": {"username": "courier-bot"}}}),
        )
        .await;
        ws
    }

    #[tokio::test]
    async fn test_identify_ready_and_dispatch() {
        let mut server = TestServer::start().await;
        let (client, _) = client(&server.url);
        let starting = spawn_start(&client);

        let mut ws = server.accept().await;
        hello(&mut ws, 60_000).await;
        let identify = recv(&mut ws).await;
        assert_eq!(identify["op"], 2);
        assert_eq!(identify["d"]["token"], "QQBot test-token");
        assert_eq!(identify["d"]["intents"], Intents::default().bits());
        assert_eq!(identify["d"]["shard"], json!([0, 1]));
        send(
            &mut ws,
            json!({"op": 0, "s": 1, "t": "READY", "d": {"session_id": "sess-1", "user": {"username": "courier-bot"}}}),
        )
        .await;

        let mut events = starting.await.unwrap().unwrap();
        match next_event(&mut events).await {
            GatewayEvent::Ready { session_id, username } => {
                assert_eq!(session_id, "sess-1");
                assert_eq!(username.as_deref(), Some("courier-bot"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(client.state(), GatewayState::Ready);

        // Garbage is dropped without ending the connection.
        ws.send(Message::Text("{not json".into())).await.unwrap();
        send(
            &mut ws,
            json!({"op": 0, "s": 2, "t": "GUILD_CREATE", "d": {}}),
        )
        .await;
        send(
            &mut ws,
            json!({
                "op": 0, "s": 3, "t": "C2C_MESSAGE_CREATE",
                "d": {
                    "id": "msg-1",
                    "content": "hello",
                    "timestamp": "2024-05-01T12:00:00+08:00",
                    "author": {"user_openid": "USER1"}
                }
            }),
        )
        .await;

        match next_event(&mut events).await {
            GatewayEvent::Message(message) => {
                assert_eq!(message.reply_address(), "c2c:USER1");
                assert_eq!(message.content, "hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            client.session(),
            GatewaySession {
                session_id: Some("sess-1".into()),
                last_sequence: Some(3),
            }
        );

        client.stop().await;
        assert_eq!(client.state(), GatewayState::Stopped);
    }

    #[tokio::test]
    async fn test_reconnect_request_resumes_session() {
        let mut server = TestServer::start().await;
        let (client, _) = client(&server.url);
        let starting = spawn_start(&client);

        let mut ws = handshake(&mut server, "sess-1", 1).await;
        let mut events = starting.await.unwrap().unwrap();
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Ready { .. }));

        send(&mut ws, json!({"op": 0, "s": 5, "t": "GUILD_CREATE", "d": {}})).await;
        send(&mut ws, json!({"op": 7})).await;

        match next_event(&mut events).await {
            GatewayEvent::Disconnected { attempt, retry_in, .. } => {
                assert_eq!(attempt, 0);
                assert_eq!(retry_in, Duration::from_millis(10));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let mut ws = server.accept().await;
        hello(&mut ws, 60_000).await;
        let resume = recv(&mut ws).await;
        assert_eq!(resume["op"], 6);
        assert_eq!(resume["d"]["session_id"], "sess-1");
        assert_eq!(resume["d"]["seq"], 5);
        assert_eq!(resume["d"]["token"], "QQBot test-token");
        send(&mut ws, json!({"op": 0, "s": 6, "t": "RESUMED", "d": {}})).await;

        assert!(matches!(next_event(&mut events).await, GatewayEvent::Resumed));
        assert_eq!(client.state(), GatewayState::Ready);
        client.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_session_resets_session_without_resetting_backoff() {
        let mut server = TestServer::start().await;
        let (client, _) = client(&server.url);
        let starting = spawn_start(&client);

        // First connection dies before the handshake completes.
        let ws = server.accept().await;
        drop(ws);
        let mut events = starting.await.unwrap().unwrap();
        match next_event(&mut events).await {
            GatewayEvent::Disconnected { attempt, .. } => assert_eq!(attempt, 0),
            other => panic!("unexpected event: {other:?}"),
        }

        // Second connection: op 9 right after identify.
        let mut ws = server.accept().await;
        hello(&mut ws, 60_000).await;
        assert_eq!(recv(&mut ws).await["op"], 2);
        send(&mut ws, json!({"op": 9, "d": false})).await;
        match next_event(&mut events).await {
            GatewayEvent::Disconnected { attempt, retry_in, reason } => {
                assert_eq!(attempt, 1);
                assert_eq!(retry_in, Duration::from_millis(20));
                assert_eq!(reason, "invalid session");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(client.session(), GatewaySession::default());

        // Third connection identifies afresh and reaches Ready.
        let _ws = handshake(&mut server, "sess-2", 1).await;
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Ready { .. }));
        client.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_session_after_ready_drops_resume() {
        let mut server = TestServer::start().await;
        let (client, _) = client(&server.url);
        let starting = spawn_start(&client);

        let mut ws = handshake(&mut server, "sess-1", 4).await;
        let mut events = starting.await.unwrap().unwrap();
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Ready { .. }));

        send(&mut ws, json!({"op": 9, "d": false})).await;
        assert!(matches!(
            next_event(&mut events).await,
            GatewayEvent::Disconnected { .. }
        ));
        let mut ws = server.accept().await;
        hello(&mut ws, 60_000).await;
        assert_eq!(recv(&mut ws).await["op"], 2);
        client.stop().await;
    }

    #[tokio::test]
    async fn test_auth_rejection_on_first_attempt_fails_start() {
        let mut server = TestServer::start().await;
        let (client, credentials) = client(&server.url);
        let starting = spawn_start(&client);

        let mut ws = server.accept().await;
        hello(&mut ws, 60_000).await;
        assert_eq!(recv(&mut ws).await["op"], 2);
        ws.close(Some(CloseFrame {
            code: CloseCode::Library(4004),
            reason: "invalid token".into(),
        }))
        .await
        .unwrap();

        let err = starting.await.unwrap().unwrap_err();
        assert!(matches!(err, ChannelError::Auth(AuthError::Rejected { code: 4004, .. })));
        assert_eq!(client.state(), GatewayState::Stopped);
        assert_eq!(credentials.invalidated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_rejection_after_ready_reconnects_with_fresh_identify() {
        let mut server = TestServer::start().await;
        let (client, credentials) = client(&server.url);
        let starting = spawn_start(&client);

        let mut ws = handshake(&mut server, "sess-1", 3).await;
        let mut events = starting.await.unwrap().unwrap();
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Ready { .. }));

        ws.close(Some(CloseFrame {
            code: CloseCode::Library(4004),
            reason: "invalid token".into(),
        }))
        .await
        .unwrap();

        match next_event(&mut events).await {
            GatewayEvent::Error(reason) => assert!(reason.contains("4004"), "{reason}"),
            other => panic!("unexpected event: {other:?}"),
        }
        match next_event(&mut events).await {
            GatewayEvent::Disconnected { attempt, .. } => assert_eq!(attempt, 0),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(client.session(), GatewaySession::default());
        assert_eq!(credentials.invalidated.load(Ordering::SeqCst), 1);

        // Fresh identify (op 2), not a resume.
        let _ws = handshake(&mut server, "sess-2", 1).await;
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Ready { .. }));
        assert_eq!(client.session().session_id.as_deref(), Some("sess-2"));
        client.stop().await;
    }

    #[tokio::test]
    async fn test_queued_ack_beats_overdue_heartbeat_tick() {
        let mut server = TestServer::start().await;
        let (client, _) = client(&server.url);
        let starting = spawn_start(&client);

        let mut ws = server.accept().await;
        hello(&mut ws, 100).await;
        assert_eq!(recv(&mut ws).await["op"], 2);
        send(&mut ws, json!({"op": 0, "s": 1, "t": "READY", "d": {"session_id": "s"}})).await;
        let mut events = starting.await.unwrap().unwrap();
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Ready { .. }));

        // The ack for the first heartbeat sits behind more events than the
        // buffer holds, so the client stalls for several heartbeat periods.
        assert_eq!(recv(&mut ws).await["op"], 1);
        let backlog = EVENT_BUFFER + 20;
        for i in 0..backlog {
            send(
                &mut ws,
                json!({
                    "op": 0, "s": i + 2, "t": "C2C_MESSAGE_CREATE",
                    "d": {"id": format!("m{i}"), "content": "x", "author": {"user_openid": "USER1"}}
                }),
            )
            .await;
        }
        send(&mut ws, json!({"op": 11})).await;
        tokio::time::sleep(Duration::from_millis(350)).await;

        for _ in 0..backlog {
            match next_event(&mut events).await {
                GatewayEvent::Message(_) => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(recv(&mut ws).await["op"], 1);
        assert_eq!(client.state(), GatewayState::Ready);
        client.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_starts_and_keeps_retrying() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let mut server = TestServer::start().await;
        let (client, credentials) = client(&dead_url);
        let mut events = client.start().await.unwrap();
        match next_event(&mut events).await {
            GatewayEvent::Disconnected { attempt, .. } => assert_eq!(attempt, 0),
            other => panic!("unexpected event: {other:?}"),
        }

        // The endpoint comes up; the background loop connects.
        *credentials.url.lock() = server.url.clone();
        let _ws = handshake(&mut server, "sess-1", 1).await;
        loop {
            if let GatewayEvent::Ready { .. } = next_event(&mut events).await {
                break;
            }
        }
        client.stop().await;
    }

    #[tokio::test]
    async fn test_heartbeat_carries_sequence_and_timeout_reconnects() {
        let mut server = TestServer::start().await;
        let (client, _) = client(&server.url);
        let starting = spawn_start(&client);

        let mut ws = server.accept().await;
        hello(&mut ws, 100).await;
        assert_eq!(recv(&mut ws).await["op"], 2);
        send(&mut ws, json!({"op": 0, "s": 7, "t": "READY", "d": {"session_id": "s"}})).await;
        let mut events = starting.await.unwrap().unwrap();
        assert!(matches!(next_event(&mut events).await, GatewayEvent::Ready { .. }));

        // Server-initiated heartbeat request is answered immediately.
        send(&mut ws, json!({"op": 1})).await;
        let beat = recv(&mut ws).await;
        assert_eq!(beat, json!({"op": 1, "d": 7}));
        send(&mut ws, json!({"op": 11})).await;

        // Periodic heartbeat, acknowledged.
        let beat = recv(&mut ws).await;
        assert_eq!(beat["op"], 1);
        send(&mut ws, json!({"op": 11})).await;

        // Next heartbeat left unacknowledged: the tick after it drops the link.
        assert_eq!(recv(&mut ws).await["op"], 1);
        match next_event(&mut events).await {
            GatewayEvent::Disconnected { reason, .. } => {
                assert!(reason.contains("heartbeat"), "{reason}");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        client.stop().await;
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let mut server = TestServer::start().await;
        let credentials = Arc::new(FakeCredentials {
            url: Mutex::new(server.url.clone()),
            invalidated: AtomicUsize::new(0),
        });
        let client = GatewayClient::new(
            credentials,
            GatewayOptions {
                backoff: BackoffSchedule::from_millis(&[10]),
                handshake_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        );

        let (started, _silent) = tokio::join!(client.start(), server.accept());
        let mut events = started.unwrap();
        match next_event(&mut events).await {
            GatewayEvent::Disconnected { reason, .. } => assert!(reason.contains("handshake")),
            other => panic!("unexpected event: {other:?}"),
        }
        client.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_backoff_wait() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let credentials = Arc::new(FakeCredentials {
            url: Mutex::new(dead_url),
            invalidated: AtomicUsize::new(0),
        });
        let client = GatewayClient::new(
            credentials,
            GatewayOptions {
                backoff: BackoffSchedule::from_secs(&[3600]),
                ..Default::default()
            },
        );
        let mut events = client.start().await.unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            GatewayEvent::Disconnected { .. }
        ));

        tokio::time::timeout(Duration::from_secs(5), client.stop())
            .await
            .unwrap();
        assert_eq!(client.state(), GatewayState::Stopped);
        assert!(client.start().await.is_err());
    }
}
