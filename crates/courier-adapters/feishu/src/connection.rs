//! Feishu long connection.
//!
//! The platform pushes events over a WebSocket carrying protobuf
//! [`Frame`]s. Unlike a gateway with a handshake, the connection is usable
//! as soon as the socket opens:
//!
//! ```text
//!   POST /callback/ws/endpoint ──► wss://…?service_id=N ──► ping ⇄ pong
//!                                                         ◄── data frame
//!                                                         ──► ack
//! ```
//!
//! - Pings are control frames sent every `PingInterval` seconds; `pong`
//!   payloads may carry a new interval.
//! - Every data frame is acknowledged right away, the platform redelivers
//!   unacknowledged ones.
//! - Large events arrive split over several frames sharing a `message_id`
//!   (`sum`/`seq` headers) and are reassembled before decoding.
//! - Redeliveries are dropped by message id, see [`Deduplicator`].
//! - Silence for longer than [`ConnectionOptions::idle_timeout`] counts as a
//!   dead link and triggers a reconnect.
//!
//! Reconnects follow the same [`BackoffSchedule`] rules as every other
//! channel: the counter resets once a socket is open again.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use courier_core::{ApiError, ApiResult, AuthError, ChannelError, ChannelResult, ConnectionError, ProtocolError};
use courier_transport::websocket::{self, Message, WsSink, WsSource};
use courier_transport::{Backoff, BackoffSchedule};

use crate::api::{FeishuApiClient, WsEndpoint};
use crate::event::{self, Deduplicator, FeishuMessageEvent};
use crate::proto::{ClientConfig, Frame, HEADER_MESSAGE_ID, HEADER_SEQ, HEADER_SUM};

const EVENT_BUFFER: usize = 256;
const MIN_PING_INTERVAL: Duration = Duration::from_secs(10);
const FRAGMENT_TTL: Duration = Duration::from_secs(300);
const MAX_FRAGMENTS: usize = 64;

/// State of the long connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed, never started.
    Idle,
    /// Fetching the endpoint and opening the socket.
    Connecting,
    /// Socket open, events flowing.
    Connected,
    /// Waiting out a backoff delay.
    Reconnecting,
    /// Stopped for good.
    Stopped,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What the connection publishes to its owner.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// A socket was opened.
    Connected,
    /// A user message arrived.
    Message(Box<FeishuMessageEvent>),
    /// The socket was lost; another attempt follows after `retry_in`.
    Disconnected {
        /// Why the socket ended.
        reason: String,
        /// Zero-based index of the reconnect attempt.
        attempt: usize,
        /// Delay before the attempt.
        retry_in: Duration,
    },
    /// Non-fatal trouble worth surfacing.
    Error(String),
}

/// Source of long-connection endpoints.
#[async_trait]
pub trait EndpointSource: Send + Sync + 'static {
    /// Requests a fresh endpoint; each URL is good for one connection.
    async fn endpoint(&self) -> ApiResult<WsEndpoint>;
}

#[async_trait]
impl EndpointSource for FeishuApiClient {
    async fn endpoint(&self) -> ApiResult<WsEndpoint> {
        self.ws_endpoint().await
    }
}

/// Tunables of the long connection.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Reconnect delays.
    pub backoff: BackoffSchedule,
    /// Deadline for the socket to open.
    pub connect_timeout: Duration,
    /// Ping interval until the platform sets one.
    pub ping_interval: Duration,
    /// Reconnect when no frame arrived for this long.
    pub idle_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffSchedule::default(),
            connect_timeout: Duration::from_secs(15),
            ping_interval: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// Client for one Feishu long connection.
///
/// Like the other channel connections it runs once; start a new client to
/// connect again after [`stop`](Self::stop).
pub struct LongConnection {
    source: Arc<dyn EndpointSource>,
    options: ConnectionOptions,
    state: Arc<RwLock<ConnectionState>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LongConnection {
    /// Creates an idle client.
    pub fn new(source: Arc<dyn EndpointSource>, options: ConnectionOptions) -> Self {
        Self {
            source,
            options,
            state: Arc::new(RwLock::new(ConnectionState::Idle)),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Spawns the connection task and waits for the first attempt's outcome.
    ///
    /// Rejected credentials fail the start; transport trouble does not, the
    /// task keeps retrying in the background.
    pub async fn start(&self) -> ChannelResult<mpsc::Receiver<ConnectionEvent>> {
        if self.state() != ConnectionState::Idle {
            return Err(ChannelError::other(format!(
                "long connection cannot start from state {}",
                self.state()
            )));
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (first_tx, first_rx) = oneshot::channel();
        let runner = Runner {
            source: self.source.clone(),
            options: self.options.clone(),
            state: self.state.clone(),
            cancel: self.cancel.clone(),
            events: events_tx,
            backoff: Backoff::new(self.options.backoff.clone()),
            dedup: Deduplicator::default(),
            first_outcome: Some(first_tx),
        };
        set_state(&self.state, ConnectionState::Connecting);
        *self.task.lock() = Some(tokio::spawn(supervise(runner)));

        match first_rx.await {
            Ok(Ok(())) => Ok(events_rx),
            Ok(Err(e)) => {
                self.stop().await;
                Err(e)
            }
            Err(_) => {
                self.stop().await;
                Err(ChannelError::other("long connection task ended before connecting"))
            }
        }
    }

    /// Cancels pings and reconnects, closes the socket and joins the task.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!(error = %e, "Long connection task panicked");
        }
        set_state(&self.state, ConnectionState::Stopped);
    }
}

impl Drop for LongConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn set_state(state: &RwLock<ConnectionState>, next: ConnectionState) {
    let mut current = state.write();
    if *current != next {
        debug!(from = %*current, to = %next, "Long connection state changed");
        *current = next;
    }
}

// =============================================================================
// Connection Loop
// =============================================================================

/// Runs the connection loop and reports a crash to the event receiver.
async fn supervise(runner: Runner) {
    let events = runner.events.clone();
    let state = runner.state.clone();
    let cancel = runner.cancel.clone();
    if AssertUnwindSafe(runner.run()).catch_unwind().await.is_err() && !cancel.is_cancelled() {
        error!("Long connection task panicked");
        set_state(&state, ConnectionState::Stopped);
        let _ = events.try_send(ConnectionEvent::Error("long connection task panicked".into()));
    }
}

enum Ending {
    Cancelled,
    AuthRejected(AuthError),
    Reconnect(String),
}

impl Ending {
    fn reconnect(reason: impl std::fmt::Display) -> Self {
        Self::Reconnect(reason.to_string())
    }
}

fn classify_api_error(err: ApiError) -> Ending {
    match err {
        ApiError::Auth(AuthError::Rejected { code, message }) => {
            Ending::AuthRejected(AuthError::Rejected { code, message })
        }
        ApiError::Status {
            status: status @ (401 | 403),
            body,
            ..
        } => Ending::AuthRejected(AuthError::rejected(i64::from(status), body)),
        other => Ending::reconnect(other),
    }
}

type FirstOutcome = oneshot::Sender<ChannelResult<()>>;

struct Runner {
    source: Arc<dyn EndpointSource>,
    options: ConnectionOptions,
    state: Arc<RwLock<ConnectionState>>,
    cancel: CancellationToken,
    events: mpsc::Sender<ConnectionEvent>,
    backoff: Backoff,
    dedup: Deduplicator,
    first_outcome: Option<FirstOutcome>,
}

struct Fragments {
    parts: Vec<Option<Vec<u8>>>,
    started: Instant,
}

/// Per-socket bookkeeping.
struct Link {
    sink: WsSink,
    service_id: i32,
    ping_period: Duration,
    ping: Interval,
    last_received: Instant,
    fragments: HashMap<String, Fragments>,
}

fn ping_interval(period: Duration) -> Interval {
    // First tick fires immediately so the platform answers with its settings.
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl Runner {
    async fn run(mut self) {
        loop {
            set_state(&self.state, ConnectionState::Connecting);
            let reason = match self.connect_once().await {
                Ending::Cancelled => break,
                Ending::AuthRejected(err) => {
                    if let Some(first) = self.first_outcome.take() {
                        error!(error = %err, "Long connection credentials rejected");
                        let _ = first.send(Err(err.into()));
                        break;
                    }
                    warn!(error = %err, "Long connection credentials rejected, reconnecting");
                    self.emit(ConnectionEvent::Error(err.to_string())).await;
                    err.to_string()
                }
                Ending::Reconnect(reason) => reason,
            };

            if let Some(first) = self.first_outcome.take() {
                let _ = first.send(Ok(()));
            }

            set_state(&self.state, ConnectionState::Reconnecting);
            let attempt = self.backoff.attempt();
            let delay = self.backoff.next_delay();
            warn!(attempt, ?delay, %reason, "Long connection lost, reconnecting");
            self.emit(ConnectionEvent::Disconnected {
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

        set_state(&self.state, ConnectionState::Stopped);
        debug!("Long connection task finished");
    }

    async fn emit(&self, event: ConnectionEvent) {
        tokio::select! {
            _ = self.cancel.cancelled() => trace!("Long connection stopped, dropping event"),
            sent = self.events.send(event) => {
                if sent.is_err() {
                    trace!("Long connection event receiver dropped");
                }
            }
        }
    }

    async fn connect_once(&mut self) -> Ending {
        let endpoint = tokio::select! {
            _ = self.cancel.cancelled() => return Ending::Cancelled,
            endpoint = self.source.endpoint() => endpoint,
        };
        let endpoint = match endpoint {
            Ok(endpoint) => endpoint,
            Err(e) => return classify_api_error(e),
        };

        // The URL embeds a connection ticket; keep it out of the logs.
        info!(service_id = endpoint.service_id, "Opening Feishu long connection");
        let opened = tokio::select! {
            _ = self.cancel.cancelled() => return Ending::Cancelled,
            opened = websocket::connect(&endpoint.url, self.options.connect_timeout) => opened,
        };
        let (sink, mut source) = match opened {
            Ok(halves) => halves,
            Err(e) => return Ending::reconnect(e),
        };

        let ping_period = self.ping_period(&endpoint.client_config);
        let mut link = Link {
            sink,
            service_id: endpoint.service_id,
            ping_period,
            ping: ping_interval(ping_period),
            last_received: Instant::now(),
            fragments: HashMap::new(),
        };

        set_state(&self.state, ConnectionState::Connected);
        self.backoff.reset();
        if let Some(first) = self.first_outcome.take() {
            let _ = first.send(Ok(()));
        }
        self.emit(ConnectionEvent::Connected).await;

        let ending = self.drive(&mut link, &mut source).await;
        if !matches!(ending, Ending::Cancelled) {
            let _ = link.sink.close().await;
        }
        ending
    }

    fn ping_period(&self, config: &ClientConfig) -> Duration {
        config
            .ping_interval()
            .unwrap_or(self.options.ping_interval)
            .max(MIN_PING_INTERVAL)
    }

    async fn drive(&mut self, link: &mut Link, source: &mut WsSource) -> Ending {
        let idle_timeout = self.options.idle_timeout;
        loop {
            let idle_deadline = link.last_received + idle_timeout;

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    let _ = link.sink.send(Message::Close(None)).await;
                    return Ending::Cancelled;
                }
                _ = tokio::time::sleep_until(idle_deadline) => {
                    return Ending::reconnect(ConnectionError::Timeout("no frames received".into()));
                }
                _ = link.ping.tick() => {
                    trace!(service_id = link.service_id, "Sending ping");
                    let ping = Frame::ping(link.service_id);
                    if let Err(e) = send_frame(link, &ping).await {
                        return Ending::reconnect(e);
                    }
                    link.fragments.retain(|_, f| f.started.elapsed() < FRAGMENT_TTL);
                }
                message = source.next() => match message {
                    Some(Ok(Message::Binary(data))) => {
                        link.last_received = Instant::now();
                        if let Some(ending) = self.handle_frame(link, &data).await {
                            return ending;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        link.last_received = Instant::now();
                        let _ = link.sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Ending::reconnect(websocket::closed(frame.as_ref()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Ending::reconnect(ConnectionError::Closed {
                        code: 0,
                        reason: e.to_string(),
                    }),
                    None => return Ending::reconnect(websocket::closed(None)),
                },
            }
        }
    }

    /// Handles one binary frame; returns `Some` when the connection must end.
    async fn handle_frame(&mut self, link: &mut Link, data: &[u8]) -> Option<Ending> {
        let received = Instant::now();
        let frame = match Frame::decode_bytes(data) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable frame");
                return None;
            }
        };

        if frame.is_control() {
            if frame.frame_type() == "pong" {
                self.on_pong(link, &frame);
            }
            return None;
        }

        let ack = frame.ack(received.elapsed());
        if let Err(e) = send_frame(link, &ack).await {
            return Some(Ending::reconnect(e));
        }

        if frame.frame_type() != "event" {
            debug!(frame_type = frame.frame_type(), "Ignoring data frame");
            return None;
        }
        match assemble(link, &frame) {
            Ok(Some(payload)) => self.handle_event(&payload).await,
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Dropping fragment");
                self.emit(ConnectionEvent::Error(e.to_string())).await;
            }
        }
        None
    }

    fn on_pong(&self, link: &mut Link, frame: &Frame) {
        let Some(payload) = frame.payload.as_deref() else {
            return;
        };
        let Ok(config) = serde_json::from_slice::<ClientConfig>(payload) else {
            trace!("Pong without client config");
            return;
        };
        let Some(interval) = config.ping_interval() else {
            return;
        };
        let period = interval.max(MIN_PING_INTERVAL);
        if period != link.ping_period {
            info!(?period, "Ping interval updated");
            link.ping_period = period;
            link.ping = tokio::time::interval_at(Instant::now() + period, period);
            link.ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
    }

    async fn handle_event(&mut self, payload: &[u8]) {
        let envelope = match event::envelope(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping malformed event payload");
                return;
            }
        };
        match event::decode(&envelope) {
            Some(Ok(message)) => {
                if !self.dedup.first_seen(&message.message_id) {
                    debug!(message_id = %message.message_id, "Dropping redelivered message");
                    return;
                }
                trace!(message_id = %message.message_id, "Message event");
                self.emit(ConnectionEvent::Message(Box::new(message))).await;
            }
            Some(Err(e)) => warn!(error = %e, "Dropping undecodable message event"),
            None => debug!(event_type = ?event::event_type(&envelope), "Ignoring event"),
        }
    }
}

async fn send_frame(link: &mut Link, frame: &Frame) -> Result<(), ConnectionError> {
    link.sink
        .send(Message::Binary(frame.to_bytes().into()))
        .await
        .map_err(|e| ConnectionError::SendFailed(e.to_string()))
}

/// Returns the complete payload once every fragment of a message arrived.
fn assemble(link: &mut Link, frame: &Frame) -> Result<Option<Vec<u8>>, ProtocolError> {
    let payload = frame.payload.clone().unwrap_or_default();
    let sum = frame
        .header(HEADER_SUM)
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(1)
        .max(1);
    let seq = frame
        .header(HEADER_SEQ)
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    let id = frame.header(HEADER_MESSAGE_ID).unwrap_or_default();
    if sum > MAX_FRAGMENTS {
        return Err(ProtocolError::Malformed(format!(
            "message {id} split into {sum} fragments, at most {MAX_FRAGMENTS} allowed"
        )));
    }
    if seq >= sum {
        return Err(ProtocolError::Malformed(format!(
            "fragment {seq} of message {id} out of range 0..{sum}"
        )));
    }
    if sum == 1 || id.is_empty() {
        return Ok(Some(payload));
    }

    let entry = link
        .fragments
        .entry(id.to_string())
        .or_insert_with(|| Fragments {
            parts: vec![None; sum],
            started: Instant::now(),
        });
    if entry.parts.len() != sum {
        *entry = Fragments {
            parts: vec![None; sum],
            started: Instant::now(),
        };
    }
    entry.parts[seq] = Some(payload);
    if !entry.parts.iter().all(Option::is_some) {
        trace!(message_id = id, seq, sum, "Buffered fragment");
        return Ok(None);
    }
    Ok(link
        .fragments
        .remove(id)
        .map(|f| f.parts.into_iter().flatten().flatten().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{HEADER_BIZ_RT, HEADER_TYPE, Header, METHOD_CONTROL, METHOD_DATA};
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::WebSocketStream;

    type ServerSocket = WebSocketStream<TcpStream>;

    struct FakeSource {
        url: String,
        calls: AtomicUsize,
        reject: AtomicBool,
    }

    #[async_trait]
    impl EndpointSource for FakeSource {
        async fn endpoint(&self) -> ApiResult<WsEndpoint> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reject.load(Ordering::SeqCst) {
                return Err(AuthError::rejected(99991663, "invalid token").into());
            }
            Ok(WsEndpoint {
                url: self.url.clone(),
                service_id: 7,
                client_config: ClientConfig::default(),
            })
        }
    }

    fn source(url: &str, reject: bool) -> Arc<FakeSource> {
        Arc::new(FakeSource {
            url: url.to_string(),
            calls: AtomicUsize::new(0),
            reject: AtomicBool::new(reject),
        })
    }

    fn fast_options() -> ConnectionOptions {
        ConnectionOptions {
            backoff: BackoffSchedule::from_millis(&[20, 40]),
            connect_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    async fn listen() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> ServerSocket {
        let (tcp, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        tokio_tungstenite::accept_async(tcp).await.unwrap()
    }

    async fn recv_frame(ws: &mut ServerSocket) -> Frame {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Binary(data) = message {
                return Frame::decode_bytes(&data).unwrap();
            }
        }
    }

    /// Receives frames until a data frame (an ack) shows up.
    async fn recv_ack(ws: &mut ServerSocket) -> Frame {
        loop {
            let frame = recv_frame(ws).await;
            if frame.method == METHOD_DATA {
                return frame;
            }
        }
    }

    async fn send_frame_to(ws: &mut ServerSocket, frame: Frame) {
        ws.send(Message::Binary(frame.to_bytes().into())).await.unwrap();
    }

    fn header(key: &str, value: &str) -> Header {
        Header {
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    fn message_envelope(message_id: &str, text: &str) -> Value {
        json!({
            "schema": "2.0",
            "header": {"event_type": event::MESSAGE_RECEIVE},
            "event": {
                "sender": {"sender_id": {"open_id": "ou_user"}, "sender_type": "user"},
                "message": {
                    "message_id": message_id,
                    "chat_id": "oc_chat",
                    "chat_type": "p2p",
                    "message_type": "text",
                    "content": json!({"text": text}).to_string()
                }
            }
        })
    }

    fn event_frame(seq_id: u64, id: &str, payload: Vec<u8>, fragment: Option<(usize, usize)>) -> Frame {
        let mut headers = vec![header(HEADER_TYPE, "event"), header(HEADER_MESSAGE_ID, id)];
        if let Some((sum, seq)) = fragment {
            headers.push(header(HEADER_SUM, &sum.to_string()));
            headers.push(header(HEADER_SEQ, &seq.to_string()));
        }
        Frame {
            seq_id,
            service: 7,
            method: METHOD_DATA,
            headers,
            payload: Some(payload),
            ..Default::default()
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    async fn next_message(rx: &mut mpsc::Receiver<ConnectionEvent>) -> FeishuMessageEvent {
        loop {
            if let ConnectionEvent::Message(message) = next_event(rx).await {
                return *message;
            }
        }
    }

    #[tokio::test]
    async fn test_ping_ack_and_dedup() {
        let (listener, url) = listen().await;
        let client = Arc::new(LongConnection::new(source(&url, false), fast_options()));

        let starter = {
            let client = client.clone();
            tokio::spawn(async move { client.start().await })
        };
        let mut ws = accept(&listener).await;
        let mut events = starter.await.unwrap().unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(matches!(next_event(&mut events).await, ConnectionEvent::Connected));

        let ping = recv_frame(&mut ws).await;
        assert_eq!(ping.method, METHOD_CONTROL);
        assert_eq!(ping.service, 7);
        assert_eq!(ping.frame_type(), "ping");

        let payload = message_envelope("om_1", "hello").to_string().into_bytes();
        send_frame_to(&mut ws, event_frame(1, "m-1", payload.clone(), None)).await;
        let ack = recv_ack(&mut ws).await;
        assert_eq!(ack.seq_id, 1);
        assert!(ack.header(HEADER_BIZ_RT).is_some());
        assert_eq!(ack.payload.as_deref(), Some(br#"{"code":200}"#.as_slice()));

        let message = next_message(&mut events).await;
        assert_eq!(message.message_id, "om_1");
        assert_eq!(message.content.text.as_deref(), Some("hello"));

        // Redelivery is acked but not published.
        send_frame_to(&mut ws, event_frame(2, "m-1", payload, None)).await;
        assert_eq!(recv_ack(&mut ws).await.seq_id, 2);
        let fresh = message_envelope("om_2", "again").to_string().into_bytes();
        send_frame_to(&mut ws, event_frame(3, "m-2", fresh, None)).await;
        assert_eq!(next_message(&mut events).await.message_id, "om_2");

        client.stop().await;
        assert_eq!(client.state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_fragments_are_reassembled() {
        let (listener, url) = listen().await;
        let client = Arc::new(LongConnection::new(source(&url, false), fast_options()));
        let starter = {
            let client = client.clone();
            tokio::spawn(async move { client.start().await })
        };
        let mut ws = accept(&listener).await;
        let mut events = starter.await.unwrap().unwrap();

        let payload = message_envelope("om_big", "split in two").to_string().into_bytes();
        let (first, second) = payload.split_at(payload.len() / 2);
        // Out of order on purpose.
        send_frame_to(&mut ws, event_frame(1, "m-big", second.to_vec(), Some((2, 1)))).await;
        send_frame_to(&mut ws, event_frame(2, "m-big", first.to_vec(), Some((2, 0)))).await;

        let message = next_message(&mut events).await;
        assert_eq!(message.message_id, "om_big");
        assert_eq!(message.content.text.as_deref(), Some("split in two"));
        client.stop().await;
    }

    #[tokio::test]
    async fn test_oversized_fragment_count_is_dropped() {
        let (listener, url) = listen().await;
        let client = Arc::new(LongConnection::new(source(&url, false), fast_options()));
        let starter = {
            let client = client.clone();
            tokio::spawn(async move { client.start().await })
        };
        let mut ws = accept(&listener).await;
        let mut events = starter.await.unwrap().unwrap();
        assert!(matches!(next_event(&mut events).await, ConnectionEvent::Connected));

        let huge = event_frame(1, "m-huge", b"{}".to_vec(), Some((2_305_843_009_213_693_952, 0)));
        send_frame_to(&mut ws, huge).await;
        assert_eq!(recv_ack(&mut ws).await.seq_id, 1);
        send_frame_to(&mut ws, event_frame(2, "m-bad", b"{}".to_vec(), Some((2, 5)))).await;
        assert_eq!(recv_ack(&mut ws).await.seq_id, 2);

        for _ in 0..2 {
            match next_event(&mut events).await {
                ConnectionEvent::Error(reason) => assert!(reason.contains("malformed"), "{reason}"),
                other => panic!("unexpected event: {other:?}"),
            }
        }

        // The link survives and keeps delivering.
        let payload = message_envelope("om_ok", "still here").to_string().into_bytes();
        send_frame_to(&mut ws, event_frame(3, "m-ok", payload, None)).await;
        assert_eq!(next_message(&mut events).await.message_id, "om_ok");
        assert_eq!(client.state(), ConnectionState::Connected);
        client.stop().await;
    }

    #[tokio::test]
    async fn test_rejected_endpoint_fails_start() {
        let source = source("ws://127.0.0.1:1", true);
        let client = LongConnection::new(source.clone(), fast_options());
        let err = client.start().await.unwrap_err();
        assert!(err.to_string().contains("99991663"));
        assert_eq!(client.state(), ConnectionState::Stopped);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(client.start().await.is_err());
    }

    #[tokio::test]
    async fn test_server_close_reconnects() {
        let (listener, url) = listen().await;
        let source = source(&url, false);
        let client = Arc::new(LongConnection::new(source.clone(), fast_options()));
        let starter = {
            let client = client.clone();
            tokio::spawn(async move { client.start().await })
        };
        let mut ws = accept(&listener).await;
        let mut events = starter.await.unwrap().unwrap();
        assert!(matches!(next_event(&mut events).await, ConnectionEvent::Connected));

        ws.close(None).await.unwrap();
        match next_event(&mut events).await {
            ConnectionEvent::Disconnected { attempt, retry_in, .. } => {
                assert_eq!(attempt, 0);
                assert_eq!(retry_in, Duration::from_millis(20));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let _second = accept(&listener).await;
        assert!(matches!(next_event(&mut events).await, ConnectionEvent::Connected));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        client.stop().await;
    }

    #[tokio::test]
    async fn test_rejection_after_connect_keeps_retrying() {
        let (listener, url) = listen().await;
        let source = source(&url, false);
        let client = Arc::new(LongConnection::new(source.clone(), fast_options()));
        let starter = {
            let client = client.clone();
            tokio::spawn(async move { client.start().await })
        };
        let mut ws = accept(&listener).await;
        let mut events = starter.await.unwrap().unwrap();
        assert!(matches!(next_event(&mut events).await, ConnectionEvent::Connected));

        source.reject.store(true, Ordering::SeqCst);
        ws.close(None).await.unwrap();
        match next_event(&mut events).await {
            ConnectionEvent::Disconnected { attempt, .. } => assert_eq!(attempt, 0),
            other => panic!("unexpected event: {other:?}"),
        }
        match next_event(&mut events).await {
            ConnectionEvent::Error(reason) => assert!(reason.contains("99991663"), "{reason}"),
            other => panic!("unexpected event: {other:?}"),
        }
        match next_event(&mut events).await {
            ConnectionEvent::Disconnected { attempt, .. } => assert_eq!(attempt, 1),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_ne!(client.state(), ConnectionState::Stopped);

        source.reject.store(false, Ordering::SeqCst);
        let _second = accept(&listener).await;
        loop {
            if let ConnectionEvent::Connected = next_event(&mut events).await {
                break;
            }
        }
        client.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_keeps_retrying() {
        let (listener, url) = listen().await;
        drop(listener);
        let source = source(&url, false);
        let client = LongConnection::new(source.clone(), fast_options());

        let mut events = client.start().await.unwrap();
        match next_event(&mut events).await {
            ConnectionEvent::Disconnected { attempt, .. } => assert_eq!(attempt, 0),
            other => panic!("unexpected event: {other:?}"),
        }
        match next_event(&mut events).await {
            ConnectionEvent::Disconnected { attempt, retry_in, .. } => {
                assert_eq!(attempt, 1);
                assert_eq!(retry_in, Duration::from_millis(40));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(source.calls.load(Ordering::SeqCst) >= 2);
        client.stop().await;
        assert_eq!(client.state(), ConnectionState::Stopped);
    }

    #[test]
    fn test_classify_api_error() {
        assert!(matches!(
            classify_api_error(ApiError::Status {
                path: "/callback/ws/endpoint".into(),
                status: 403,
                body: String::new(),
            }),
            Ending::AuthRejected(_)
        ));
        assert!(matches!(
            classify_api_error(ApiError::Status {
                path: "/callback/ws/endpoint".into(),
                status: 502,
                body: String::new(),
            }),
            Ending::Reconnect(_)
        ));
    }
}
