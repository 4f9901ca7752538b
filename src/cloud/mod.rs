//! Cloud transport (C4)
//!
//! One duplex WebSocket to the control plane. A session owns the split
//! sink/stream pair; outbound frames funnel through a bounded channel so
//! backpressure is visible at the enqueue site. Reconnection with
//! exponential backoff is the recovery primitive for every transport-level
//! fault; authentication faults route through the token manager and become
//! terminal only when the refresh credential itself is dead.

pub mod backoff;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, interval_at};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::auth::TokenManager;
use crate::protocol::{
    AckPayload, AddServerPayload, Frame, HeartbeatPayload, RegisterToolsPayload,
    RemoveServerPayload, SyncStatePayload, ToggleServerPayload, ToolCallPayload,
    ToolResultPayload, WireServer, WireTool,
};
use crate::{Error, Result};

use backoff::ReconnectPolicy;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Outbound queue capacity. Past this, non-critical frames drop and result
/// frames escalate to a connection teardown.
const OUTBOUND_CAPACITY: usize = 100;

/// Connection state as observed by status consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Not yet started, or cleanly closed
    Idle,
    /// Dial in progress
    Connecting,
    /// Live session
    Connected,
    /// Between attempts, backoff running
    Reconnecting,
    /// Auth rejected, refresh pending
    AuthFailing,
    /// Refresh impossible; re-login required
    Terminated,
}

impl ConnState {
    /// Stable string for status payloads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::AuthFailing => "auth_failing",
            Self::Terminated => "auth_failed",
        }
    }
}

/// Supervisory command decoded from the cloud channel.
#[derive(Debug, Clone)]
pub enum ProviderCommand {
    /// Add a provider descriptor and start it
    Add(AddServerPayload),
    /// Remove a provider descriptor
    Remove(RemoveServerPayload),
    /// Flip or set a provider's enabled flag
    Toggle(ToggleServerPayload),
}

impl ProviderCommand {
    /// Correlation id for the acknowledgement frame.
    #[must_use]
    pub fn request_id(&self) -> &str {
        match self {
            Self::Add(p) => &p.request_id,
            Self::Remove(p) => &p.request_id,
            Self::Toggle(p) => &p.request_id,
        }
    }
}

/// Events the transport surfaces to the orchestrator. Registered once.
#[async_trait]
pub trait CloudHandler: Send + Sync {
    /// A connection was established; `epoch` increments per connect. The
    /// handler re-announces the catalogue from here.
    async fn on_connected(&self, epoch: u64);

    /// The current session ended (any reason).
    async fn on_disconnected(&self);

    /// An invocation request arrived on `epoch`.
    async fn on_tool_call(&self, call: ToolCallPayload, epoch: u64);

    /// A provider-management command arrived.
    async fn on_provider_command(&self, command: ProviderCommand);

    /// The cloud asked for a `sync_state` frame.
    async fn on_request_sync(&self);

    /// A persona document was pushed.
    async fn on_persona_sync(&self, payload: Value) {
        debug!(payload = %payload, "persona_sync received");
    }

    /// The reconnect loop stopped for good; re-login is required.
    async fn on_auth_terminated(&self, reason: String);
}

/// Identity parameters carried in every announcement.
#[derive(Debug, Clone)]
pub struct CloudSettings {
    /// WebSocket endpoint
    pub ws_url: String,
    /// Stable identifier of this bridge installation
    pub client_id: String,
    /// Bridge version
    pub client_version: String,
    /// Operating system tag
    pub platform: String,
}

/// Deadlines and intervals; tests shorten these.
#[derive(Debug, Clone)]
pub struct CloudTimings {
    /// Dial timeout
    pub dial: Duration,
    /// Transport-level ping interval
    pub ping: Duration,
    /// Application heartbeat interval (also the refresh trigger)
    pub heartbeat: Duration,
    /// Reader idle deadline
    pub read_idle: Duration,
    /// Announcement acknowledgement wait
    pub announce_ack: Duration,
    /// Bounded wait for a result enqueue against a full queue
    pub result_enqueue: Duration,
    /// Proactive refresh window
    pub refresh_window: Duration,
}

impl Default for CloudTimings {
    fn default() -> Self {
        Self {
            dial: Duration::from_secs(5),
            ping: Duration::from_secs(45),
            heartbeat: Duration::from_secs(30),
            read_idle: Duration::from_secs(90),
            announce_ack: Duration::from_secs(10),
            result_enqueue: Duration::from_secs(5),
            refresh_window: Duration::from_secs(5 * 60),
        }
    }
}

struct Outbound {
    frame: Frame,
    epoch: u64,
}

/// Cloud transport (C4)
pub struct CloudTransport {
    settings: CloudSettings,
    timings: CloudTimings,
    tokens: Arc<TokenManager>,
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: tokio::sync::Mutex<mpsc::Receiver<Outbound>>,
    epoch: AtomicU64,
    state_tx: watch::Sender<ConnState>,
    ack_slot: parking_lot::Mutex<Option<oneshot::Sender<Result<AckPayload>>>>,
    handler: std::sync::OnceLock<Arc<dyn CloudHandler>>,
    session_cancel: parking_lot::Mutex<CancellationToken>,
    shutdown: AtomicBool,
}

impl CloudTransport {
    /// Create a transport with default timings.
    #[must_use]
    pub fn new(settings: CloudSettings, tokens: Arc<TokenManager>) -> Self {
        Self::with_timings(settings, tokens, CloudTimings::default())
    }

    /// Create a transport with explicit timings.
    #[must_use]
    pub fn with_timings(
        settings: CloudSettings,
        tokens: Arc<TokenManager>,
        timings: CloudTimings,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (state_tx, _) = watch::channel(ConnState::Idle);
        Self {
            settings,
            timings,
            tokens,
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            epoch: AtomicU64::new(0),
            state_tx,
            ack_slot: parking_lot::Mutex::new(None),
            handler: std::sync::OnceLock::new(),
            session_cancel: parking_lot::Mutex::new(CancellationToken::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Register the event handler. Must be called exactly once before
    /// [`CloudTransport::run`].
    pub fn register_handler(&self, handler: Arc<dyn CloudHandler>) {
        if self.handler.set(handler).is_err() {
            warn!("cloud handler already registered, ignoring");
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnState {
        *self.state_tx.borrow()
    }

    /// Observe connection state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnState> {
        self.state_tx.subscribe()
    }

    /// The epoch of the current (or most recent) connection.
    #[must_use]
    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Connect-with-retry loop; runs until cancelled, closed, or terminally
    /// auth-failed. This is the only place that touches the socket.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut policy = ReconnectPolicy::default();
        let mut fresh_token_rejected = false;

        loop {
            if cancel.is_cancelled() || self.shutdown.load(Ordering::SeqCst) {
                self.state_tx.send_replace(ConnState::Idle);
                break;
            }

            match self.connect().await {
                Ok(ws) => {
                    policy.reset();
                    fresh_token_rejected = false;
                    let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
                    self.state_tx.send_replace(ConnState::Connected);
                    info!(epoch, url = %self.settings.ws_url, "connected to cloud");

                    if let Some(handler) = self.handler.get() {
                        let handler = Arc::clone(handler);
                        tokio::spawn(async move { handler.on_connected(epoch).await });
                    }

                    let session_cancel = cancel.child_token();
                    *self.session_cancel.lock() = session_cancel.clone();
                    self.session(ws, epoch, &session_cancel).await;

                    self.release_ack("connection lost");
                    if let Some(handler) = self.handler.get() {
                        handler.on_disconnected().await;
                    }
                    if cancel.is_cancelled() || self.shutdown.load(Ordering::SeqCst) {
                        self.state_tx.send_replace(ConnState::Idle);
                        break;
                    }
                    self.state_tx.send_replace(ConnState::Reconnecting);
                    let delay = policy.next_delay();
                    warn!(delay_secs = delay.as_secs(), "connection lost, reconnecting");
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) if e.is_auth() => {
                    self.state_tx.send_replace(ConnState::AuthFailing);
                    if fresh_token_rejected {
                        self.terminate("cloud rejected a freshly refreshed token").await;
                        break;
                    }
                    match self.tokens.refresh().await {
                        Ok(_) => {
                            info!("token refreshed after auth rejection, redialing");
                            fresh_token_rejected = true;
                        }
                        Err(refresh_err) if refresh_err.is_terminal() => {
                            self.terminate(&refresh_err.to_string()).await;
                            break;
                        }
                        Err(refresh_err) => {
                            let delay = policy.next_delay();
                            warn!(error = %refresh_err, delay_secs = delay.as_secs(),
                                "refresh endpoint unreachable, backing off");
                            tokio::select! {
                                () = cancel.cancelled() => {}
                                () = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
                Err(e) => {
                    self.state_tx.send_replace(ConnState::Reconnecting);
                    let delay = policy.next_delay();
                    warn!(error = %e, delay_secs = delay.as_secs(), "dial failed, backing off");
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn terminate(&self, reason: &str) {
        error!(reason = %reason, "authentication failed terminally, re-login required");
        self.state_tx.send_replace(ConnState::Terminated);
        if let Some(handler) = self.handler.get() {
            handler.on_auth_terminated(reason.to_string()).await;
        }
    }

    /// One dial attempt with the current access token.
    async fn connect(&self) -> Result<WsStream> {
        self.state_tx.send_replace(ConnState::Connecting);

        let token = self.tokens.current().access_token;
        if token.is_empty() {
            return Err(Error::Auth("not logged in".to_string()));
        }

        let mut url = Url::parse(&self.settings.ws_url)
            .map_err(|e| Error::Config(format!("bad cloud url: {e}")))?;
        url.query_pairs_mut().append_pair("token", &token);

        let dialed = tokio::time::timeout(self.timings.dial, connect_async(url.as_str()))
            .await
            .map_err(|_| Error::Transport("dial timeout".to_string()))?;

        match dialed {
            Ok((ws, _response)) => Ok(ws),
            Err(tungstenite::Error::Http(response))
                if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
            {
                Err(Error::Auth(format!(
                    "cloud rejected token: HTTP {}",
                    response.status()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// One connection's lifetime: reader, writer, ping and heartbeat timers
    /// in a single select loop. Returns when the connection is gone.
    async fn session(&self, ws: WsStream, epoch: u64, cancel: &CancellationToken) {
        let (mut sink, mut stream) = ws.split();
        let mut outbound = self.outbound_rx.lock().await;

        let mut ping = interval_at(Instant::now() + self.timings.ping, self.timings.ping);
        let mut heartbeat = interval_at(
            Instant::now() + self.timings.heartbeat,
            self.timings.heartbeat,
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        // Graceful goodbye: drain what is already queued,
                        // then announce the disconnect.
                        while let Ok(out) = outbound.try_recv() {
                            if out.epoch != epoch {
                                continue;
                            }
                            if let Ok(json) = serde_json::to_string(&out.frame) {
                                let _ = sink.send(Message::text(json)).await;
                            }
                        }
                        if let Ok(json) = serde_json::to_string(&Frame::Disconnect {}) {
                            let _ = sink.send(Message::text(json)).await;
                        }
                        let _ = sink.flush().await;
                    }
                    break;
                }
                incoming = tokio::time::timeout(self.timings.read_idle, stream.next()) => {
                    match incoming {
                        Err(_) => {
                            warn!(epoch, "no frames within idle window, reconnecting");
                            break;
                        }
                        Ok(None) => {
                            info!(epoch, "cloud closed the connection");
                            break;
                        }
                        Ok(Some(Err(e))) => {
                            warn!(epoch, error = %e, "read failed");
                            break;
                        }
                        Ok(Some(Ok(message))) => match message {
                            Message::Text(text) => self.handle_frame(text.as_str(), epoch),
                            Message::Close(_) => {
                                info!(epoch, "close frame received");
                                break;
                            }
                            // tungstenite answers pings internally.
                            _ => {}
                        },
                    }
                }
                out = outbound.recv() => {
                    let Some(out) = out else { break };
                    if out.epoch != epoch {
                        debug!(frame = out.frame.type_name(), "dropping stale outbound frame");
                        continue;
                    }
                    let json = match serde_json::to_string(&out.frame) {
                        Ok(json) => json,
                        Err(e) => {
                            error!(error = %e, "unserializable outbound frame");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::text(json)).await {
                        warn!(epoch, error = %e, "write failed");
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    self.emit_heartbeat();
                    if self.tokens.expiring_within(self.timings.refresh_window) {
                        let tokens = Arc::clone(&self.tokens);
                        tokio::spawn(async move {
                            if let Err(e) = tokens.refresh().await {
                                warn!(error = %e, "proactive refresh failed");
                            }
                        });
                    }
                }
            }
        }
    }

    /// Decode one inbound frame and route it.
    fn handle_frame(&self, text: &str, epoch: u64) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "undecodable frame, ignoring");
                return;
            }
        };
        debug!(frame = frame.type_name(), epoch, "frame received");

        match frame {
            Frame::Ack(ack) => self.deposit_ack(Ok(ack)),
            Frame::Error(payload) => {
                let had_waiter = self.ack_slot.lock().is_some();
                if had_waiter {
                    self.deposit_ack(Err(Error::Protocol(payload.message)));
                } else {
                    warn!(message = %payload.message, "error frame from cloud");
                }
            }
            Frame::ToolCall(call) => self.spawn_handler(move |h| async move {
                h.on_tool_call(call, epoch).await;
            }),
            Frame::AddServer(payload) => self.spawn_handler(move |h| async move {
                h.on_provider_command(ProviderCommand::Add(payload)).await;
            }),
            Frame::RemoveServer(payload) => self.spawn_handler(move |h| async move {
                h.on_provider_command(ProviderCommand::Remove(payload)).await;
            }),
            Frame::ToggleServer(payload) => self.spawn_handler(move |h| async move {
                h.on_provider_command(ProviderCommand::Toggle(payload)).await;
            }),
            Frame::RequestSync(_) => self.spawn_handler(|h| async move {
                h.on_request_sync().await;
            }),
            Frame::PersonaSync(payload) => self.spawn_handler(move |h| async move {
                h.on_persona_sync(payload).await;
            }),
            Frame::MemoryUpdate(payload) => {
                debug!(payload = %payload, "memory_update received");
            }
            Frame::Heartbeat(_) => {}
            other => {
                warn!(frame = other.type_name(), "unexpected inbound frame type");
            }
        }
    }

    fn spawn_handler<F, Fut>(&self, f: F)
    where
        F: FnOnce(Arc<dyn CloudHandler>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Some(handler) = self.handler.get() {
            let handler = Arc::clone(handler);
            tokio::spawn(f(handler));
        }
    }

    /// Announce the merged catalogue and wait for the cloud's
    /// acknowledgement.
    ///
    /// # Errors
    ///
    /// `Timeout` when no acknowledgement arrives in the window, `Transport`
    /// when the connection drops while waiting, `Protocol` when the cloud
    /// answers with an error frame.
    pub async fn announce_capabilities(
        &self,
        tools: Vec<WireTool>,
        servers: Vec<WireServer>,
    ) -> Result<AckPayload> {
        let frame = Frame::RegisterTools(RegisterToolsPayload {
            client_id: self.settings.client_id.clone(),
            client_version: self.settings.client_version.clone(),
            platform: self.settings.platform.clone(),
            tools,
            servers,
        });

        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.ack_slot.lock();
            if slot.is_some() {
                return Err(Error::Internal("announcement already pending".to_string()));
            }
            *slot = Some(tx);
        }

        if let Err(e) = self.enqueue_critical(frame).await {
            self.ack_slot.lock().take();
            return Err(e);
        }

        match tokio::time::timeout(self.timings.announce_ack, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Transport("connection lost".to_string())),
            Err(_) => {
                self.ack_slot.lock().take();
                Err(Error::Timeout("no announcement acknowledgement".to_string()))
            }
        }
    }

    /// Enqueue a result frame. Never silently dropped: a full queue gets a
    /// bounded wait and then tears the connection down so the cloud retries
    /// upstream.
    pub async fn emit_result(&self, payload: ToolResultPayload, epoch: u64) -> Result<()> {
        if epoch != self.current_epoch() {
            debug!(call_id = %payload.call_id, "result from a previous epoch, dropped");
            return Ok(());
        }
        let out = Outbound {
            frame: Frame::ToolResult(payload),
            epoch,
        };
        match self.outbound_tx.try_send(out) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(out)) => {
                warn!("outbound queue full, bounded wait for result frame");
                match tokio::time::timeout(self.timings.result_enqueue, self.outbound_tx.send(out))
                    .await
                {
                    Ok(Ok(())) => Ok(()),
                    _ => {
                        error!("outbound queue stuck, tearing connection down");
                        self.teardown();
                        Err(Error::Transport("outbound queue full".to_string()))
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::Shutdown),
        }
    }

    /// Enqueue a heartbeat; dropped with a log under backpressure.
    pub fn emit_heartbeat(&self) {
        self.enqueue_droppable(Frame::Heartbeat(HeartbeatPayload::now()));
    }

    /// Enqueue a supervisory command acknowledgement; droppable.
    pub fn emit_command_ack(&self, request_id: &str, success: bool, error: &str) {
        self.enqueue_droppable(Frame::ServerCommandAck(
            crate::protocol::ServerCommandAckPayload {
                request_id: request_id.to_string(),
                success,
                error: error.to_string(),
            },
        ));
    }

    /// Enqueue a `sync_state` snapshot; droppable.
    pub fn emit_sync_state(&self, payload: SyncStatePayload) {
        self.enqueue_droppable(Frame::SyncState(payload));
    }

    /// Graceful close: goodbye frame, brief drain, stop reconnecting.
    pub async fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.session_cancel.lock().cancel();
        // Give the session a moment to flush the goodbye.
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    fn enqueue_droppable(&self, frame: Frame) {
        let out = Outbound {
            epoch: self.current_epoch(),
            frame,
        };
        if let Err(mpsc::error::TrySendError::Full(out)) = self.outbound_tx.try_send(out) {
            warn!(frame = out.frame.type_name(), "outbound queue full, frame dropped");
        }
    }

    async fn enqueue_critical(&self, frame: Frame) -> Result<()> {
        let out = Outbound {
            epoch: self.current_epoch(),
            frame,
        };
        tokio::time::timeout(self.timings.result_enqueue, self.outbound_tx.send(out))
            .await
            .map_err(|_| Error::Transport("outbound queue full".to_string()))?
            .map_err(|_| Error::Shutdown)
    }

    fn deposit_ack(&self, result: Result<AckPayload>) {
        if let Some(tx) = self.ack_slot.lock().take() {
            let _ = tx.send(result);
        } else {
            debug!("acknowledgement with no waiter");
        }
    }

    fn release_ack(&self, reason: &str) {
        if let Some(tx) = self.ack_slot.lock().take() {
            let _ = tx.send(Err(Error::Transport(reason.to_string())));
        }
    }

    fn teardown(&self) {
        self.session_cancel.lock().cancel();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::auth::TokenSnapshot;

    fn transport() -> Arc<CloudTransport> {
        let tokens = Arc::new(
            TokenManager::new(
                "http://127.0.0.1:1",
                TokenSnapshot {
                    access_token: "at".into(),
                    refresh_token: "rt".into(),
                    expires_at: i64::MAX,
                    device_id: None,
                },
                Box::new(|_| {}),
            )
            .unwrap(),
        );
        Arc::new(CloudTransport::new(
            CloudSettings {
                ws_url: "ws://127.0.0.1:1/ws".into(),
                client_id: "test".into(),
                client_version: "0.0.0".into(),
                platform: "test".into(),
            },
            tokens,
        ))
    }

    #[tokio::test]
    async fn announce_resolves_on_ack() {
        let transport = transport();
        let inner = Arc::clone(&transport);
        let announce =
            tokio::spawn(async move { inner.announce_capabilities(vec![], vec![]).await });

        // Let the waiter install itself, then deposit the acknowledgement
        // the way the reader does.
        tokio::task::yield_now().await;
        for _ in 0..100 {
            if transport.ack_slot.lock().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        transport.deposit_ack(Ok(AckPayload {
            status: "ok".into(),
            tools_registered: 2,
        }));

        let ack = announce.await.unwrap().unwrap();
        assert_eq!(ack.tools_registered, 2);
    }

    #[tokio::test]
    async fn announce_fails_on_error_frame() {
        let transport = transport();
        let inner = Arc::clone(&transport);
        let announce =
            tokio::spawn(async move { inner.announce_capabilities(vec![], vec![]).await });

        for _ in 0..100 {
            if transport.ack_slot.lock().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        transport.handle_frame(
            r#"{"type":"error","payload":{"message":"backend down"}}"#,
            1,
        );

        let err = announce.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn announce_times_out_without_ack() {
        let tokens = Arc::new(
            TokenManager::new(
                "http://127.0.0.1:1",
                TokenSnapshot {
                    access_token: "at".into(),
                    refresh_token: "rt".into(),
                    expires_at: i64::MAX,
                    device_id: None,
                },
                Box::new(|_| {}),
            )
            .unwrap(),
        );
        let timings = CloudTimings {
            announce_ack: Duration::from_millis(50),
            ..CloudTimings::default()
        };
        let transport = CloudTransport::with_timings(
            CloudSettings {
                ws_url: "ws://127.0.0.1:1/ws".into(),
                client_id: "test".into(),
                client_version: "0.0.0".into(),
                platform: "test".into(),
            },
            tokens,
            timings,
        );

        let err = transport
            .announce_capabilities(vec![], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        // The slot is cleared so a later announcement can proceed.
        assert!(transport.ack_slot.lock().is_none());
    }

    #[tokio::test]
    async fn heartbeats_drop_when_queue_full() {
        let transport = transport();
        for _ in 0..OUTBOUND_CAPACITY {
            transport.emit_heartbeat();
        }
        assert_eq!(transport.outbound_tx.capacity(), 0);
        // The 101st is dropped, not queued and not a panic.
        transport.emit_heartbeat();
        assert_eq!(transport.outbound_tx.capacity(), 0);
    }

    #[tokio::test]
    async fn stale_epoch_results_are_dropped() {
        let transport = transport();
        transport.epoch.store(2, Ordering::SeqCst);
        let before = transport.outbound_tx.capacity();
        transport
            .emit_result(ToolResultPayload::ok("c1", "late"), 1)
            .await
            .unwrap();
        assert_eq!(transport.outbound_tx.capacity(), before);
    }

    #[tokio::test]
    async fn full_queue_result_tears_down() {
        let tokens = Arc::new(
            TokenManager::new(
                "http://127.0.0.1:1",
                TokenSnapshot {
                    access_token: "at".into(),
                    refresh_token: "rt".into(),
                    expires_at: i64::MAX,
                    device_id: None,
                },
                Box::new(|_| {}),
            )
            .unwrap(),
        );
        let timings = CloudTimings {
            result_enqueue: Duration::from_millis(50),
            ..CloudTimings::default()
        };
        let transport = CloudTransport::with_timings(
            CloudSettings {
                ws_url: "ws://127.0.0.1:1/ws".into(),
                client_id: "test".into(),
                client_version: "0.0.0".into(),
                platform: "test".into(),
            },
            tokens,
            timings,
        );
        let session_cancel = transport.session_cancel.lock().clone();

        for _ in 0..OUTBOUND_CAPACITY {
            transport.emit_heartbeat();
        }
        let err = transport
            .emit_result(ToolResultPayload::ok("c1", "x"), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(session_cancel.is_cancelled());
    }

    #[test]
    fn state_strings_are_stable() {
        assert_eq!(ConnState::Connected.as_str(), "connected");
        assert_eq!(ConnState::Terminated.as_str(), "auth_failed");
        assert_eq!(ConnState::Reconnecting.as_str(), "reconnecting");
    }
}
