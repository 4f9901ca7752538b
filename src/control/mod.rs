//! Local control channel (C6)
//!
//! An OS-local, user-scoped endpoint serving multiple concurrent clients.
//! Each session is one task: it pushes the status snapshot on connect,
//! relays broadcasts under a per-write deadline, and routes supervisory
//! commands to the orchestrator. A slow client only ever kills its own
//! session.

pub mod client;
pub mod endpoint;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{AddServerPayload, ErrorPayload, LocalFrame, StatusPayload};
use crate::{Error, Result};

/// Per-client write deadline; a session that cannot take a frame within
/// this window is closed.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// A supervisory request routed to the orchestrator.
#[derive(Debug)]
pub enum ControlRequest {
    /// Add a provider descriptor and start it when enabled
    Add(AddServerPayload),
    /// Remove a provider descriptor, stopping any instance
    Remove(String),
    /// Set or flip a provider's enabled flag
    Toggle {
        /// Provider name
        name: String,
        /// Desired state; `None` flips
        enabled: Option<bool>,
    },
    /// Stop the bridge
    Shutdown,
}

/// One command plus its completion channel.
#[derive(Debug)]
pub struct ControlCommand {
    /// What to do
    pub request: ControlRequest,
    /// Resolved by the orchestrator once applied and persisted
    pub reply: oneshot::Sender<Result<()>>,
}

/// Local control server (C6)
pub struct ControlServer {
    status_rx: watch::Receiver<StatusPayload>,
    broadcast_tx: broadcast::Sender<LocalFrame>,
    commands_tx: mpsc::Sender<ControlCommand>,
    write_deadline: Duration,
    sessions: AtomicUsize,
}

impl ControlServer {
    /// Create a server. `status_rx` feeds the snapshot pushed to every new
    /// client; `commands_tx` routes supervisory commands to the
    /// orchestrator.
    #[must_use]
    pub fn new(
        status_rx: watch::Receiver<StatusPayload>,
        commands_tx: mpsc::Sender<ControlCommand>,
    ) -> Self {
        Self::with_write_deadline(status_rx, commands_tx, WRITE_DEADLINE)
    }

    /// Same with an explicit write deadline (tests shorten it).
    #[must_use]
    pub fn with_write_deadline(
        status_rx: watch::Receiver<StatusPayload>,
        commands_tx: mpsc::Sender<ControlCommand>,
        write_deadline: Duration,
    ) -> Self {
        let (broadcast_tx, _) = broadcast::channel(64);
        Self {
            status_rx,
            broadcast_tx,
            commands_tx,
            write_deadline,
            sessions: AtomicUsize::new(0),
        }
    }

    /// Broadcast a frame to every connected client.
    pub fn broadcast(&self, frame: LocalFrame) {
        // No receivers is normal when nothing is attached.
        let _ = self.broadcast_tx.send(frame);
    }

    /// Connected session count.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Bind the OS-local endpoint and serve until cancelled. The PID and
    /// socket/port files are written only after a successful bind and
    /// removed on the way out, so a losing second instance never disturbs
    /// the winner's files.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning` when a live bridge answers on the endpoint,
    /// `Io`/`Config` for bind failures.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        self.serve(cancel).await
    }

    #[cfg(unix)]
    async fn serve(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let path = endpoint::socket_path();
        if path.exists() {
            if probe().await {
                return Err(Error::AlreadyRunning("bridge".to_string()));
            }
            // Nobody answers: a previous run died without cleanup.
            debug!(path = %path.display(), "removing stale socket");
            let _ = std::fs::remove_file(&path);
        }

        let listener = tokio::net::UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        write_pid_file()?;
        info!(path = %path.display(), "local control endpoint bound");

        self.accept_loop(listener, cancel).await;
        cleanup_endpoint_files();
        Ok(())
    }

    /// Serve on an already-bound listener. No PID or socket file handling;
    /// the caller owns the path.
    #[cfg(unix)]
    pub async fn run_on(self: Arc<Self>, listener: tokio::net::UnixListener, cancel: CancellationToken) {
        self.accept_loop(listener, cancel).await;
    }

    #[cfg(unix)]
    async fn accept_loop(
        self: Arc<Self>,
        listener: tokio::net::UnixListener,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((stream, _addr)) = accepted else { continue };
                    self.spawn_session(stream, cancel.child_token());
                }
            }
        }
    }

    #[cfg(windows)]
    async fn serve(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        if probe().await {
            return Err(Error::AlreadyRunning("bridge".to_string()));
        }

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        std::fs::write(endpoint::port_file_path(), port.to_string())?;
        write_pid_file()?;
        info!(port, "local control endpoint bound");

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let Ok((stream, _addr)) = accepted else { continue };
                    self.spawn_session(stream, cancel.child_token());
                }
            }
        }
        cleanup_endpoint_files();
        Ok(())
    }

    fn spawn_session<S>(self: &Arc<Self>, stream: S, cancel: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            server.sessions.fetch_add(1, Ordering::SeqCst);
            server.session(stream, cancel).await;
            server.sessions.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn session<S>(&self, stream: S, cancel: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();
        let mut broadcast_rx = self.broadcast_tx.subscribe();

        // The current snapshot goes out first.
        let snapshot = LocalFrame::Status(self.status_rx.borrow().clone());
        if self.write_frame(&mut write_half, &snapshot).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                line = lines.next_line() => {
                    let frame = match line {
                        Ok(Some(line)) if line.trim().is_empty() => continue,
                        Ok(Some(line)) => match serde_json::from_str::<LocalFrame>(&line) {
                            Ok(frame) => frame,
                            Err(e) => {
                                let reply = LocalFrame::Error(ErrorPayload {
                                    message: format!("bad frame: {e}"),
                                });
                                if self.write_frame(&mut write_half, &reply).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        },
                        Ok(None) | Err(_) => break,
                    };
                    if self.handle_client_frame(frame, &mut write_half).await.is_err() {
                        break;
                    }
                }
                broadcasted = broadcast_rx.recv() => match broadcasted {
                    Ok(frame) => {
                        if self.write_frame(&mut write_half, &frame).await.is_err() {
                            warn!("closing slow local client session");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "local client lagged, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    /// Handle one frame from the client. An `Err` return ends the session.
    async fn handle_client_frame<W>(&self, frame: LocalFrame, write: &mut W) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin,
    {
        match frame {
            LocalFrame::Ping {} => self.write_frame(write, &LocalFrame::Pong {}).await,
            LocalFrame::AddServer(payload) => {
                let outcome = self.submit(ControlRequest::Add(payload)).await;
                self.write_outcome(write, outcome).await
            }
            LocalFrame::RemoveServer(payload) => {
                let outcome = self.submit(ControlRequest::Remove(payload.name)).await;
                self.write_outcome(write, outcome).await
            }
            LocalFrame::ToggleServer(payload) => {
                let outcome = self
                    .submit(ControlRequest::Toggle {
                        name: payload.name,
                        enabled: payload.enabled,
                    })
                    .await;
                self.write_outcome(write, outcome).await
            }
            LocalFrame::Shutdown {} => {
                // Acknowledge first; the orchestrator will tear this
                // session down along with everything else.
                self.write_frame(write, &LocalFrame::Ok {}).await?;
                let _ = self.submit(ControlRequest::Shutdown).await;
                Ok(())
            }
            unexpected => {
                let reply = LocalFrame::Error(ErrorPayload {
                    message: format!("unexpected frame: {}", local_frame_name(&unexpected)),
                });
                self.write_frame(write, &reply).await
            }
        }
    }

    async fn submit(&self, request: ControlRequest) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands_tx
            .send(ControlCommand {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Shutdown)?;
        reply_rx.await.map_err(|_| Error::Shutdown)?
    }

    async fn write_outcome<W>(&self, write: &mut W, outcome: Result<()>) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let frame = match outcome {
            Ok(()) => LocalFrame::Ok {},
            Err(e) => LocalFrame::Error(ErrorPayload {
                message: e.to_string(),
            }),
        };
        self.write_frame(write, &frame).await
    }

    async fn write_frame<W>(&self, write: &mut W, frame: &LocalFrame) -> Result<()>
    where
        W: AsyncWrite + Send + Unpin,
    {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');
        tokio::time::timeout(self.write_deadline, write.write_all(line.as_bytes()))
            .await
            .map_err(|_| Error::Timeout("local client write deadline".to_string()))??;
        Ok(())
    }
}

fn local_frame_name(frame: &LocalFrame) -> &'static str {
    match frame {
        LocalFrame::Status(_) => "status",
        LocalFrame::Activity(_) => "activity",
        LocalFrame::AddServer(_) => "add_server",
        LocalFrame::RemoveServer(_) => "remove_server",
        LocalFrame::ToggleServer(_) => "toggle_server",
        LocalFrame::Shutdown {} => "shutdown",
        LocalFrame::Ping {} => "ping",
        LocalFrame::Pong {} => "pong",
        LocalFrame::Ok {} => "ok",
        LocalFrame::Error(_) => "error",
    }
}

/// Probe for a live bridge by connecting to the endpoint.
pub async fn probe() -> bool {
    #[cfg(unix)]
    {
        tokio::net::UnixStream::connect(endpoint::socket_path())
            .await
            .is_ok()
    }
    #[cfg(windows)]
    {
        let Ok(raw) = std::fs::read_to_string(endpoint::port_file_path()) else {
            return false;
        };
        let Ok(port) = raw.trim().parse::<u16>() else {
            return false;
        };
        tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .is_ok()
    }
}

fn write_pid_file() -> Result<()> {
    let path = endpoint::pid_file_path();
    std::fs::write(&path, std::process::id().to_string())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))?;
    }
    Ok(())
}

fn cleanup_endpoint_files() {
    #[cfg(unix)]
    let _ = std::fs::remove_file(endpoint::socket_path());
    #[cfg(windows)]
    let _ = std::fs::remove_file(endpoint::port_file_path());
    let _ = std::fs::remove_file(endpoint::pid_file_path());
}
