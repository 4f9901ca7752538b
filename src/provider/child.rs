//! One provider subprocess: spawn, serialized line request/response, stderr
//! drain, graceful stop.
//!
//! Each child owns two pipes. A dedicated actor task serializes requests so
//! a provider only ever sees one request line at a time; responses are
//! matched FIFO. A stuck provider therefore never blocks another one.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProviderConfig;
use crate::protocol::ProviderRequest;
use crate::{Error, Result};

/// Grace window between closing stdin and reaping the child.
const STOP_GRACE: Duration = Duration::from_millis(500);

struct ChildRequest {
    line: String,
    deadline: Duration,
    reply: oneshot::Sender<Result<String>>,
}

/// Handle to a running provider subprocess.
#[derive(Clone)]
pub(crate) struct ChildHandle {
    name: String,
    requests: mpsc::Sender<ChildRequest>,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
}

impl ChildHandle {
    /// Spawn the subprocess and its actor task. `exit_tx` receives the
    /// provider name when the child dies on its own.
    pub(crate) fn spawn(
        config: &ProviderConfig,
        exit_tx: mpsc::UnboundedSender<String>,
    ) -> Result<Self> {
        let (program, args) = resolve_command(config)?;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Spawn(format!("{program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("no stdin pipe".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("no stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Spawn("no stderr pipe".to_string()))?;

        // Drain standard error into the log so a chatty provider cannot
        // fill its pipe and stall.
        let stderr_name = config.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(provider = %stderr_name, "stderr: {line}");
            }
        });

        let (requests_tx, requests_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let alive = Arc::new(AtomicBool::new(true));

        let actor = ChildActor {
            name: config.name.clone(),
            child,
            stdin: Some(stdin),
            cancel: cancel.clone(),
            alive: Arc::clone(&alive),
            exit_tx,
        };
        tokio::spawn(actor.run(BufReader::new(stdout), requests_rx));

        Ok(Self {
            name: config.name.clone(),
            requests: requests_tx,
            cancel,
            alive,
        })
    }

    /// Send one request line and await the matching response line.
    pub(crate) async fn request(
        &self,
        request: &ProviderRequest,
        deadline: Duration,
    ) -> Result<String> {
        if !self.is_alive() {
            return Err(Error::ProviderUnavailable(self.name.clone()));
        }

        let line = serde_json::to_string(request)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.requests
            .send(ChildRequest {
                line,
                deadline,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::ProviderUnavailable(self.name.clone()))?;

        reply_rx
            .await
            .map_err(|_| Error::ProviderUnavailable(self.name.clone()))?
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    /// Graceful stop: the actor closes stdin, waits out the grace window,
    /// then kills.
    pub(crate) async fn stop(&self) {
        self.cancel.cancel();
        // The actor flips `alive` off as its final act.
        let mut waited = Duration::ZERO;
        while self.is_alive() && waited < STOP_GRACE * 4 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            waited += Duration::from_millis(25);
        }
    }
}

/// Split the descriptor into program + argv. A bare command string with
/// embedded arguments is split shell-style.
fn resolve_command(config: &ProviderConfig) -> Result<(String, Vec<String>)> {
    if config.command.trim().is_empty() {
        return Err(Error::BadSpec(format!("{}: empty command", config.name)));
    }
    if !config.args.is_empty() {
        return Ok((config.command.clone(), config.args.clone()));
    }
    let mut parts = shlex::split(&config.command)
        .ok_or_else(|| Error::BadSpec(format!("{}: unparseable command", config.name)))?;
    if parts.is_empty() {
        return Err(Error::BadSpec(format!("{}: empty command", config.name)));
    }
    let program = parts.remove(0);
    Ok((program, parts))
}

struct ChildActor {
    name: String,
    child: Child,
    stdin: Option<ChildStdin>,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
    exit_tx: mpsc::UnboundedSender<String>,
}

struct Pending {
    reply: oneshot::Sender<Result<String>>,
    deadline: Instant,
}

impl ChildActor {
    async fn run(
        mut self,
        stdout: BufReader<tokio::process::ChildStdout>,
        mut requests: mpsc::Receiver<ChildRequest>,
    ) {
        let mut lines = stdout.lines();
        let mut pending: Option<Pending> = None;
        let mut died = false;

        loop {
            if let Some(deadline) = pending.as_ref().map(|p| p.deadline) {
                tokio::select! {
                    () = self.cancel.cancelled() => {
                        if let Some(p) = pending.take() {
                            let _ = p.reply.send(Err(Error::ProviderUnavailable(self.name.clone())));
                        }
                        break;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Some(p) = pending.take() {
                                let _ = p.reply.send(Ok(line));
                            }
                        }
                        Ok(None) | Err(_) => {
                            if let Some(p) = pending.take() {
                                let _ = p.reply.send(Err(Error::ProviderUnavailable(self.name.clone())));
                            }
                            died = true;
                            break;
                        }
                    },
                    () = tokio::time::sleep_until(deadline) => {
                        if let Some(p) = pending.take() {
                            let _ = p.reply.send(Err(Error::Timeout(format!(
                                "{}: no response before deadline", self.name
                            ))));
                        }
                        // A silent provider is killed, not waited on.
                        died = true;
                        break;
                    }
                }
            } else {
                tokio::select! {
                    () = self.cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            warn!(provider = %self.name, "unsolicited output: {line}");
                        }
                        Ok(None) | Err(_) => {
                            died = true;
                            break;
                        }
                    },
                    request = requests.recv() => match request {
                        None => break,
                        Some(request) => {
                            if let Err(e) = self.write_line(&request.line).await {
                                let _ = request.reply.send(Err(e));
                                died = true;
                                break;
                            }
                            pending = Some(Pending {
                                reply: request.reply,
                                deadline: Instant::now() + request.deadline,
                            });
                        }
                    }
                }
            }
        }

        // Refuse anything still queued.
        requests.close();
        while let Ok(request) = requests.try_recv() {
            let _ = request
                .reply
                .send(Err(Error::ProviderUnavailable(self.name.clone())));
        }

        self.reap().await;
        self.alive.store(false, Ordering::Relaxed);
        if died {
            let _ = self.exit_tx.send(self.name.clone());
        }
        debug!(provider = %self.name, "child actor finished");
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::ProviderUnavailable(self.name.clone()))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::ProviderUnavailable(format!("{}: {e}", self.name)))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| Error::ProviderUnavailable(format!("{}: {e}", self.name)))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::ProviderUnavailable(format!("{}: {e}", self.name)))?;
        Ok(())
    }

    /// Close stdin, give the child the grace window, then kill.
    async fn reap(&mut self) {
        drop(self.stdin.take());
        match tokio::time::timeout(STOP_GRACE, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = self.child.kill().await;
            }
        }
    }
}
