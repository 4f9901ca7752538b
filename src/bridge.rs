//! Orchestrator (C7)
//!
//! Owns every component, the startup and shutdown order, signal handling,
//! the supervisory command path shared by local clients and the cloud, and
//! the full catalogue re-announcement after every reconnect.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{TokenManager, TokenSnapshot};
use crate::catalog::ToolCatalog;
use crate::cloud::{
    CloudHandler, CloudSettings, CloudTransport, ConnState, ProviderCommand,
};
use crate::config::{Config, ProviderConfig};
use crate::control::{ControlCommand, ControlRequest, ControlServer};
use crate::dispatch::{Dispatcher, ResultSink};
use crate::protocol::{
    LocalFrame, ProviderStatus, StatusPayload, SyncStatePayload, ToolCallPayload, WireServer,
};
use crate::provider::{ProviderEvent, ProviderSupervisor};
use crate::tools::core_tool_defs;
use crate::{Error, Result};

struct SharedConfig {
    path: PathBuf,
    config: parking_lot::Mutex<Config>,
}

impl SharedConfig {
    fn save(&self) -> Result<()> {
        let config = self.config.lock().clone();
        config.save(&self.path)
    }
}

/// The orchestrated bridge.
pub struct Bridge {
    shared: Arc<SharedConfig>,
    catalog: Arc<ToolCatalog>,
    supervisor: Arc<ProviderSupervisor>,
    transport: Arc<CloudTransport>,
    dispatcher: Arc<Dispatcher>,
    control: Arc<ControlServer>,
    commands_tx: mpsc::Sender<ControlCommand>,
    status_tx: watch::Sender<StatusPayload>,
    cancel: CancellationToken,
    started: Instant,
}

impl Bridge {
    /// Run the bridge in the foreground until a signal or a `shutdown`
    /// command arrives.
    ///
    /// # Errors
    ///
    /// `Config` for missing/unparseable state, `Auth` when no credentials
    /// are cached, `AlreadyRunning` when another bridge owns the endpoint.
    pub async fn run(config_path: PathBuf) -> Result<()> {
        let config = Config::load(&config_path)?;
        if !config.auth.is_logged_in() {
            return Err(Error::Auth(
                "no credentials - run 'clara-companion login' first".to_string(),
            ));
        }

        let cancel = CancellationToken::new();
        let started = Instant::now();
        let shared = Arc::new(SharedConfig {
            path: config_path,
            config: parking_lot::Mutex::new(config.clone()),
        });

        // C1: token manager, persisting each rotation back into the config.
        let persist_target = Arc::clone(&shared);
        let tokens = Arc::new(TokenManager::new(
            &config.cloud.api_base,
            TokenSnapshot::from(config.auth.clone()),
            Box::new(move |snapshot: &TokenSnapshot| {
                persist_target.config.lock().auth = snapshot.into();
                if let Err(e) = persist_target.save() {
                    warn!(error = %e, "failed to persist rotated credentials");
                }
            }),
        )?);

        // C3 before C2: the supervisor publishes into the catalogue.
        let catalog = Arc::new(ToolCatalog::new());
        catalog.publish_core(core_tool_defs());
        let (supervisor, provider_events) = ProviderSupervisor::new(Arc::clone(&catalog));

        // C2: start every enabled provider. Failures surface in status, not
        // as startup errors.
        for provider in config.providers.iter().filter(|p| p.enabled) {
            if let Err(e) = supervisor.start(provider).await {
                warn!(provider = %provider.name, error = %e, "provider failed to start");
            }
        }

        // C6
        let (status_tx, status_rx) = watch::channel(build_status(
            &config,
            &supervisor,
            ConnState::Idle,
            started,
        ));
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let control = Arc::new(ControlServer::new(status_rx, commands_tx.clone()));

        // C4 + C5
        let client_id = config
            .auth
            .device_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let transport = Arc::new(CloudTransport::new(
            CloudSettings {
                ws_url: config.cloud.ws_url.clone(),
                client_id,
                client_version: env!("CARGO_PKG_VERSION").to_string(),
                platform: std::env::consts::OS.to_string(),
            },
            Arc::clone(&tokens),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&catalog),
            Arc::clone(&supervisor),
            Arc::clone(&transport) as Arc<dyn ResultSink>,
        ));

        let bridge = Arc::new(Self {
            shared,
            catalog,
            supervisor,
            transport,
            dispatcher,
            control,
            commands_tx,
            status_tx,
            cancel,
            started,
        });
        bridge
            .transport
            .register_handler(Arc::clone(&bridge) as Arc<dyn CloudHandler>);

        bridge.serve(commands_rx, provider_events).await
    }

    async fn serve(
        self: Arc<Self>,
        mut commands_rx: mpsc::Receiver<ControlCommand>,
        provider_events: mpsc::UnboundedReceiver<ProviderEvent>,
    ) -> Result<()> {
        info!(version = env!("CARGO_PKG_VERSION"), "bridge starting");

        let mut control_task = tokio::spawn(
            Arc::clone(&self.control).run(self.cancel.clone()),
        );
        let cloud_task = tokio::spawn(
            Arc::clone(&self.transport).run(self.cancel.clone()),
        );
        tokio::spawn(Arc::clone(&self).status_loop(provider_events));
        tokio::spawn(Arc::clone(&self).activity_loop());

        let terminate = wait_for_terminate_signal();
        tokio::pin!(terminate);
        let mut control_result: Option<Result<()>> = None;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                signal = tokio::signal::ctrl_c() => {
                    if signal.is_ok() {
                        info!("interrupt received, shutting down");
                    }
                    break;
                }
                () = &mut terminate => {
                    info!("terminate received, shutting down");
                    break;
                }
                command = commands_rx.recv() => {
                    let Some(command) = command else { break };
                    let outcome = self.apply_request(command.request).await;
                    let _ = command.reply.send(outcome);
                }
                finished = &mut control_task => {
                    control_result = Some(match finished {
                        Ok(result) => result,
                        Err(e) => Err(Error::Internal(format!("control task: {e}"))),
                    });
                    break;
                }
            }
        }

        // Shutdown order: local endpoint, cloud channel, providers.
        self.cancel.cancel();
        self.transport.close().await;
        self.supervisor.stop_all().await;
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), cloud_task).await;
        if !control_task.is_finished() {
            let _ =
                tokio::time::timeout(std::time::Duration::from_secs(2), &mut control_task).await;
        }

        match control_result {
            // The endpoint failed to bind or crashed; surface that.
            Some(Err(e)) => Err(e),
            _ => {
                info!("bridge shutdown complete");
                Ok(())
            }
        }
    }

    /// Apply one supervisory request: mutate configuration, persist, adjust
    /// the running set, then broadcast status.
    async fn apply_request(&self, request: ControlRequest) -> Result<()> {
        match request {
            ControlRequest::Add(payload) => {
                if payload.name.is_empty() || payload.command.is_empty() {
                    return Err(Error::Config("name and command are required".to_string()));
                }
                let descriptor = ProviderConfig {
                    name: payload.name.clone(),
                    description: payload.description,
                    command: payload.command,
                    args: payload.args,
                    transport: "stdio".to_string(),
                    enabled: payload.enabled,
                };
                {
                    let mut config = self.shared.config.lock();
                    if config.provider(&payload.name).is_some() {
                        return Err(Error::Config(format!(
                            "provider {} already exists",
                            payload.name
                        )));
                    }
                    config.providers.push(descriptor.clone());
                }
                self.shared.save()?;
                if descriptor.enabled {
                    if let Err(e) = self.supervisor.start(&descriptor).await {
                        warn!(provider = %descriptor.name, error = %e, "provider failed to start");
                    }
                }
                self.push_status();
                Ok(())
            }
            ControlRequest::Remove(name) => {
                {
                    let mut config = self.shared.config.lock();
                    if config.provider(&name).is_none() {
                        return Err(Error::Config(format!("no such provider: {name}")));
                    }
                    config.providers.retain(|p| p.name != name);
                }
                self.shared.save()?;
                let _ = self.supervisor.stop(&name).await;
                self.push_status();
                Ok(())
            }
            ControlRequest::Toggle { name, enabled } => {
                let descriptor = {
                    let mut config = self.shared.config.lock();
                    let Some(provider) = config.provider_mut(&name) else {
                        return Err(Error::Config(format!("no such provider: {name}")));
                    };
                    provider.enabled = enabled.unwrap_or(!provider.enabled);
                    provider.clone()
                };
                self.shared.save()?;
                if descriptor.enabled {
                    if !self.supervisor.is_running(&name) {
                        if let Err(e) = self.supervisor.start(&descriptor).await {
                            warn!(provider = %name, error = %e, "provider failed to start");
                        }
                    }
                } else {
                    let _ = self.supervisor.stop(&name).await;
                }
                self.push_status();
                Ok(())
            }
            ControlRequest::Shutdown => {
                info!("shutdown requested over the local channel");
                self.cancel.cancel();
                Ok(())
            }
        }
    }

    fn push_status(&self) {
        let status = {
            let config = self.shared.config.lock();
            build_status(&config, &self.supervisor, self.transport.state(), self.started)
        };
        self.status_tx.send_replace(status.clone());
        self.control.broadcast(LocalFrame::Status(status));
    }

    /// Recompute status on every connection-state change and provider exit.
    async fn status_loop(
        self: Arc<Self>,
        mut provider_events: mpsc::UnboundedReceiver<ProviderEvent>,
    ) {
        let mut state_rx = self.transport.watch_state();
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.push_status();
                }
                event = provider_events.recv() => {
                    match event {
                        Some(ProviderEvent::Exited { name }) => {
                            warn!(provider = %name, "provider gone, status updated");
                            self.push_status();
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Relay completed invocations to local clients.
    async fn activity_loop(self: Arc<Self>) {
        let mut activity_rx = self.dispatcher.subscribe_activity();
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                record = activity_rx.recv() => match record {
                    Ok(record) => self.control.broadcast(LocalFrame::Activity(record)),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
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
}

#[async_trait]
impl CloudHandler for Bridge {
    async fn on_connected(&self, epoch: u64) {
        self.push_status();

        let tools = self.catalog.wire_snapshot();
        let servers = {
            let config = self.shared.config.lock();
            wire_servers(&config)
        };
        match self.transport.announce_capabilities(tools, servers).await {
            Ok(ack) => {
                info!(
                    epoch,
                    tools_registered = ack.tools_registered,
                    "capabilities announced"
                );
            }
            Err(e) => {
                // Not fatal: the next heartbeat or reconnect retries.
                warn!(epoch, error = %e, "capability announcement not acknowledged");
            }
        }
    }

    async fn on_disconnected(&self) {
        self.push_status();
    }

    async fn on_tool_call(&self, call: ToolCallPayload, epoch: u64) {
        self.dispatcher.handle_tool_call(call, epoch).await;
    }

    async fn on_provider_command(&self, command: ProviderCommand) {
        let request_id = command.request_id().to_string();
        let request = match command {
            ProviderCommand::Add(payload) => ControlRequest::Add(payload),
            ProviderCommand::Remove(payload) => ControlRequest::Remove(payload.name),
            ProviderCommand::Toggle(payload) => ControlRequest::Toggle {
                name: payload.name,
                enabled: payload.enabled,
            },
        };
        let outcome = self.submit(request).await;
        match outcome {
            Ok(()) => self.transport.emit_command_ack(&request_id, true, ""),
            Err(e) => {
                self.transport
                    .emit_command_ack(&request_id, false, &e.to_string());
            }
        }
    }

    async fn on_request_sync(&self) {
        debug!("sync requested, answering with an empty snapshot");
        self.transport.emit_sync_state(SyncStatePayload::default());
    }

    async fn on_persona_sync(&self, payload: Value) {
        debug!(payload = %payload, "persona_sync received");
    }

    async fn on_auth_terminated(&self, reason: String) {
        error!(reason = %reason, "re-login required; the bridge stays up for local clients");
        self.push_status();
    }
}

/// Build the status snapshot local clients see.
fn build_status(
    config: &Config,
    supervisor: &ProviderSupervisor,
    state: ConnState,
    started: Instant,
) -> StatusPayload {
    let providers = config
        .providers
        .iter()
        .map(|p| ProviderStatus {
            name: p.name.clone(),
            enabled: p.enabled,
            running: supervisor.is_running(&p.name),
            tools: supervisor.tool_count(&p.name),
            error: supervisor.last_error(&p.name),
        })
        .collect();

    StatusPayload {
        version: env!("CARGO_PKG_VERSION").to_string(),
        connection: state.as_str().to_string(),
        cloud_url: config.cloud.ws_url.clone(),
        device_id: config.auth.device_id.clone(),
        auth_ok: config.auth.is_logged_in() && state != ConnState::Terminated,
        providers,
        uptime_secs: started.elapsed().as_secs(),
    }
}

/// Descriptors in the wire shape used by `register_tools`.
fn wire_servers(config: &Config) -> Vec<WireServer> {
    config
        .providers
        .iter()
        .map(|p| WireServer {
            name: p.name.clone(),
            description: p.description.clone(),
            command: p.command.clone(),
            args: p.args.clone(),
            kind: p.transport.clone(),
            enabled: p.enabled,
        })
        .collect()
}

/// Resolves when SIGTERM arrives (unix); pends forever elsewhere.
async fn wait_for_terminate_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::CredentialsConfig;

    #[tokio::test]
    async fn status_reflects_configured_providers() {
        let catalog = Arc::new(ToolCatalog::new());
        let (supervisor, _events) = ProviderSupervisor::new(catalog);
        let config = Config {
            providers: vec![ProviderConfig {
                name: "fs".into(),
                description: String::new(),
                command: "fs-provider".into(),
                args: vec![],
                transport: "stdio".into(),
                enabled: true,
            }],
            auth: CredentialsConfig {
                access_token: "a".into(),
                refresh_token: "r".into(),
                expires_at: 1,
                device_id: None,
            },
            ..Config::default()
        };

        let status = build_status(&config, &supervisor, ConnState::Reconnecting, Instant::now());
        assert_eq!(status.connection, "reconnecting");
        assert!(status.auth_ok);
        assert_eq!(status.providers.len(), 1);
        assert_eq!(status.providers[0].name, "fs");
        assert!(!status.providers[0].running);
    }

    #[tokio::test]
    async fn terminated_connection_clears_auth_ok() {
        let catalog = Arc::new(ToolCatalog::new());
        let (supervisor, _events) = ProviderSupervisor::new(catalog);
        let config = Config {
            auth: CredentialsConfig {
                access_token: "a".into(),
                refresh_token: "r".into(),
                expires_at: 1,
                device_id: None,
            },
            ..Config::default()
        };
        let status = build_status(&config, &supervisor, ConnState::Terminated, Instant::now());
        assert_eq!(status.connection, "auth_failed");
        assert!(!status.auth_ok);
    }

    #[test]
    fn wire_servers_mirror_descriptors() {
        let config = Config {
            providers: vec![ProviderConfig {
                name: "fs".into(),
                description: "files".into(),
                command: "fs-provider".into(),
                args: vec!["--root".into()],
                transport: "stdio".into(),
                enabled: false,
            }],
            ..Config::default()
        };
        let servers = wire_servers(&config);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].kind, "stdio");
        assert!(!servers[0].enabled);
    }
}
