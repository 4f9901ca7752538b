//! Provider supervision
//!
//! Spawns and monitors tool-provider subprocesses, performs the enumeration
//! handshake, serializes invocations per provider, and keeps the catalogue
//! in sync as providers come and go.

mod child;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

use crate::catalog::ToolCatalog;
use crate::config::ProviderConfig;
use crate::protocol::{EnumerateResponse, InvokeResponse, ProviderRequest, ToolDef};
use crate::{Error, Result};

use child::ChildHandle;

/// Handshake deadline: a provider that stays silent this long is killed.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Default invocation deadline when the cloud did not set one.
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Supervisor notifications consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// A child exited on its own; its tools were retracted.
    Exited {
        /// Provider name
        name: String,
    },
}

/// Provider supervisor (C2)
pub struct ProviderSupervisor {
    catalog: Arc<ToolCatalog>,
    children: Arc<DashMap<String, ChildHandle>>,
    tools: Arc<DashMap<String, Vec<ToolDef>>>,
    last_errors: Arc<DashMap<String, String>>,
    exit_tx: mpsc::UnboundedSender<String>,
    // start/stop are serialized so "at most one instance per name" holds
    // under concurrent supervisory commands.
    ops: Mutex<()>,
    handshake_timeout: Duration,
}

impl ProviderSupervisor {
    /// Create a supervisor. The returned receiver yields one event per
    /// unexpected child exit.
    #[must_use]
    pub fn new(catalog: Arc<ToolCatalog>) -> (Arc<Self>, mpsc::UnboundedReceiver<ProviderEvent>) {
        Self::with_handshake_timeout(catalog, HANDSHAKE_TIMEOUT)
    }

    /// Same as [`ProviderSupervisor::new`] with an explicit handshake
    /// deadline (tests shorten it).
    #[must_use]
    pub fn with_handshake_timeout(
        catalog: Arc<ToolCatalog>,
        handshake_timeout: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ProviderEvent>) {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<String>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let supervisor = Arc::new(Self {
            catalog: Arc::clone(&catalog),
            children: Arc::new(DashMap::new()),
            tools: Arc::new(DashMap::new()),
            last_errors: Arc::new(DashMap::new()),
            exit_tx,
            ops: Mutex::new(()),
            handshake_timeout,
        });

        // Reaper: remove the instance of a child that died on its own and
        // retract its tools. A name already removed by stop() is ignored.
        let children = Arc::clone(&supervisor.children);
        let tools = Arc::clone(&supervisor.tools);
        let last_errors = Arc::clone(&supervisor.last_errors);
        tokio::spawn(async move {
            while let Some(name) = exit_rx.recv().await {
                if children.remove(&name).is_some() {
                    warn!(provider = %name, "provider exited unexpectedly");
                    tools.remove(&name);
                    last_errors.insert(name.clone(), "provider exited unexpectedly".to_string());
                    catalog.retract_provider(&name);
                    let _ = events_tx.send(ProviderEvent::Exited { name });
                }
            }
        });

        (supervisor, events_rx)
    }

    /// Launch a provider, run the enumeration handshake, and publish its
    /// tools.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning`, `BadSpec`, `Spawn`, `Handshake`, or `Timeout`.
    pub async fn start(&self, config: &ProviderConfig) -> Result<Vec<ToolDef>> {
        let _ops = self.ops.lock().await;

        if config.transport != "stdio" {
            return Err(Error::BadSpec(format!(
                "{}: unsupported transport {}",
                config.name, config.transport
            )));
        }
        if self.children.contains_key(&config.name) {
            return Err(Error::AlreadyRunning(config.name.clone()));
        }

        info!(provider = %config.name, command = %config.command, "starting provider");
        let child = match ChildHandle::spawn(config, self.exit_tx.clone()) {
            Ok(child) => child,
            Err(e) => {
                self.last_errors.insert(config.name.clone(), e.to_string());
                return Err(e);
            }
        };

        let tools = match self.handshake(&config.name, &child).await {
            Ok(tools) => tools,
            Err(e) => {
                child.stop().await;
                self.last_errors.insert(config.name.clone(), e.to_string());
                return Err(e);
            }
        };

        info!(provider = %config.name, tools = tools.len(), "provider handshake complete");
        self.children.insert(config.name.clone(), child);
        self.tools.insert(config.name.clone(), tools.clone());
        self.last_errors.remove(&config.name);
        self.catalog.publish_provider(&config.name, tools.clone());
        Ok(tools)
    }

    async fn handshake(&self, name: &str, child: &ChildHandle) -> Result<Vec<ToolDef>> {
        let line = child
            .request(&ProviderRequest::ListTools {}, self.handshake_timeout)
            .await
            .map_err(|e| match e {
                Error::Timeout(_) => Error::Handshake(format!("{name}: silent for handshake window")),
                other => Error::Handshake(other.to_string()),
            })?;

        let response: EnumerateResponse = serde_json::from_str(&line)
            .map_err(|e| Error::Handshake(format!("{name}: bad enumeration response: {e}")))?;
        Ok(response.tools)
    }

    /// Terminate a provider and retract its tools.
    ///
    /// # Errors
    ///
    /// `NotRunning` when no instance exists.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let _ops = self.ops.lock().await;
        let Some((_, child)) = self.children.remove(name) else {
            return Err(Error::NotRunning(name.to_string()));
        };
        info!(provider = %name, "stopping provider");
        self.tools.remove(name);
        self.catalog.retract_provider(name);
        child.stop().await;
        Ok(())
    }

    /// Invoke one tool. Requests are serialized per provider; the wait is
    /// bounded by `deadline`.
    ///
    /// # Errors
    ///
    /// `ProviderUnavailable` when no live instance exists or the child dies
    /// mid-call, `Timeout` past the deadline, `Tool` when the provider
    /// answers with an error.
    pub async fn invoke(
        &self,
        name: &str,
        tool: &str,
        arguments: Value,
        deadline: Duration,
    ) -> Result<String> {
        let child = self
            .children
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::ProviderUnavailable(name.to_string()))?;

        let request = ProviderRequest::CallTool {
            name: tool.to_string(),
            arguments,
        };
        let line = child.request(&request, deadline).await?;

        let response: InvokeResponse = serde_json::from_str(&line)
            .map_err(|e| Error::Protocol(format!("{name}: bad invoke response: {e}")))?;
        if let Some(error) = response.error {
            return Err(Error::Tool(error));
        }
        Ok(response.result.unwrap_or_default())
    }

    /// Tools captured from a provider's handshake.
    #[must_use]
    pub fn list_tools(&self, name: &str) -> Vec<ToolDef> {
        self.tools.get(name).map(|t| t.clone()).unwrap_or_default()
    }

    /// The provider owning `tool`, if any running provider claims it.
    #[must_use]
    pub fn provider_of(&self, tool: &str) -> Option<String> {
        self.tools
            .iter()
            .find(|entry| entry.value().iter().any(|t| t.name == tool))
            .map(|entry| entry.key().clone())
    }

    /// All captured tools across running providers.
    #[must_use]
    pub fn all_tools(&self) -> Vec<(String, ToolDef)> {
        self.tools
            .iter()
            .flat_map(|entry| {
                let name = entry.key().clone();
                entry
                    .value()
                    .iter()
                    .cloned()
                    .map(move |t| (name.clone(), t))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Names of providers with a live instance.
    #[must_use]
    pub fn running_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.children.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Whether a live instance exists.
    #[must_use]
    pub fn is_running(&self, name: &str) -> bool {
        self.children
            .get(name)
            .is_some_and(|child| child.is_alive())
    }

    /// Number of tools a running provider contributed.
    #[must_use]
    pub fn tool_count(&self, name: &str) -> usize {
        self.tools.get(name).map_or(0, |t| t.len())
    }

    /// Last start/handshake error for a provider, empty when healthy.
    #[must_use]
    pub fn last_error(&self, name: &str) -> String {
        self.last_errors
            .get(name)
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    /// Stop every running provider.
    pub async fn stop_all(&self) {
        let _ops = self.ops.lock().await;
        let names: Vec<String> = self.children.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, child)) = self.children.remove(&name) {
                self.tools.remove(&name);
                self.catalog.retract_provider(&name);
                child.stop().await;
            }
        }
    }
}
