//! Invocation dispatch (C5)
//!
//! Routes inbound `tool_call` frames to the core tool set or the owning
//! provider, emits exactly one `tool_result` per call id per connection
//! epoch, and records every completion in a bounded activity ring that is
//! broadcast to local clients.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::catalog::{ToolCatalog, ToolOrigin};
use crate::cloud::CloudTransport;
use crate::protocol::{ActivityRecord, ToolCallPayload, ToolResultPayload};
use crate::provider::{DEFAULT_INVOKE_TIMEOUT, ProviderSupervisor};
use crate::tools;
use crate::{Error, Result};

/// Default size of the activity ring.
pub const ACTIVITY_RING_CAPACITY: usize = 100;

/// Retired call ids kept beyond the ring, for duplicate detection.
const RETIRED_CAPACITY: usize = 1024;

/// Where result frames go. The cloud transport in production; tests swap in
/// a recorder.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Enqueue one result frame for `epoch`.
    async fn emit_result(&self, payload: ToolResultPayload, epoch: u64) -> Result<()>;
}

#[async_trait]
impl ResultSink for CloudTransport {
    async fn emit_result(&self, payload: ToolResultPayload, epoch: u64) -> Result<()> {
        CloudTransport::emit_result(self, payload, epoch).await
    }
}

struct CompletedCall {
    record: ActivityRecord,
    result: ToolResultPayload,
}

#[derive(Default)]
struct Ledger {
    ring: VecDeque<CompletedCall>,
    retired: HashSet<String>,
    retired_order: VecDeque<String>,
}

impl Ledger {
    fn retire(&mut self, call_id: &str, ring_capacity: usize, completed: Option<CompletedCall>) {
        if self.retired.insert(call_id.to_string()) {
            self.retired_order.push_back(call_id.to_string());
            if self.retired_order.len() > RETIRED_CAPACITY {
                if let Some(evicted) = self.retired_order.pop_front() {
                    self.retired.remove(&evicted);
                }
            }
        }
        if let Some(completed) = completed {
            self.ring.push_back(completed);
            if self.ring.len() > ring_capacity {
                self.ring.pop_front();
            }
        }
    }

    fn cached(&self, call_id: &str) -> Option<ToolResultPayload> {
        self.ring
            .iter()
            .find(|c| c.record.call_id == call_id)
            .map(|c| c.result.clone())
    }
}

/// Dispatcher (C5)
pub struct Dispatcher {
    catalog: Arc<ToolCatalog>,
    supervisor: Arc<ProviderSupervisor>,
    sink: Arc<dyn ResultSink>,
    ledger: parking_lot::Mutex<Ledger>,
    ring_capacity: usize,
    activity_tx: broadcast::Sender<ActivityRecord>,
}

impl Dispatcher {
    /// Create a dispatcher with the default ring size.
    #[must_use]
    pub fn new(
        catalog: Arc<ToolCatalog>,
        supervisor: Arc<ProviderSupervisor>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self::with_ring_capacity(catalog, supervisor, sink, ACTIVITY_RING_CAPACITY)
    }

    /// Create a dispatcher with an explicit ring size (tests shrink it).
    #[must_use]
    pub fn with_ring_capacity(
        catalog: Arc<ToolCatalog>,
        supervisor: Arc<ProviderSupervisor>,
        sink: Arc<dyn ResultSink>,
        ring_capacity: usize,
    ) -> Self {
        let (activity_tx, _) = broadcast::channel(64);
        Self {
            catalog,
            supervisor,
            sink,
            ledger: parking_lot::Mutex::new(Ledger::default()),
            ring_capacity,
            activity_tx,
        }
    }

    /// Observe activity records as they complete.
    #[must_use]
    pub fn subscribe_activity(&self) -> broadcast::Receiver<ActivityRecord> {
        self.activity_tx.subscribe()
    }

    /// Most recent activity, oldest first.
    #[must_use]
    pub fn recent_activity(&self) -> Vec<ActivityRecord> {
        self.ledger
            .lock()
            .ring
            .iter()
            .map(|c| c.record.clone())
            .collect()
    }

    /// Handle one inbound invocation frame.
    ///
    /// Malformed frames are ignored; the cloud will time out and retry.
    /// Every well-formed call id gets exactly one result frame on its epoch.
    pub async fn handle_tool_call(&self, call: ToolCallPayload, epoch: u64) {
        if call.call_id.is_empty() || call.tool_name.is_empty() {
            warn!("malformed tool_call (empty id or name), ignoring");
            return;
        }

        // Duplicate delivery, e.g. a reconnect race: answer from cache when
        // the ring still has it, otherwise refuse idempotently.
        let cached = {
            let ledger = self.ledger.lock();
            if ledger.retired.contains(&call.call_id) {
                Some(ledger.cached(&call.call_id))
            } else {
                None
            }
        };
        if let Some(cached) = cached {
            let payload = cached.unwrap_or_else(|| {
                ToolResultPayload::fail(call.call_id.clone(), "duplicate-retired")
            });
            debug!(call_id = %call.call_id, "duplicate tool_call answered from ledger");
            let _ = self.sink.emit_result(payload, epoch).await;
            return;
        }

        let started = std::time::Instant::now();
        let deadline = call
            .timeout
            .map_or(DEFAULT_INVOKE_TIMEOUT, Duration::from_secs);

        let (origin, outcome) = match self.catalog.resolve(&call.tool_name) {
            None => (
                "unknown".to_string(),
                Err(Error::ToolNotFound(call.tool_name.clone())),
            ),
            Some((ToolOrigin::Core, _)) => (
                "core".to_string(),
                tools::invoke_core(&call.tool_name, &call.arguments, &self.supervisor).await,
            ),
            Some((ToolOrigin::Provider(provider), _)) => {
                let outcome = self
                    .supervisor
                    .invoke(&provider, &call.tool_name, call.arguments.clone(), deadline)
                    .await;
                (provider, outcome)
            }
        };

        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let payload = match &outcome {
            Ok(result) => ToolResultPayload::ok(call.call_id.clone(), result.clone()),
            Err(e) => ToolResultPayload::fail(call.call_id.clone(), result_error(e)),
        };

        let record = ActivityRecord {
            call_id: call.call_id.clone(),
            tool: call.tool_name.clone(),
            origin,
            args_summary: elide_arguments(&call.arguments),
            success: payload.success,
            error: payload.error.clone(),
            latency_ms,
            timestamp: Utc::now(),
        };

        // Retire the id only once its result is enqueued; an enqueue that
        // tore the connection down leaves the id live for the cloud's retry.
        match self.sink.emit_result(payload.clone(), epoch).await {
            Ok(()) => {
                info!(
                    call_id = %call.call_id,
                    tool = %call.tool_name,
                    success = payload.success,
                    latency_ms,
                    "tool_call dispatched"
                );
                self.ledger.lock().retire(
                    &call.call_id,
                    self.ring_capacity,
                    Some(CompletedCall {
                        record: record.clone(),
                        result: payload,
                    }),
                );
                let _ = self.activity_tx.send(record);
            }
            Err(e) => {
                warn!(call_id = %call.call_id, error = %e, "result emission failed");
            }
        }
    }
}

/// Error string the cloud sees in a failed `tool_result`.
fn result_error(e: &Error) -> String {
    match e {
        Error::ProviderUnavailable(_) => "provider-unavailable".to_string(),
        Error::ToolNotFound(_) => "tool not found".to_string(),
        other => other.to_string(),
    }
}

/// Bounded argument summary for the activity log; arguments can be large
/// and may carry user content, so only a prefix is kept.
fn elide_arguments(arguments: &serde_json::Value) -> String {
    const LIMIT: usize = 120;
    let raw = arguments.to_string();
    if raw.chars().count() <= LIMIT {
        return raw;
    }
    let prefix: String = raw.chars().take(LIMIT).collect();
    format!("{prefix}…")
}
