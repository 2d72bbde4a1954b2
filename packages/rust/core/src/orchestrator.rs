//! Per-entry workflow: Start → FanOut → Merge → Persist.
//!
//! Each execution is independent. Branches run in parallel, one per worker
//! resolved when the orchestrator was built; the first failing branch fails
//! the execution and abandons the rest.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use moood_shared::{
    ChangeRecord, Entry, EntryId, EntryMetadata, MooodError, OrchestratorOptions, ProcessedEntry,
    Result, WorkerDescriptor,
};
use moood_workers::{InvocationAdapter, WorkerRegistry};

use crate::sink::PersistenceSink;

// ---------------------------------------------------------------------------
// Execution states and observation
// ---------------------------------------------------------------------------

/// Lifecycle of one execution. Merge happens inside FanOut's completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Start,
    FanOut,
    Persist,
    Succeeded,
    Failed,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::FanOut => "fan_out",
            Self::Persist => "persist",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback for watching executions (progress displays, tests).
pub trait ExecutionObserver: Send + Sync {
    /// Called on every state transition.
    fn state_changed(&self, entry_id: &EntryId, state: ExecutionState);
    /// Called when a fan-out branch finishes, successfully or not.
    fn branch_completed(&self, entry_id: &EntryId, worker: &str, succeeded: bool);
}

/// No-op observer for headless/test usage.
pub struct SilentObserver;

impl ExecutionObserver for SilentObserver {
    fn state_changed(&self, _entry_id: &EntryId, _state: ExecutionState) {}
    fn branch_completed(&self, _entry_id: &EntryId, _worker: &str, _succeeded: bool) {}
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs the fan-out / merge / persist workflow for change records.
pub struct Orchestrator {
    branches: Arc<[WorkerDescriptor]>,
    adapter: Arc<InvocationAdapter>,
    sink: Arc<dyn PersistenceSink>,
    options: OrchestratorOptions,
    observer: Arc<dyn ExecutionObserver>,
}

impl Orchestrator {
    /// Snapshot the registry into a fixed branch list. Later registrations do
    /// not reach this orchestrator.
    pub fn new(
        registry: &WorkerRegistry,
        adapter: Arc<InvocationAdapter>,
        sink: Arc<dyn PersistenceSink>,
        options: OrchestratorOptions,
    ) -> Result<Self> {
        if let Some(unbound) = registry.all().iter().find(|d| !adapter.has_backend(&d.name)) {
            return Err(MooodError::config(format!(
                "worker {} is registered but has no backend",
                unbound.name
            )));
        }

        Ok(Self {
            branches: registry.all().to_vec().into(),
            adapter,
            sink,
            options,
            observer: Arc::new(SilentObserver),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Workers this orchestrator fans out to, in registration order.
    pub fn branches(&self) -> &[WorkerDescriptor] {
        &self.branches
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    /// Process one change record end to end under the execution deadline.
    #[instrument(skip_all, fields(entry_id = %record.entry_id, sequence = record.sequence))]
    pub async fn execute(&self, record: &ChangeRecord) -> Result<ProcessedEntry> {
        let start = Instant::now();
        let entry = record.to_entry();
        self.transition(&entry.id, ExecutionState::Start);

        let timeout = self.options.execution_timeout;
        let result = match tokio::time::timeout(timeout, self.run(&entry)).await {
            Ok(result) => result,
            // Dropping `run` drops its JoinSet, which aborts every open branch
            Err(_) => Err(MooodError::ExecutionTimeout {
                entry_id: entry.id.to_string(),
                timeout,
            }),
        };

        match &result {
            Ok(processed) => {
                info!(
                    workers = processed.metadata.len(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "execution succeeded"
                );
                self.transition(&entry.id, ExecutionState::Succeeded);
            }
            Err(e) => {
                warn!(error = %e, elapsed_ms = start.elapsed().as_millis() as u64, "execution failed");
                self.transition(&entry.id, ExecutionState::Failed);
            }
        }
        result
    }

    async fn run(&self, entry: &Entry) -> Result<ProcessedEntry> {
        self.transition(&entry.id, ExecutionState::FanOut);
        let metadata = self.fan_out(entry).await?;

        self.transition(&entry.id, ExecutionState::Persist);
        let processed = ProcessedEntry {
            entry: entry.clone(),
            metadata,
        };
        self.sink.persist(&processed).await?;
        Ok(processed)
    }

    /// One task per branch; merge fragments as they arrive. Keys are disjoint,
    /// so arrival order cannot change the result.
    async fn fan_out(&self, entry: &Entry) -> Result<EntryMetadata> {
        let mut branches = JoinSet::new();
        for descriptor in self.branches.iter().cloned() {
            let adapter = Arc::clone(&self.adapter);
            let input = entry.clone();
            branches.spawn(async move { adapter.invoke(&descriptor, &input).await });
        }

        let mut metadata = EntryMetadata::new();
        while let Some(joined) = branches.join_next().await {
            let result = joined.map_err(|e| {
                MooodError::invocation("fan-out", format!("branch task failed: {e}"))
            })?;

            let succeeded = result.is_success();
            debug!(worker = %result.worker_name, succeeded, "branch completed");
            self.observer
                .branch_completed(&entry.id, &result.worker_name, succeeded);

            // Fail-fast: returning here drops `branches` and aborts the rest
            let (name, payload) = result.into_fragment()?;
            metadata.insert(name, payload);
        }
        Ok(metadata)
    }

    fn transition(&self, entry_id: &EntryId, state: ExecutionState) {
        debug!(%entry_id, %state, "state transition");
        self.observer.state_changed(entry_id, state);
    }
}
