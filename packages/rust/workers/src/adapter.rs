//! Uniform request/response call to any worker, with a per-call timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use moood_shared::{Entry, Result, WorkerConfig, WorkerDescriptor, WorkerFailure, WorkerResult};
use tracing::{debug, instrument, warn};

use crate::backends::{WorkerBackend, backend_for};

/// Routes invocations to the backend bound to each worker name.
///
/// One call per invocation; retries are the relay's job, via redelivery.
#[derive(Clone)]
pub struct InvocationAdapter {
    timeout: Duration,
    backends: HashMap<String, Arc<dyn WorkerBackend>>,
}

impl InvocationAdapter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            backends: HashMap::new(),
        }
    }

    /// Bind `name` to a backend, replacing any previous binding.
    pub fn bind(mut self, name: impl Into<String>, backend: Arc<dyn WorkerBackend>) -> Self {
        self.backends.insert(name.into(), backend);
        self
    }

    /// Bind every configured worker to the backend its target describes.
    pub fn from_configs(configs: &[WorkerConfig], timeout: Duration) -> Result<Self> {
        configs.iter().try_fold(Self::new(timeout), |adapter, config| {
            Ok(adapter.bind(&config.name, backend_for(&config.target)?))
        })
    }

    pub fn has_backend(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Invoke one worker on one entry. Never fails as a call; the outcome is
    /// carried in the returned [`WorkerResult`].
    #[instrument(skip_all, fields(worker = %descriptor.name, entry_id = %entry.id))]
    pub async fn invoke(&self, descriptor: &WorkerDescriptor, entry: &Entry) -> WorkerResult {
        let Some(backend) = self.backends.get(&descriptor.name) else {
            return WorkerResult::failure(
                &descriptor.name,
                WorkerFailure::InvocationFailed {
                    reason: "no backend bound for worker".into(),
                },
            );
        };

        let started = Instant::now();
        match tokio::time::timeout(self.timeout, backend.call(descriptor, entry)).await {
            Ok(Ok(payload)) => {
                debug!(
                    backend = backend.kind(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "worker succeeded"
                );
                WorkerResult::success(&descriptor.name, payload)
            }
            Ok(Err(e)) => {
                warn!(backend = backend.kind(), error = %e, "worker failed");
                WorkerResult::failure(
                    &descriptor.name,
                    WorkerFailure::InvocationFailed {
                        reason: failure_reason(e),
                    },
                )
            }
            Err(_) => {
                warn!(
                    backend = backend.kind(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "worker timed out"
                );
                WorkerResult::failure(
                    &descriptor.name,
                    WorkerFailure::Timeout {
                        after: self.timeout,
                    },
                )
            }
        }
    }
}

/// Strip the worker prefix backends already put into their errors.
fn failure_reason(err: moood_shared::MooodError) -> String {
    match err {
        moood_shared::MooodError::WorkerInvocationFailed { reason, .. } => reason,
        other => other.to_string(),
    }
}
