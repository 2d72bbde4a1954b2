//! Ordered, name-unique set of worker descriptors.

use std::sync::LazyLock;

use moood_shared::{MooodError, Result, WorkerConfig, WorkerDescriptor};
use regex::Regex;

/// Registered workers, in registration order.
///
/// The registry is built once at startup and only read afterwards; the
/// orchestrator takes a snapshot of it when it is constructed.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistry {
    workers: Vec<WorkerDescriptor>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a worker. Fails if the name is not a lowercase identifier or is
    /// already registered.
    pub fn register(mut self, descriptor: WorkerDescriptor) -> Result<Self> {
        validate_worker_name(&descriptor.name)?;
        if self.get(&descriptor.name).is_some() {
            return Err(MooodError::DuplicateWorkerName {
                name: descriptor.name,
            });
        }
        tracing::debug!(worker = %descriptor.name, "registered worker");
        self.workers.push(descriptor);
        Ok(self)
    }

    /// Build a registry from `[[workers]]` config entries.
    pub fn from_configs(configs: &[WorkerConfig]) -> Result<Self> {
        configs
            .iter()
            .try_fold(Self::new(), |registry, config| registry.register(config.descriptor()))
    }

    /// All descriptors, in registration order.
    pub fn all(&self) -> &[WorkerDescriptor] {
        &self.workers
    }

    pub fn get(&self, name: &str) -> Option<&WorkerDescriptor> {
        self.workers.iter().find(|w| w.name == name)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Worker names double as metadata keys, so they must be stable identifiers.
pub fn validate_worker_name(name: &str) -> Result<()> {
    static NAME_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("valid regex"));

    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(MooodError::validation(format!(
            "invalid worker name {name:?}: expected a lowercase identifier"
        )))
    }
}
