//! Wiring: config → registry → adapter → sink → orchestrator → relay.

use std::sync::Arc;

use tracing::info;

use moood_shared::{AppConfig, OrchestratorOptions, RelayOptions, Result};
use moood_storage::Storage;
use moood_workers::{InvocationAdapter, WorkerRegistry};

use crate::orchestrator::{ExecutionObserver, Orchestrator, SilentObserver};
use crate::relay::EventRelay;
use crate::sink::StorageSink;

/// Every long-lived component of a running pipeline.
pub struct Pipeline {
    pub storage: Arc<Storage>,
    pub registry: WorkerRegistry,
    pub orchestrator: Arc<Orchestrator>,
    pub relay: EventRelay,
}

impl Pipeline {
    /// Build the pipeline described by `config` over an open store.
    pub fn build(config: &AppConfig, storage: Arc<Storage>) -> Result<Self> {
        Self::build_with_observer(config, storage, Arc::new(SilentObserver))
    }

    pub fn build_with_observer(
        config: &AppConfig,
        storage: Arc<Storage>,
        observer: Arc<dyn ExecutionObserver>,
    ) -> Result<Self> {
        // Fails on duplicate or invalid worker names before anything runs
        let registry = WorkerRegistry::from_configs(&config.workers)?;

        let orchestrator_options = OrchestratorOptions::from(config);
        let adapter =
            InvocationAdapter::from_configs(&config.workers, orchestrator_options.invocation_timeout)?;
        let sink = Arc::new(StorageSink::new(storage.clone()));

        let orchestrator = Arc::new(
            Orchestrator::new(&registry, Arc::new(adapter), sink, orchestrator_options)?
                .with_observer(observer),
        );
        let relay = EventRelay::new(
            storage.clone(),
            orchestrator.clone(),
            RelayOptions::from(config),
        );

        info!(
            workers = registry.len(),
            relay = %config.relay.name,
            "pipeline built"
        );

        Ok(Self {
            storage,
            registry,
            orchestrator,
            relay,
        })
    }
}
