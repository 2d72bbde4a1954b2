//! Event relay: moves change records from the feed into the orchestrator.
//!
//! Batches are acknowledged (checkpoint advanced) only after every item in
//! them succeeded. A failed batch is left in place and read again on the next
//! poll, which is the pipeline's only retry mechanism.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use moood_shared::{BatchMode, ChangeRecord, MooodError, RelayOptions, Result, StartingPosition};
use moood_storage::Storage;

use crate::orchestrator::Orchestrator;

/// Result of one poll.
#[derive(Debug)]
pub enum BatchOutcome {
    /// Nothing new on the feed.
    Idle,
    /// Every item succeeded and the checkpoint moved to `through`.
    Acknowledged { through: i64, processed: usize },
    /// The batch starting at `first_sequence` will be redelivered.
    Failed {
        first_sequence: i64,
        error: MooodError,
    },
}

/// Counters accumulated by [`EventRelay::drain`] and [`EventRelay::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub batches: usize,
    pub processed: usize,
    pub failed_batches: usize,
}

/// Reads the change feed and drives the orchestrator, one batch at a time.
pub struct EventRelay {
    storage: Arc<Storage>,
    orchestrator: Arc<Orchestrator>,
    options: RelayOptions,
}

impl EventRelay {
    pub fn new(storage: Arc<Storage>, orchestrator: Arc<Orchestrator>, options: RelayOptions) -> Self {
        Self {
            storage,
            orchestrator,
            options,
        }
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    /// Establish the read position: the stored checkpoint, or the configured
    /// starting position on first activation. `Latest` pins the current head
    /// as the checkpoint here, so records ingested after activation are never
    /// skipped. Idempotent.
    pub async fn activate(&self) -> Result<Option<i64>> {
        let name = &self.options.name;
        if let Some(checkpoint) = self.storage.get_checkpoint(name).await? {
            return Ok(Some(checkpoint));
        }

        match self.options.starting_position {
            StartingPosition::TrimHorizon => {
                debug!(relay = %name, "no checkpoint, reading from trim horizon");
                Ok(None)
            }
            StartingPosition::Latest => {
                let head = self.storage.latest_sequence().await?.unwrap_or(0);
                self.storage.set_checkpoint(name, head).await?;
                info!(relay = %name, head, "first activation, starting at latest");
                Ok(Some(head))
            }
        }
    }

    /// Records waiting behind the read position. Activates the relay.
    pub async fn pending(&self) -> Result<u64> {
        let after = self.activate().await?;
        self.storage.pending_changes(after).await
    }

    /// Read one batch, run it, and acknowledge it if every item succeeded.
    #[instrument(skip_all, fields(relay = %self.options.name))]
    pub async fn poll_once(&self) -> Result<BatchOutcome> {
        let after = self.activate().await?;
        let batch = self
            .storage
            .read_changes(after, self.options.batch_size)
            .await?;

        let (Some(first), Some(last)) = (batch.first(), batch.last()) else {
            return Ok(BatchOutcome::Idle);
        };
        let (first_sequence, through) = (first.sequence, last.sequence);
        debug!(first_sequence, through, size = batch.len(), "delivering batch");

        let failure = match self.options.batch_mode {
            BatchMode::Serial => self.run_serial(&batch).await,
            BatchMode::Concurrent => self.run_concurrent(&batch).await,
        };

        if let Some(error) = failure {
            warn!(first_sequence, error = %error, "batch not acknowledged, will be redelivered");
            return Ok(BatchOutcome::Failed {
                first_sequence,
                error,
            });
        }

        self.storage
            .set_checkpoint(&self.options.name, through)
            .await?;
        info!(through, processed = batch.len(), "batch acknowledged");
        Ok(BatchOutcome::Acknowledged {
            through,
            processed: batch.len(),
        })
    }

    /// Feed order; stops at the first failure.
    async fn run_serial(&self, batch: &[ChangeRecord]) -> Option<MooodError> {
        for record in batch {
            if let Err(e) = self.orchestrator.execute(record).await {
                return Some(e);
            }
        }
        None
    }

    /// All items at once; the first error in feed order is reported.
    async fn run_concurrent(&self, batch: &[ChangeRecord]) -> Option<MooodError> {
        join_all(batch.iter().map(|record| self.orchestrator.execute(record)))
            .await
            .into_iter()
            .find_map(|result| result.err())
    }

    /// Poll until the feed is idle or a batch fails.
    pub async fn drain(&self) -> Result<RelayStats> {
        self.activate().await?;
        let mut stats = RelayStats::default();
        loop {
            match self.poll_once().await? {
                BatchOutcome::Idle => break,
                BatchOutcome::Acknowledged { processed, .. } => {
                    stats.batches += 1;
                    stats.processed += processed;
                }
                BatchOutcome::Failed { .. } => {
                    stats.batches += 1;
                    stats.failed_batches += 1;
                    break;
                }
            }
        }
        Ok(stats)
    }

    /// Poll continuously until `shutdown` resolves. Idle feeds and failed
    /// batches wait `poll_interval` before the next poll.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> RelayStats {
        tokio::pin!(shutdown);
        let mut stats = RelayStats::default();
        info!(
            relay = %self.options.name,
            batch_size = self.options.batch_size,
            "relay started"
        );
        if let Err(e) = self.activate().await {
            warn!(error = %e, "relay activation failed, retrying on first poll");
        }

        loop {
            let outcome = tokio::select! {
                _ = &mut shutdown => break,
                outcome = self.poll_once() => outcome,
            };

            let back_off = match outcome {
                Ok(BatchOutcome::Acknowledged { processed, .. }) => {
                    stats.batches += 1;
                    stats.processed += processed;
                    false
                }
                Ok(BatchOutcome::Idle) => true,
                Ok(BatchOutcome::Failed { .. }) => {
                    stats.batches += 1;
                    stats.failed_batches += 1;
                    true
                }
                Err(e) => {
                    warn!(error = %e, "relay poll failed");
                    true
                }
            };

            if back_off {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                }
            }
        }

        info!(relay = %self.options.name, ?stats, "relay stopped");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use moood_shared::{Entry, OrchestratorOptions, WorkerDescriptor};
    use moood_workers::{InvocationAdapter, WorkerBackend, WorkerRegistry};
    use serde_json::{Value, json};
    use uuid::Uuid;

    use crate::sink::StorageSink;

    struct Fixed(Value, Duration);

    #[async_trait]
    impl WorkerBackend for Fixed {
        async fn call(&self, _: &WorkerDescriptor, _: &Entry) -> moood_shared::Result<Value> {
            tokio::time::sleep(self.1).await;
            Ok(self.0.clone())
        }
        fn kind(&self) -> &str {
            "fixed"
        }
    }

    /// Fails the first `failures` calls, then answers.
    struct Flaky {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl WorkerBackend for Flaky {
        async fn call(&self, d: &WorkerDescriptor, _: &Entry) -> moood_shared::Result<Value> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(MooodError::invocation(&d.name, "transient failure"));
            }
            Ok(json!({"gradeLevel": 5}))
        }
        fn kind(&self) -> &str {
            "flaky"
        }
    }

    async fn test_storage() -> Arc<Storage> {
        let tmp = std::env::temp_dir().join(format!("moood_relay_{}.db", Uuid::now_v7()));
        Arc::new(Storage::open(&tmp).await.expect("open test db"))
    }

    fn relay_with(
        storage: &Arc<Storage>,
        workers: Vec<(&str, Arc<dyn WorkerBackend>)>,
        invocation_timeout: Duration,
        options: RelayOptions,
    ) -> EventRelay {
        let mut registry = WorkerRegistry::new();
        let mut adapter = InvocationAdapter::new(invocation_timeout);
        for (name, backend) in workers {
            registry = registry.register(WorkerDescriptor::new(name)).unwrap();
            adapter = adapter.bind(name, backend);
        }
        let orchestrator = Orchestrator::new(
            &registry,
            Arc::new(adapter),
            Arc::new(StorageSink::new(storage.clone())),
            OrchestratorOptions {
                execution_timeout: Duration::from_secs(5),
                invocation_timeout,
            },
        )
        .unwrap();
        EventRelay::new(storage.clone(), Arc::new(orchestrator), options)
    }

    fn sentiment(delay: Duration) -> (&'static str, Arc<dyn WorkerBackend>) {
        ("sentiment", Arc::new(Fixed(json!({"score": 0.8}), delay)))
    }

    fn relay_options() -> RelayOptions {
        RelayOptions {
            poll_interval: Duration::from_millis(10),
            ..RelayOptions::default()
        }
    }

    async fn ingest(storage: &Storage, text: &str) -> Entry {
        let entry = Entry::new(text);
        storage.insert_entry(&entry).await.unwrap();
        entry
    }

    #[tokio::test]
    async fn idle_feed() {
        let storage = test_storage().await;
        let relay = relay_with(&storage, vec![], Duration::from_secs(1), relay_options());
        assert!(matches!(relay.poll_once().await.unwrap(), BatchOutcome::Idle));
        assert_eq!(relay.drain().await.unwrap(), RelayStats::default());
    }

    #[tokio::test]
    async fn acknowledges_and_advances_checkpoint() {
        let storage = test_storage().await;
        let entry = ingest(&storage, "I feel great today").await;
        let relay = relay_with(
            &storage,
            vec![sentiment(Duration::ZERO)],
            Duration::from_secs(1),
            relay_options(),
        );

        let through = match relay.poll_once().await.unwrap() {
            BatchOutcome::Acknowledged { through, processed } => {
                assert_eq!(processed, 1);
                through
            }
            other => panic!("expected ack, got {other:?}"),
        };
        assert_eq!(storage.get_checkpoint("entry-pipe").await.unwrap(), Some(through));

        let stored = storage.get_processed(&entry.id).await.unwrap().expect("persisted");
        assert_eq!(stored.processed.metadata.get("sentiment"), Some(&json!({"score": 0.8})));
        assert!(matches!(relay.poll_once().await.unwrap(), BatchOutcome::Idle));
    }

    #[tokio::test]
    async fn scenario_b_timeout_leaves_record_for_redelivery() {
        let storage = test_storage().await;
        let entry = ingest(&storage, "I feel great today").await;
        let relay = relay_with(
            &storage,
            vec![sentiment(Duration::from_secs(5))],
            Duration::from_millis(30),
            relay_options(),
        );

        match relay.poll_once().await.unwrap() {
            BatchOutcome::Failed { error, .. } => {
                assert!(matches!(error, MooodError::WorkerTimeout { .. }))
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(storage.get_checkpoint("entry-pipe").await.unwrap(), None);
        assert!(storage.get_processed(&entry.id).await.unwrap().is_none());

        let redelivered = storage.read_changes(None, 1).await.unwrap();
        assert_eq!(redelivered[0].entry_id, entry.id);
        assert_eq!(relay.pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_batch_is_redelivered_until_it_succeeds() {
        let storage = test_storage().await;
        let entry = ingest(&storage, "I feel great today").await;
        let flaky: Arc<dyn WorkerBackend> = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            failures: 2,
        });
        let relay = relay_with(
            &storage,
            vec![sentiment(Duration::ZERO), ("complexity", flaky)],
            Duration::from_secs(1),
            relay_options(),
        );

        assert!(matches!(relay.poll_once().await.unwrap(), BatchOutcome::Failed { .. }));
        assert!(matches!(relay.poll_once().await.unwrap(), BatchOutcome::Failed { .. }));
        assert!(matches!(
            relay.poll_once().await.unwrap(),
            BatchOutcome::Acknowledged { processed: 1, .. }
        ));

        let stored = storage.get_processed(&entry.id).await.unwrap().unwrap();
        assert_eq!(stored.deliveries, 1);
        assert_eq!(stored.processed.metadata.len(), 2);
    }

    #[tokio::test]
    async fn serial_batch_stops_at_first_failure() {
        let storage = test_storage().await;
        for text in ["one", "two", "three"] {
            ingest(&storage, text).await;
        }
        let flaky: Arc<dyn WorkerBackend> = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            failures: 1,
        });
        let relay = relay_with(
            &storage,
            vec![("complexity", flaky)],
            Duration::from_secs(1),
            RelayOptions {
                batch_size: 3,
                ..relay_options()
            },
        );

        assert!(matches!(relay.poll_once().await.unwrap(), BatchOutcome::Failed { .. }));
        assert_eq!(storage.get_checkpoint("entry-pipe").await.unwrap(), None);

        let stats = relay.drain().await.unwrap();
        assert_eq!(stats.processed, 3);
        assert_eq!(relay.pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn concurrent_batch_processes_every_item() {
        let storage = test_storage().await;
        let mut ids = Vec::new();
        for text in ["one", "two", "three", "four"] {
            ids.push(ingest(&storage, text).await.id);
        }
        let relay = relay_with(
            &storage,
            vec![sentiment(Duration::from_millis(10))],
            Duration::from_secs(1),
            RelayOptions {
                batch_size: 4,
                batch_mode: BatchMode::Concurrent,
                ..relay_options()
            },
        );

        let stats = relay.drain().await.unwrap();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.processed, 4);
        for id in &ids {
            assert!(storage.get_processed(id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn concurrent_batch_failure_is_not_acknowledged() {
        let storage = test_storage().await;
        let mut ids = Vec::new();
        for text in ["one", "two", "three"] {
            ids.push(ingest(&storage, text).await.id);
        }
        let flaky: Arc<dyn WorkerBackend> = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            failures: 1,
        });
        let relay = relay_with(
            &storage,
            vec![("complexity", flaky)],
            Duration::from_secs(1),
            RelayOptions {
                batch_size: 3,
                batch_mode: BatchMode::Concurrent,
                ..relay_options()
            },
        );

        match relay.poll_once().await.unwrap() {
            BatchOutcome::Failed { first_sequence, error } => {
                assert_eq!(first_sequence, 1);
                assert!(matches!(error, MooodError::WorkerInvocationFailed { .. }));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(storage.get_checkpoint("entry-pipe").await.unwrap(), None);
        assert_eq!(relay.pending().await.unwrap(), 3);

        let stats = relay.drain().await.unwrap();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.failed_batches, 0);
        assert_eq!(storage.get_checkpoint("entry-pipe").await.unwrap(), Some(3));
        for id in &ids {
            assert!(storage.get_processed(id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn latest_pins_head_at_activation() {
        let storage = test_storage().await;
        ingest(&storage, "before activation").await;
        let relay = relay_with(
            &storage,
            vec![sentiment(Duration::ZERO)],
            Duration::from_secs(1),
            RelayOptions {
                starting_position: StartingPosition::Latest,
                ..relay_options()
            },
        );

        assert_eq!(relay.activate().await.unwrap(), Some(1));
        assert_eq!(storage.get_checkpoint("entry-pipe").await.unwrap(), Some(1));

        // Ingested between activation and the first poll
        let early = ingest(&storage, "right after activation").await;
        assert_eq!(relay.activate().await.unwrap(), Some(1));

        let stats = relay.drain().await.unwrap();
        assert_eq!(stats.processed, 1);
        assert!(storage.get_processed(&early.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn latest_skips_existing_records() {
        let storage = test_storage().await;
        let old = ingest(&storage, "before activation").await;
        let relay = relay_with(
            &storage,
            vec![sentiment(Duration::ZERO)],
            Duration::from_secs(1),
            RelayOptions {
                starting_position: StartingPosition::Latest,
                ..relay_options()
            },
        );

        assert_eq!(relay.pending().await.unwrap(), 0);
        assert!(matches!(relay.poll_once().await.unwrap(), BatchOutcome::Idle));

        let new = ingest(&storage, "after activation").await;
        let stats = relay.drain().await.unwrap();
        assert_eq!(stats.processed, 1);
        assert!(storage.get_processed(&old.id).await.unwrap().is_none());
        assert!(storage.get_processed(&new.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn trim_horizon_reads_existing_records() {
        let storage = test_storage().await;
        let old = ingest(&storage, "before activation").await;
        let relay = relay_with(
            &storage,
            vec![sentiment(Duration::ZERO)],
            Duration::from_secs(1),
            relay_options(),
        );

        assert_eq!(relay.pending().await.unwrap(), 1);
        relay.drain().await.unwrap();
        assert!(storage.get_processed(&old.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let storage = test_storage().await;
        ingest(&storage, "one").await;
        ingest(&storage, "two").await;
        let relay = relay_with(
            &storage,
            vec![sentiment(Duration::ZERO)],
            Duration::from_secs(1),
            relay_options(),
        );

        let stats = relay
            .run(tokio::time::sleep(Duration::from_millis(300)))
            .await;
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.failed_batches, 0);
    }
}
