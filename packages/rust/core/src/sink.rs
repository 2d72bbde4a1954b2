//! Persistence sink: where merged entries go after fan-out.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use moood_shared::{MooodError, ProcessedEntry, Result};
use moood_storage::{PersistOutcome, Storage};

/// Durable destination for processed entries.
///
/// `persist` must only return `Ok` once the entry is stored; any error is
/// reported as an execution failure and the record is redelivered.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn persist(&self, processed: &ProcessedEntry) -> Result<()>;
}

/// Sink backed by the `processed_entries` table.
pub struct StorageSink {
    storage: Arc<Storage>,
}

impl StorageSink {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl PersistenceSink for StorageSink {
    async fn persist(&self, processed: &ProcessedEntry) -> Result<()> {
        let entry_id = &processed.entry.id;
        let outcome = self
            .storage
            .upsert_processed(processed)
            .await
            .map_err(|e| MooodError::PersistenceFailure(e.to_string()))?;

        match outcome {
            PersistOutcome::Inserted => debug!(%entry_id, "processed entry stored"),
            PersistOutcome::Redelivered { identical: true } => {
                info!(%entry_id, "redelivered entry stored again with identical metadata")
            }
            PersistOutcome::Redelivered { identical: false } => {
                warn!(%entry_id, "redelivered entry produced different metadata, overwriting")
            }
        }
        Ok(())
    }
}
