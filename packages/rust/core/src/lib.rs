//! Pipeline orchestration for Moood.
//!
//! This crate ties the store, the workers, and the persistence sink into the
//! end-to-end flow: ingest → change feed → relay → fan-out → merge → persist.

pub mod ingest;
pub mod orchestrator;
pub mod relay;
pub mod runtime;
pub mod sink;

pub use ingest::{ingest, parse_entry_payload, validate_entry_text};
pub use orchestrator::{ExecutionObserver, ExecutionState, Orchestrator, SilentObserver};
pub use relay::{BatchOutcome, EventRelay, RelayStats};
pub use runtime::Pipeline;
pub use sink::{PersistenceSink, StorageSink};
