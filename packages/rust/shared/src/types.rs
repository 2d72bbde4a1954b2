//! Core domain types for the Moood entry pipeline.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{MooodError, Result};

// ---------------------------------------------------------------------------
// EntryId
// ---------------------------------------------------------------------------

/// Globally unique entry identifier, assigned once at ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub String);

impl EntryId {
    /// Generate a new time-sortable identifier (UUID v7).
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// A user-submitted piece of text. Immutable once created.
///
/// Serializes as `{ "id", "entry", "createdAt" }`, which is also the exact
/// input every worker receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    #[serde(rename = "entry")]
    pub text: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl Entry {
    /// Build a fresh entry with a generated id and the current time.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: EntryId::generate(),
            text: text.into(),
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerDescriptor
// ---------------------------------------------------------------------------

/// Static description of one analysis worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerDescriptor {
    /// Lowercase identifier-safe token; the metadata key for this worker.
    pub name: String,
    /// Parameters used when packaging the worker.
    #[serde(default)]
    pub build_parameters: BTreeMap<String, String>,
    /// Parameters handed to the worker at invocation time.
    #[serde(default)]
    pub runtime_parameters: BTreeMap<String, String>,
}

impl WorkerDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            build_parameters: BTreeMap::new(),
            runtime_parameters: BTreeMap::new(),
        }
    }

    pub fn with_build_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.build_parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_runtime_parameter(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.runtime_parameters.insert(key.into(), value.into());
        self
    }

    /// Capitalized label for human-facing output. Never used for routing.
    pub fn display_name(&self) -> String {
        let mut chars = self.name.chars();
        match chars.next() {
            Some(first) => first
                .to_uppercase()
                .chain(chars.flat_map(char::to_lowercase))
                .collect(),
            None => String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerResult
// ---------------------------------------------------------------------------

/// Why a single worker invocation did not produce a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerFailure {
    /// The invocation exceeded its timeout.
    Timeout { after: Duration },
    /// Error exit, transport failure, or malformed output.
    InvocationFailed { reason: String },
}

/// Outcome of invoking one worker for one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResult {
    pub worker_name: String,
    pub outcome: std::result::Result<Value, WorkerFailure>,
}

impl WorkerResult {
    pub fn success(worker_name: impl Into<String>, payload: Value) -> Self {
        Self {
            worker_name: worker_name.into(),
            outcome: Ok(payload),
        }
    }

    pub fn failure(worker_name: impl Into<String>, failure: WorkerFailure) -> Self {
        Self {
            worker_name: worker_name.into(),
            outcome: Err(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Turn the result into a `(name, payload)` metadata fragment, or the
    /// matching pipeline error.
    pub fn into_fragment(self) -> Result<(String, Value)> {
        match self.outcome {
            Ok(payload) => Ok((self.worker_name, payload)),
            Err(WorkerFailure::Timeout { after }) => Err(MooodError::WorkerTimeout {
                worker: self.worker_name,
                timeout: after,
            }),
            Err(WorkerFailure::InvocationFailed { reason }) => {
                Err(MooodError::invocation(self.worker_name, reason))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// EntryMetadata
// ---------------------------------------------------------------------------

/// Merged worker output for one entry, keyed by worker name.
///
/// Backed by a sorted map so the serialized form does not depend on the order
/// in which workers finished.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryMetadata(BTreeMap<String, Value>);

impl EntryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a worker's payload. Returns the previous payload if the key was
    /// already present.
    pub fn insert(&mut self, worker_name: impl Into<String>, payload: Value) -> Option<Value> {
        self.0.insert(worker_name.into(), payload)
    }

    pub fn get(&self, worker_name: &str) -> Option<&Value> {
        self.0.get(worker_name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Worker names present, in sorted order.
    pub fn worker_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Canonical JSON encoding (sorted keys).
    pub fn to_canonical_json(&self) -> Result<String> {
        serde_json::to_string(&self.0).map_err(|e| MooodError::Serialization(e.to_string()))
    }
}

impl FromIterator<(String, Value)> for EntryMetadata {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ---------------------------------------------------------------------------
// ProcessedEntry
// ---------------------------------------------------------------------------

/// The merged value handed to the persistence sink:
/// `{ id, entry, createdAt, metadata: { <worker>: <payload>, ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEntry {
    #[serde(flatten)]
    pub entry: Entry,
    pub metadata: EntryMetadata,
}

// ---------------------------------------------------------------------------
// ChangeRecord
// ---------------------------------------------------------------------------

/// One entry-creation event read from the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    /// Position in the feed's total order.
    #[serde(rename = "sequencePosition")]
    pub sequence: i64,
    pub entry_id: EntryId,
    pub entry_text: String,
    pub entry_created_at: DateTime<Utc>,
}

impl ChangeRecord {
    /// Extract the orchestrator's start input.
    pub fn to_entry(&self) -> Entry {
        Entry {
            id: self.entry_id.clone(),
            text: self.entry_text.clone(),
            created_at: self.entry_created_at,
        }
    }
}
