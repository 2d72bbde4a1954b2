//! libSQL storage layer for the entry pipeline.
//!
//! The [`Storage`] struct wraps a local libSQL database that plays three roles:
//! - primary store for ingested entries (`entries`)
//! - change capture source: an insert trigger appends every new entry to
//!   `entry_changes`, whose autoincrement `sequence` is the feed order
//! - persistence sink target (`processed_entries`) plus relay checkpoints
//!
//! **Access rules:**
//! - ingestion and relay processes: read-write via [`Storage::open`]
//! - inspection tooling: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, params};
use moood_shared::{
    ChangeRecord, Entry, EntryId, EntryMetadata, MooodError, ProcessedEntry, Result,
};
use sha2::{Digest, Sha256};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// What an upsert into `processed_entries` found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// First time this entry was persisted.
    Inserted,
    /// The entry was already persisted; `identical` tells whether the new
    /// metadata digest matched the stored one.
    Redelivered { identical: bool },
}

/// A row of `processed_entries`.
#[derive(Debug, Clone)]
pub struct ProcessedRecord {
    pub processed: ProcessedEntry,
    pub metadata_digest: String,
    pub processed_at: DateTime<Utc>,
    pub deliveries: u32,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MooodError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        MooodError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(MooodError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Entry operations
    // -----------------------------------------------------------------------

    /// Insert a new entry. The change-capture trigger appends it to the feed
    /// in the same statement.
    pub async fn insert_entry(&self, entry: &Entry) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO entries (id, entry, created_at) VALUES (?1, ?2, ?3)",
                params![
                    entry.id.as_str(),
                    entry.text.as_str(),
                    format_ts(&entry.created_at)
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Get an entry by id.
    pub async fn get_entry(&self, id: &EntryId) -> Result<Option<Entry>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, entry, created_at FROM entries WHERE id = ?1",
                params![id.as_str()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(Entry {
                id: EntryId(row.get::<String>(0).map_err(db_err)?),
                text: row.get::<String>(1).map_err(db_err)?,
                created_at: parse_ts(&row.get::<String>(2).map_err(db_err)?)?,
            })),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Change feed
    // -----------------------------------------------------------------------

    /// Read up to `limit` change records with a sequence strictly greater than
    /// `after`, in feed order. `None` reads from the oldest retained record.
    pub async fn read_changes(&self, after: Option<i64>, limit: usize) -> Result<Vec<ChangeRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT sequence, entry_id, entry, created_at
                 FROM entry_changes
                 WHERE sequence > ?1
                 ORDER BY sequence
                 LIMIT ?2",
                params![after.unwrap_or(0), limit as i64],
            )
            .await
            .map_err(db_err)?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            records.push(ChangeRecord {
                sequence: row.get::<i64>(0).map_err(db_err)?,
                entry_id: EntryId(row.get::<String>(1).map_err(db_err)?),
                entry_text: row.get::<String>(2).map_err(db_err)?,
                entry_created_at: parse_ts(&row.get::<String>(3).map_err(db_err)?)?,
            });
        }
        Ok(records)
    }

    /// Sequence of the oldest retained change record.
    pub async fn earliest_sequence(&self) -> Result<Option<i64>> {
        self.query_optional_i64("SELECT MIN(sequence) FROM entry_changes")
            .await
    }

    /// Sequence of the newest change record.
    pub async fn latest_sequence(&self) -> Result<Option<i64>> {
        self.query_optional_i64("SELECT MAX(sequence) FROM entry_changes")
            .await
    }

    /// Number of change records after `after`.
    pub async fn pending_changes(&self, after: Option<i64>) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM entry_changes WHERE sequence > ?1",
                params![after.unwrap_or(0)],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(db_err)?.max(0) as u64),
            None => Ok(0),
        }
    }

    async fn query_optional_i64(&self, sql: &str) -> Result<Option<i64>> {
        let mut rows = self.conn.query(sql, params![]).await.map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            // Aggregates over an empty table yield NULL
            Some(row) => Ok(row.get::<i64>(0).ok()),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // Relay checkpoints
    // -----------------------------------------------------------------------

    /// Last acknowledged sequence for a relay, if it has ever acknowledged.
    pub async fn get_checkpoint(&self, relay_name: &str) -> Result<Option<i64>> {
        let mut rows = self
            .conn
            .query(
                "SELECT last_sequence FROM relay_checkpoints WHERE relay_name = ?1",
                params![relay_name],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row.get::<i64>(0).map_err(db_err)?)),
            None => Ok(None),
        }
    }

    /// Record an acknowledgement up to and including `sequence`.
    pub async fn set_checkpoint(&self, relay_name: &str, sequence: i64) -> Result<()> {
        self.check_writable()?;
        let now = format_ts(&Utc::now());
        self.conn
            .execute(
                "INSERT INTO relay_checkpoints (relay_name, last_sequence, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(relay_name) DO UPDATE SET
                   last_sequence = excluded.last_sequence,
                   updated_at = excluded.updated_at",
                params![relay_name, sequence, now],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Processed entries (persistence sink)
    // -----------------------------------------------------------------------

    /// Store a merged entry. Redelivered entries overwrite the previous row
    /// and bump its delivery count.
    pub async fn upsert_processed(&self, processed: &ProcessedEntry) -> Result<PersistOutcome> {
        self.check_writable()?;

        let metadata_json = processed.metadata.to_canonical_json()?;
        let digest = metadata_digest(&processed.metadata)?;
        let previous = self.processed_digest(&processed.entry.id).await?;
        let now = format_ts(&Utc::now());

        self.conn
            .execute(
                "INSERT INTO processed_entries
                   (id, entry, created_at, metadata_json, metadata_digest, processed_at, deliveries)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)
                 ON CONFLICT(id) DO UPDATE SET
                   metadata_json = excluded.metadata_json,
                   metadata_digest = excluded.metadata_digest,
                   processed_at = excluded.processed_at,
                   deliveries = processed_entries.deliveries + 1",
                params![
                    processed.entry.id.as_str(),
                    processed.entry.text.as_str(),
                    format_ts(&processed.entry.created_at),
                    metadata_json,
                    digest.as_str(),
                    now
                ],
            )
            .await
            .map_err(db_err)?;

        Ok(match previous {
            None => PersistOutcome::Inserted,
            Some(prev) => PersistOutcome::Redelivered {
                identical: prev == digest,
            },
        })
    }

    async fn processed_digest(&self, id: &EntryId) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT metadata_digest FROM processed_entries WHERE id = ?1",
                params![id.as_str()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(db_err)?)),
            None => Ok(None),
        }
    }

    /// Get a processed entry by id.
    pub async fn get_processed(&self, id: &EntryId) -> Result<Option<ProcessedRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, entry, created_at, metadata_json, metadata_digest, processed_at, deliveries
                 FROM processed_entries WHERE id = ?1",
                params![id.as_str()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_processed(&row)?)),
            None => Ok(None),
        }
    }
}

/// SHA-256 over the canonical (sorted-key) metadata JSON.
pub fn metadata_digest(metadata: &EntryMetadata) -> Result<String> {
    let json = metadata.to_canonical_json()?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Convert a database row to a [`ProcessedRecord`].
fn row_to_processed(row: &libsql::Row) -> Result<ProcessedRecord> {
    let metadata_json: String = row.get(3).map_err(db_err)?;
    let metadata: EntryMetadata = serde_json::from_str(&metadata_json)
        .map_err(|e| MooodError::Storage(format!("invalid metadata_json: {e}")))?;

    Ok(ProcessedRecord {
        processed: ProcessedEntry {
            entry: Entry {
                id: EntryId(row.get::<String>(0).map_err(db_err)?),
                text: row.get::<String>(1).map_err(db_err)?,
                created_at: parse_ts(&row.get::<String>(2).map_err(db_err)?)?,
            },
            metadata,
        },
        metadata_digest: row.get::<String>(4).map_err(db_err)?,
        processed_at: parse_ts(&row.get::<String>(5).map_err(db_err)?)?,
        deliveries: row.get::<i64>(6).map_err(db_err)?.max(0) as u32,
    })
}

fn db_err(e: impl std::fmt::Display) -> MooodError {
    MooodError::Storage(e.to_string())
}

/// RFC 3339 with full sub-second precision, so timestamps round-trip exactly.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MooodError::Storage(format!("invalid date {s:?}: {e}")))
}
