//! SQL migration definitions for the Moood database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: entries, entry_changes feed, relay_checkpoints",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Primary store: one row per ingested entry, never updated
CREATE TABLE IF NOT EXISTS entries (
    id         TEXT PRIMARY KEY,
    entry      TEXT NOT NULL CHECK (length(entry) >= 1),
    created_at TEXT NOT NULL
);

-- Change feed: append-only image of every entry insert
CREATE TABLE IF NOT EXISTS entry_changes (
    sequence    INTEGER PRIMARY KEY AUTOINCREMENT,
    entry_id    TEXT NOT NULL,
    entry       TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    recorded_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_entry_changes_entry ON entry_changes(entry_id);

CREATE TRIGGER IF NOT EXISTS entries_change_capture AFTER INSERT ON entries BEGIN
    INSERT INTO entry_changes (entry_id, entry, created_at)
    VALUES (new.id, new.entry, new.created_at);
END;

-- Acknowledged position per relay
CREATE TABLE IF NOT EXISTS relay_checkpoints (
    relay_name    TEXT PRIMARY KEY,
    last_sequence INTEGER NOT NULL,
    updated_at    TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Persistence sink: processed_entries",
            sql: r#"
CREATE TABLE IF NOT EXISTS processed_entries (
    id              TEXT PRIMARY KEY,
    entry           TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    metadata_json   TEXT NOT NULL,
    metadata_digest TEXT NOT NULL,
    processed_at    TEXT NOT NULL,
    deliveries      INTEGER NOT NULL DEFAULT 1
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
