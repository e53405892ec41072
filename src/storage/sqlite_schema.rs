//! SQL schema definitions and migrations for the SQLite backend
//!
//! Applied versions are recorded in the `schema_version` table; pending
//! migrations run at store construction, each inside its own
//! transaction, in increasing version order.

use chrono::Utc;
use rusqlite::{Connection, Transaction};

use crate::error::{Result, StoreError};

/// Highest migration version known to this build
pub(crate) const CURRENT_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_VERSION_TABLE: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at DATETIME NOT NULL,
    description TEXT
);
";

const CREATE_CONVERSATIONS_TABLE: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    raw_messages TEXT NOT NULL,
    model_type TEXT NOT NULL,
    file_last_access TEXT,
    usage TEXT NOT NULL,
    summary TEXT,
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL,
    metadata TEXT,
    tool_results TEXT
);
";

const CREATE_CONVERSATION_SUMMARIES_TABLE: &str = "
CREATE TABLE IF NOT EXISTS conversation_summaries (
    id TEXT PRIMARY KEY,
    message_count INTEGER NOT NULL,
    first_message TEXT NOT NULL,
    summary TEXT,
    usage TEXT NOT NULL,
    created_at DATETIME NOT NULL,
    updated_at DATETIME NOT NULL
);
";

/// Version 2 indexes keeping listing, sorting, and filtering efficient
const VERSION_2_INDEXES: [&str; 8] = [
    "CREATE INDEX IF NOT EXISTS idx_conversations_created_at ON conversations(created_at DESC);",
    "CREATE INDEX IF NOT EXISTS idx_conversations_updated_at ON conversations(updated_at DESC);",
    "CREATE INDEX IF NOT EXISTS idx_conversations_model_type ON conversations(model_type);",
    "CREATE INDEX IF NOT EXISTS idx_summaries_created_at ON conversation_summaries(created_at DESC);",
    "CREATE INDEX IF NOT EXISTS idx_summaries_updated_at ON conversation_summaries(updated_at DESC);",
    "CREATE INDEX IF NOT EXISTS idx_summaries_message_count ON conversation_summaries(message_count);",
    "CREATE INDEX IF NOT EXISTS idx_summaries_first_message ON conversation_summaries(first_message);",
    "CREATE INDEX IF NOT EXISTS idx_summaries_summary ON conversation_summaries(summary);",
];

/// A single schema migration step
struct Migration {
    version: i64,
    description: &'static str,
    up: fn(&Transaction) -> Result<()>,
}

fn migrations() -> [Migration; 2] {
    [
        Migration {
            version: 1,
            description: "Initial schema creation",
            up: |tx| {
                tx.execute_batch(CREATE_SCHEMA_VERSION_TABLE)
                    .map_err(|err| StoreError::Storage(format!("failed to create schema_version table: {}", err)))?;
                tx.execute_batch(CREATE_CONVERSATIONS_TABLE)
                    .map_err(|err| StoreError::Storage(format!("failed to create conversations table: {}", err)))?;
                tx.execute_batch(CREATE_CONVERSATION_SUMMARIES_TABLE)
                    .map_err(|err| StoreError::Storage(format!("failed to create conversation_summaries table: {}", err)))?;
                Ok(())
            },
        },
        Migration {
            version: 2,
            description: "Add performance indexes",
            up: |tx| {
                for index in VERSION_2_INDEXES {
                    tx.execute_batch(index)
                        .map_err(|err| StoreError::Storage(format!("failed to create index: {}", err)))?;
                }
                Ok(())
            },
        },
    ]
}

/// Apply every pending migration in version order
///
/// Already-applied versions are never reapplied; a fresh database gets
/// all of them.
pub(crate) fn run_migrations(conn: &mut Connection) -> Result<()> {
    let current = current_schema_version(conn)?;

    for migration in migrations() {
        if migration.version > current {
            apply_migration(conn, &migration)?;
        }
    }

    Ok(())
}

/// Highest applied version, or zero for a fresh database
pub(crate) fn current_schema_version(conn: &Connection) -> Result<i64> {
    let table_exists: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get(0),
        )
        .map_err(|err| StoreError::Storage(format!("failed to check schema_version table: {}", err)))?;

    if !table_exists {
        return Ok(0);
    }

    let version: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })
        .map_err(|err| StoreError::Storage(format!("failed to get current schema version: {}", err)))?;

    Ok(version)
}

fn apply_migration(conn: &mut Connection, migration: &Migration) -> Result<()> {
    let tx = conn
        .transaction()
        .map_err(|err| StoreError::Storage(format!("failed to begin transaction: {}", err)))?;

    (migration.up)(&tx)
        .map_err(|err| StoreError::Storage(format!("migration {} failed: {:#}", migration.version, err)))?;

    tx.execute(
        "INSERT INTO schema_version (version, applied_at, description) VALUES (?1, ?2, ?3)",
        rusqlite::params![
            migration.version,
            Utc::now().to_rfc3339(),
            migration.description
        ],
    )
    .map_err(|err| StoreError::Storage(format!("failed to record migration: {}", err)))?;

    tx.commit()
        .map_err(|err| StoreError::Storage(format!("failed to commit migration: {}", err)))?;

    Ok(())
}
