//! SQLite backend for conversation storage
//!
//! Stores full records in `conversations` and a denormalized projection
//! in `conversation_summaries`; nested structures (usage, metadata,
//! file-access and tool-result maps) are serialized into JSON text
//! columns. The database runs in WAL mode with a multi-second busy
//! timeout, and exactly one connection is held for the lifetime of the
//! store so pragma configuration cannot drift between connections and
//! writers serialize consistently with SQLite's single-writer model.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};

use crate::error::{Result, StoreError};
use crate::storage::sqlite_schema;
use crate::storage::types::{
    ConversationRecord, ConversationSummary, QueryOptions, QueryResult, SortKey, SortOrder, Usage,
};
use crate::storage::ConversationStore;

/// Conversation store backed by a WAL-mode SQLite database
pub struct SqliteConversationStore {
    db_path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl SqliteConversationStore {
    /// Open or create a SQLite conversation store
    ///
    /// Creates the parent directory, applies and verifies the connection
    /// pragmas, and runs any pending schema migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened, WAL mode
    /// cannot be enabled, or a migration fails.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::Io)?;
        }

        let mut conn = Connection::open(&db_path)
            .map_err(|err| StoreError::Storage(format!("failed to open database: {}", err)))?;

        configure_connection(&conn)?;
        sqlite_schema::run_migrations(&mut conn)?;

        Ok(Self {
            db_path,
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Path of the underlying database file
    pub fn db_path(&self) -> &std::path::Path {
        &self.db_path
    }

    fn with_conn<T>(&self, operation: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StoreError::Storage("connection mutex poisoned".to_string()))?;

        let conn = guard
            .as_mut()
            .ok_or_else(|| StoreError::Storage("store is closed".to_string()))?;

        operation(conn)
    }
}

/// Apply the connection pragmas and verify they took effect
///
/// WAL journaling, NORMAL synchronous durability, an in-memory temp
/// store, a 5-second busy timeout, and foreign-key enforcement.
fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA cache_size=1000;
         PRAGMA temp_store=memory;
         PRAGMA busy_timeout=5000;
         PRAGMA foreign_keys=ON;",
    )
    .map_err(|err| StoreError::Storage(format!("failed to configure database: {}", err)))?;

    let journal_mode: String = conn
        .query_row("PRAGMA journal_mode", [], |row| row.get(0))
        .map_err(|err| StoreError::Storage(format!("failed to query journal mode: {}", err)))?;
    if !journal_mode.eq_ignore_ascii_case("wal") {
        return Err(StoreError::Storage(format!(
            "WAL mode not enabled, current mode: {}",
            journal_mode
        ))
        .into());
    }

    let foreign_keys: i64 = conn
        .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
        .map_err(|err| StoreError::Storage(format!("failed to query foreign keys: {}", err)))?;
    if foreign_keys != 1 {
        return Err(StoreError::Storage("foreign key enforcement not enabled".to_string()).into());
    }

    Ok(())
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(text: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(text)
        .map_err(|err| StoreError::Storage(format!("failed to parse timestamp {}: {}", text, err)))?;
    Ok(parsed.with_timezone(&Utc))
}

fn sort_column(sort_by: SortKey) -> &'static str {
    // Restricted to this allow-list; never built from caller input.
    match sort_by {
        SortKey::CreatedAt => "created_at",
        SortKey::UpdatedAt => "updated_at",
        SortKey::MessageCount => "message_count",
    }
}

fn sort_direction(order: SortOrder) -> &'static str {
    match order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    }
}

/// Raw column values of one summary row, before JSON/timestamp parsing
type SummaryRow = (String, i64, String, Option<String>, String, String, String);

fn summary_from_row(row: SummaryRow) -> Option<ConversationSummary> {
    let (id, message_count, first_message, summary, usage, created_at, updated_at) = row;

    let usage: Usage = serde_json::from_str(&usage).ok()?;
    let created_at = parse_timestamp(&created_at).ok()?;
    let updated_at = parse_timestamp(&updated_at).ok()?;

    Some(ConversationSummary {
        id,
        message_count: message_count.max(0) as usize,
        first_message,
        summary: summary.unwrap_or_default(),
        created_at,
        updated_at,
        usage,
    })
}

/// Upsert both tables inside an already open transaction
///
/// Shared with the migration batch writer so a whole batch can ride a
/// single transaction.
pub(crate) fn upsert_record(tx: &rusqlite::Transaction, record: &ConversationRecord) -> Result<()> {
    let raw_messages = record.raw_messages.to_string();
    let file_last_access =
        serde_json::to_string(&record.file_last_access).map_err(StoreError::Serialization)?;
    let usage = serde_json::to_string(&record.usage).map_err(StoreError::Serialization)?;
    let metadata = serde_json::to_string(&record.metadata).map_err(StoreError::Serialization)?;
    let tool_results =
        serde_json::to_string(&record.tool_results).map_err(StoreError::Serialization)?;

    tx.execute(
        "INSERT INTO conversations (
            id, raw_messages, model_type, file_last_access, usage,
            summary, created_at, updated_at, metadata, tool_results
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(id) DO UPDATE SET
            raw_messages = excluded.raw_messages,
            model_type = excluded.model_type,
            file_last_access = excluded.file_last_access,
            usage = excluded.usage,
            summary = excluded.summary,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            metadata = excluded.metadata,
            tool_results = excluded.tool_results",
        params![
            record.id,
            raw_messages,
            record.model_type,
            file_last_access,
            usage,
            record.summary,
            format_timestamp(record.created_at),
            format_timestamp(record.updated_at),
            metadata,
            tool_results,
        ],
    )
    .map_err(|err| StoreError::Storage(format!("failed to save conversation record: {}", err)))?;

    let summary = record.to_summary();
    let summary_usage = serde_json::to_string(&summary.usage).map_err(StoreError::Serialization)?;

    tx.execute(
        "INSERT INTO conversation_summaries (
            id, message_count, first_message, summary, usage, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT(id) DO UPDATE SET
            message_count = excluded.message_count,
            first_message = excluded.first_message,
            summary = excluded.summary,
            usage = excluded.usage,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at",
        params![
            summary.id,
            summary.message_count as i64,
            summary.first_message,
            summary.summary,
            summary_usage,
            format_timestamp(summary.created_at),
            format_timestamp(summary.updated_at),
        ],
    )
    .map_err(|err| StoreError::Storage(format!("failed to save conversation summary: {}", err)))?;

    Ok(())
}

impl ConversationStore for SqliteConversationStore {
    fn save(&self, record: &mut ConversationRecord) -> Result<()> {
        record.updated_at = Utc::now();

        self.with_conn(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| StoreError::Storage(format!("failed to begin transaction: {}", err)))?;

            upsert_record(&tx, record)?;

            tx.commit()
                .map_err(|err| StoreError::Storage(format!("failed to commit transaction: {}", err)))?;
            Ok(())
        })
    }

    fn load(&self, id: &str) -> Result<ConversationRecord> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, raw_messages, model_type, file_last_access, usage,
                            summary, created_at, updated_at, metadata, tool_results
                     FROM conversations WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, Option<String>>(5)?,
                            row.get::<_, String>(6)?,
                            row.get::<_, String>(7)?,
                            row.get::<_, Option<String>>(8)?,
                            row.get::<_, Option<String>>(9)?,
                        ))
                    },
                )
                .optional()
                .map_err(|err| StoreError::Storage(format!("failed to load conversation: {}", err)))?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

            let (
                id,
                raw_messages,
                model_type,
                file_last_access,
                usage,
                summary,
                created_at,
                updated_at,
                metadata,
                tool_results,
            ) = row;

            Ok(ConversationRecord {
                id,
                raw_messages: serde_json::from_str(&raw_messages)
                    .map_err(StoreError::Serialization)?,
                model_type,
                summary: summary.unwrap_or_default(),
                created_at: parse_timestamp(&created_at)?,
                updated_at: parse_timestamp(&updated_at)?,
                metadata: match metadata {
                    Some(text) => serde_json::from_str(&text).map_err(StoreError::Serialization)?,
                    None => Default::default(),
                },
                file_last_access: match file_last_access {
                    Some(text) => serde_json::from_str(&text).map_err(StoreError::Serialization)?,
                    None => Default::default(),
                },
                usage: serde_json::from_str(&usage).map_err(StoreError::Serialization)?,
                tool_results: match tool_results {
                    Some(text) => serde_json::from_str(&text).map_err(StoreError::Serialization)?,
                    None => Default::default(),
                },
            })
        })
    }

    /// Delete from both tables in one transaction; unknown IDs are a no-op
    fn delete(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| StoreError::Storage(format!("failed to begin transaction: {}", err)))?;

            tx.execute("DELETE FROM conversations WHERE id = ?1", params![id])
                .map_err(|err| {
                    StoreError::Storage(format!("failed to delete conversation record: {}", err))
                })?;
            tx.execute(
                "DELETE FROM conversation_summaries WHERE id = ?1",
                params![id],
            )
            .map_err(|err| {
                StoreError::Storage(format!("failed to delete conversation summary: {}", err))
            })?;

            tx.commit()
                .map_err(|err| StoreError::Storage(format!("failed to commit transaction: {}", err)))?;
            Ok(())
        })
    }

    /// Query the denormalized summaries table
    ///
    /// The WHERE clause is built from parameterized conditions (date
    /// range on `created_at`, case-insensitive LIKE over the indexed
    /// text columns); ORDER BY comes from a fixed column allow-list. A
    /// second COUNT(*) query with the same predicate reports the total
    /// before pagination. Rows that fail to parse are skipped.
    fn query(&self, options: QueryOptions) -> Result<QueryResult> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut condition_params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(start) = options.start_date {
            conditions.push("created_at >= ?");
            condition_params.push(Box::new(format_timestamp(start)));
        }
        if let Some(end) = options.end_date {
            conditions.push("created_at <= ?");
            condition_params.push(Box::new(format_timestamp(end)));
        }
        if let Some(term) = options.search_term.as_deref() {
            if !term.is_empty() {
                let pattern = format!("%{}%", term.to_lowercase());
                conditions.push("(LOWER(first_message) LIKE ? OR LOWER(summary) LIKE ?)");
                condition_params.push(Box::new(pattern.clone()));
                condition_params.push(Box::new(pattern));
            }
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        self.with_conn(|conn| {
            let count_query = format!(
                "SELECT COUNT(*) FROM conversation_summaries{}",
                where_clause
            );
            let total: i64 = conn
                .query_row(
                    &count_query,
                    rusqlite::params_from_iter(condition_params.iter().map(|p| p.as_ref())),
                    |row| row.get(0),
                )
                .map_err(|err| StoreError::Storage(format!("failed to get total count: {}", err)))?;

            let mut query = format!(
                "SELECT id, message_count, first_message, summary, usage, created_at, updated_at
                 FROM conversation_summaries{} ORDER BY {} {}",
                where_clause,
                sort_column(options.sort_by),
                sort_direction(options.sort_order),
            );

            let mut params: Vec<Box<dyn ToSql>> = condition_params;
            if options.limit > 0 {
                query.push_str(" LIMIT ?");
                params.push(Box::new(options.limit as i64));
                if options.offset > 0 {
                    query.push_str(" OFFSET ?");
                    params.push(Box::new(options.offset as i64));
                }
            }

            let mut stmt = conn
                .prepare(&query)
                .map_err(|err| StoreError::Storage(format!("failed to prepare query: {}", err)))?;

            let rows = stmt
                .query_map(
                    rusqlite::params_from_iter(params.iter().map(|p| p.as_ref())),
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, Option<String>>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, String>(5)?,
                            row.get::<_, String>(6)?,
                        ))
                    },
                )
                .map_err(|err| StoreError::Storage(format!("failed to execute query: {}", err)))?;

            let summaries: Vec<ConversationSummary> = rows
                .filter_map(|row| row.ok())
                .filter_map(summary_from_row)
                .collect();

            Ok(QueryResult {
                summaries,
                total: total.max(0) as usize,
                options: options.clone(),
            })
        })
    }

    /// Close the database connection; later operations report a closed store
    fn close(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StoreError::Storage("connection mutex poisoned".to_string()))?;

        if let Some(conn) = guard.take() {
            conn.close()
                .map_err(|(_, err)| StoreError::Storage(format!("failed to close database: {}", err)))?;
        }

        Ok(())
    }
}

impl crate::storage::migrate::MigrationTarget for SqliteConversationStore {
    /// Write a whole migration batch inside one transaction
    ///
    /// Unless forced, IDs already present in the conversations table are
    /// skipped. A failure rolls the transaction back, leaving both
    /// tables exactly as they were.
    fn save_batch(
        &self,
        records: &[ConversationRecord],
        force: bool,
    ) -> Result<crate::storage::migrate::BatchOutcome> {
        self.with_conn(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| StoreError::Storage(format!("failed to begin transaction: {}", err)))?;

            let mut migrated_ids = Vec::new();
            let mut skipped_ids = Vec::new();

            for record in records {
                if !force {
                    let exists: Option<i64> = tx
                        .query_row(
                            "SELECT 1 FROM conversations WHERE id = ?1",
                            params![record.id],
                            |row| row.get(0),
                        )
                        .optional()
                        .map_err(|err| {
                            StoreError::Storage(format!("failed to check existing record: {}", err))
                        })?;
                    if exists.is_some() {
                        skipped_ids.push(record.id.clone());
                        continue;
                    }
                }

                upsert_record(&tx, record)?;
                migrated_ids.push(record.id.clone());
            }

            tx.commit()
                .map_err(|err| StoreError::Storage(format!("failed to commit batch: {}", err)))?;

            Ok(crate::storage::migrate::BatchOutcome {
                migrated_ids,
                skipped_ids,
            })
        })
    }
}
