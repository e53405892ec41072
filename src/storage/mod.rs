//! Conversation persistence behind a single storage contract
//!
//! Three interchangeable backends implement [`ConversationStore`]: an
//! embedded key-value store (sled), a WAL-mode SQLite database, and a
//! directory of JSON files fronted by an in-memory cache. A
//! configuration-driven factory selects the backend; the [`migrate`]
//! module moves conversations from the file store into either database
//! backend.

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::Result;

pub mod json_store;
pub mod migrate;
pub mod sled_store;
pub mod sqlite_store;
pub mod types;

mod sqlite_schema;

pub use json_store::JsonConversationStore;
pub use sled_store::SledConversationStore;
pub use sqlite_store::SqliteConversationStore;
pub use types::{
    generate_id, ConversationRecord, ConversationSummary, QueryOptions, QueryResult, SortKey,
    SortOrder, StructuredToolResult, Usage,
};

/// Storage contract implemented by every backend
///
/// Each operation runs to completion before returning; backends provide
/// their own multi-process safety (engine locking for sled and SQLite,
/// filesystem notifications for the file store).
pub trait ConversationStore: Send + Sync {
    /// Upsert the record and its derived summary as one atomic unit
    ///
    /// Refreshes `updated_at` on the caller's record before persisting,
    /// so the stored copy and the caller's copy agree.
    fn save(&self, record: &mut ConversationRecord) -> Result<()>;

    /// Load a record by ID
    ///
    /// A missing ID yields [`crate::error::StoreError::NotFound`],
    /// checkable with [`crate::error::is_not_found`].
    fn load(&self, id: &str) -> Result<ConversationRecord>;

    /// List all conversation summaries with default query options
    fn list(&self) -> Result<Vec<ConversationSummary>> {
        Ok(self.query(QueryOptions::default())?.summaries)
    }

    /// Delete a conversation
    ///
    /// Whether deleting an unknown ID errors is backend-declared: the
    /// sled and SQLite backends treat it as a no-op, the file backend
    /// reports not-found.
    fn delete(&self, id: &str) -> Result<()>;

    /// Query summaries with filtering, sorting, and pagination
    fn query(&self, options: QueryOptions) -> Result<QueryResult>;

    /// Release held resources
    ///
    /// Safe to call exactly once; no background work continues after it
    /// returns.
    fn close(&self) -> Result<()>;
}

/// Create the storage backend selected by the configuration
///
/// Before first opening a sled or SQLite destination this checks for an
/// existing file-store directory and migrates it automatically; a failed
/// auto-migration logs a warning and the store opens anyway.
///
/// # Examples
///
/// ```no_run
/// use convstore::config::StorageConfig;
/// use convstore::storage::{new_conversation_store, ConversationStore};
///
/// # fn main() -> anyhow::Result<()> {
/// let config = StorageConfig::from_env()?;
/// let store = new_conversation_store(&config)?;
/// let summaries = store.list()?;
/// # Ok(())
/// # }
/// ```
pub fn new_conversation_store(config: &StorageConfig) -> Result<Box<dyn ConversationStore>> {
    match config.backend {
        StorageBackend::Json => {
            let store = JsonConversationStore::new(json_dir(&config.base_path))?;
            Ok(Box::new(store))
        }
        StorageBackend::Sled => {
            let db_path = sled_db_path(&config.base_path);
            maybe_auto_migrate(config, StorageBackend::Sled, &db_path);
            Ok(Box::new(SledConversationStore::new(&db_path)?))
        }
        StorageBackend::Sqlite => {
            let db_path = sqlite_db_path(&config.base_path);
            maybe_auto_migrate(config, StorageBackend::Sqlite, &db_path);
            Ok(Box::new(SqliteConversationStore::new(&db_path)?))
        }
    }
}

/// Conversation-file directory for the JSON backend under a base path
pub fn json_dir(base_path: &Path) -> PathBuf {
    base_path.join("conversations")
}

/// Database path for the sled backend under a base path
pub fn sled_db_path(base_path: &Path) -> PathBuf {
    base_path.join("storage.sled")
}

/// Database path for the SQLite backend under a base path
pub fn sqlite_db_path(base_path: &Path) -> PathBuf {
    base_path.join("storage.db")
}

/// Return the ID of the most recently updated conversation
///
/// # Errors
///
/// Fails when the store holds no conversations at all.
pub fn most_recent_conversation_id(store: &dyn ConversationStore) -> Result<String> {
    let options = QueryOptions {
        limit: 1,
        sort_by: SortKey::UpdatedAt,
        sort_order: SortOrder::Desc,
        ..QueryOptions::default()
    };

    let result = store.query(options)?;
    match result.summaries.first() {
        Some(summary) => Ok(summary.id.clone()),
        None => anyhow::bail!("no conversations found"),
    }
}

/// Migrate an existing file-store directory into a fresh database
///
/// Runs only when the destination database does not exist yet and the
/// file directory holds at least one parseable conversation. Original
/// files are backed up, never deleted.
fn maybe_auto_migrate(config: &StorageConfig, backend: StorageBackend, db_path: &Path) {
    if db_path.exists() {
        return;
    }

    let source = json_dir(&config.base_path);
    let detected = match migrate::detect_file_conversations(&source) {
        Ok(ids) => ids,
        Err(err) => {
            tracing::debug!("file-conversation detection failed: {:#}", err);
            return;
        }
    };
    if detected.is_empty() {
        return;
    }

    let backup_path = config
        .base_path
        .join("backup")
        .join(Utc::now().format("%Y%m%d-%H%M%S").to_string());

    let destination = match backend {
        StorageBackend::Sled => migrate::MigrationDestination::sled(db_path),
        StorageBackend::Sqlite => migrate::MigrationDestination::sqlite(db_path),
        StorageBackend::Json => return,
    };

    let options = migrate::MigrationOptions {
        dry_run: false,
        force: false,
        backup_path: Some(backup_path),
    };

    match migrate::migrate_file_store(&source, &destination, &options) {
        Ok(result) => {
            tracing::info!(
                migrated = result.migrated_count,
                failed = result.failed_count,
                "automatically migrated file-store conversations"
            );
        }
        Err(err) => {
            tracing::warn!("automatic migration failed, continuing with empty store: {:#}", err);
        }
    }
}

/// Sort summaries in place by the requested key and direction
pub(crate) fn apply_sort(
    summaries: &mut [ConversationSummary],
    sort_by: SortKey,
    sort_order: SortOrder,
) {
    summaries.sort_by(|a, b| {
        let ordering = match sort_by {
            SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
            SortKey::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            SortKey::MessageCount => a.message_count.cmp(&b.message_count),
        };
        match sort_order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });
}

/// Apply offset then limit to an already sorted result set
pub(crate) fn paginate(
    mut summaries: Vec<ConversationSummary>,
    limit: usize,
    offset: usize,
) -> Vec<ConversationSummary> {
    if offset > 0 {
        if offset >= summaries.len() {
            return Vec::new();
        }
        summaries.drain(..offset);
    }

    if limit > 0 && summaries.len() > limit {
        summaries.truncate(limit);
    }

    summaries
}
