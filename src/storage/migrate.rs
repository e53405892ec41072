//! One-directional migration from the JSON file store into a database backend
//!
//! Detects conversation files, loads them through the file store, and
//! writes the whole set to the destination in a single transaction, so a
//! mid-batch failure commits nothing. After a successful write every
//! migrated record is reloaded from the destination and compared against
//! its source; any mismatch fails the migration even though the data is
//! already committed. Source files are never deleted or modified.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use walkdir::WalkDir;

use crate::error::{Result, StoreError};
use crate::storage::types::ConversationRecord;
use crate::storage::{
    ConversationStore, JsonConversationStore, SledConversationStore, SqliteConversationStore,
};

/// Configuration for a migration run
#[derive(Debug, Clone, Default)]
pub struct MigrationOptions {
    /// Report what would be migrated without opening the destination
    pub dry_run: bool,
    /// Overwrite records already present at the destination
    pub force: bool,
    /// Copy source files here before migrating, preserving relative paths
    pub backup_path: Option<PathBuf>,
}

/// Outcome of a migration run
#[derive(Debug, Clone, Default)]
pub struct MigrationResult {
    pub total_conversations: usize,
    pub migrated_count: usize,
    pub skipped_count: usize,
    pub failed_count: usize,
    pub failed_ids: Vec<String>,
    pub duration: Duration,
}

/// Database destination for a migration
///
/// Only the sled and SQLite backends can be targets; the file store is
/// the source side of this utility.
#[derive(Debug, Clone)]
pub struct MigrationDestination {
    backend: DestinationBackend,
    db_path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
enum DestinationBackend {
    Sled,
    Sqlite,
}

impl MigrationDestination {
    /// Target a sled database at the given path
    pub fn sled(db_path: impl Into<PathBuf>) -> Self {
        Self {
            backend: DestinationBackend::Sled,
            db_path: db_path.into(),
        }
    }

    /// Target a SQLite database at the given path
    pub fn sqlite(db_path: impl Into<PathBuf>) -> Self {
        Self {
            backend: DestinationBackend::Sqlite,
            db_path: db_path.into(),
        }
    }

    fn open(&self) -> Result<Box<dyn MigrationTarget>> {
        match self.backend {
            DestinationBackend::Sled => Ok(Box::new(SledConversationStore::new(&self.db_path)?)),
            DestinationBackend::Sqlite => {
                Ok(Box::new(SqliteConversationStore::new(&self.db_path)?))
            }
        }
    }
}

/// Result of writing one migration batch
pub(crate) struct BatchOutcome {
    pub migrated_ids: Vec<String>,
    pub skipped_ids: Vec<String>,
}

/// Backend-side batch writer used by the migration
///
/// `save_batch` must write every record inside one transaction spanning
/// the backend's namespaces or tables, skipping already-present IDs
/// unless `force` is set.
pub(crate) trait MigrationTarget: ConversationStore {
    fn save_batch(&self, records: &[ConversationRecord], force: bool) -> Result<BatchOutcome>;
}

/// Find conversation IDs stored as JSON files under a directory
///
/// Only files that deserialize into a record with a non-empty ID and a
/// plausible creation timestamp count; everything else (temporaries,
/// unrelated files, corrupt records) is skipped with a warning. A
/// missing directory yields an empty list.
pub fn detect_file_conversations(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut conversation_ids = Vec::new();

    for entry in WalkDir::new(path) {
        let entry = entry.map_err(|err| {
            StoreError::Storage(format!("failed to scan conversations directory: {}", err))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if !name.ends_with(".json") || name.ends_with(".tmp") {
            continue;
        }

        let data = match std::fs::read(entry.path()) {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(
                    "failed to read potential conversation file {}: {}",
                    entry.path().display(),
                    err
                );
                continue;
            }
        };

        let record: ConversationRecord = match serde_json::from_slice(&data) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(
                    "failed to parse conversation file {}: {}",
                    entry.path().display(),
                    err
                );
                continue;
            }
        };

        if record.id.is_empty() || record.created_at.timestamp() == 0 {
            tracing::warn!(
                "invalid conversation file structure: {}",
                entry.path().display()
            );
            continue;
        }

        let id = name.strip_suffix(".json").unwrap_or(&name).to_string();
        conversation_ids.push(id);
    }

    Ok(conversation_ids)
}

/// Copy conversation files to a backup directory before migrating
///
/// Preserves paths relative to the source directory. A missing source
/// directory is a no-op.
pub fn backup_file_conversations(source: &Path, backup_path: &Path) -> Result<()> {
    if !source.exists() {
        return Ok(());
    }

    std::fs::create_dir_all(backup_path).map_err(StoreError::Io)?;

    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|err| {
            StoreError::Storage(format!("failed to scan conversations directory: {}", err))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if !name.ends_with(".json") || name.ends_with(".tmp") {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| StoreError::Storage(format!("failed to relativize path: {}", err)))?;
        let target = backup_path.join(relative);

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::Io)?;
        }
        std::fs::copy(entry.path(), &target).map_err(StoreError::Io)?;
    }

    tracing::info!(backup = %backup_path.display(), "backed up conversation files");
    Ok(())
}

/// Migrate every file-store conversation into a database backend
///
/// See the module documentation for the failure model: per-record load
/// failures are counted and skipped, a batch write failure commits
/// nothing and fails the call, and a post-commit validation mismatch
/// fails the call even though the write already landed.
pub fn migrate_file_store(
    source: &Path,
    destination: &MigrationDestination,
    options: &MigrationOptions,
) -> Result<MigrationResult> {
    let start = Instant::now();
    let mut result = MigrationResult::default();

    let conversation_ids = detect_file_conversations(source)?;
    result.total_conversations = conversation_ids.len();

    if conversation_ids.is_empty() {
        tracing::info!("no file-store conversations found to migrate");
        result.duration = start.elapsed();
        return Ok(result);
    }

    if let Some(backup_path) = &options.backup_path {
        backup_file_conversations(source, backup_path)?;
    }

    let file_store = JsonConversationStore::new(source)?;
    let mut loaded = Vec::with_capacity(conversation_ids.len());
    for id in &conversation_ids {
        match file_store.load(id) {
            Ok(record) => loaded.push(record),
            Err(err) => {
                tracing::error!("failed to load conversation {} from file store: {:#}", id, err);
                result.failed_count += 1;
                result.failed_ids.push(id.clone());
            }
        }
    }
    file_store.close()?;

    if loaded.is_empty() {
        result.duration = start.elapsed();
        anyhow::bail!("no conversations could be loaded from the file store");
    }

    if options.dry_run {
        result.migrated_count = loaded.len();
        result.duration = start.elapsed();
        tracing::info!(
            would_migrate = result.migrated_count,
            "dry run complete, destination untouched"
        );
        return Ok(result);
    }

    let target = destination.open()?;

    let outcome = match target.save_batch(&loaded, options.force) {
        Ok(outcome) => outcome,
        Err(err) => {
            // The batch is one transaction: nothing was committed, so
            // every input record is reported failed.
            result.failed_count += loaded.len();
            result
                .failed_ids
                .extend(loaded.iter().map(|record| record.id.clone()));
            return Err(err.context(format!(
                "batch migration failed, no conversations were committed ({} records failed)",
                result.failed_count
            )));
        }
    };

    result.migrated_count = outcome.migrated_ids.len();
    result.skipped_count = outcome.skipped_ids.len();

    let written: HashSet<&String> = outcome.migrated_ids.iter().collect();
    let mut validation_errors = 0;
    for record in loaded.iter().filter(|record| written.contains(&record.id)) {
        match target.load(&record.id) {
            Ok(stored) => {
                if !records_match(record, &stored) {
                    tracing::error!(id = %record.id, "migrated record does not match its source");
                    validation_errors += 1;
                }
            }
            Err(err) => {
                tracing::error!(
                    "migrated conversation {} missing from destination: {:#}",
                    record.id,
                    err
                );
                validation_errors += 1;
            }
        }
    }
    target.close()?;

    if validation_errors > 0 {
        anyhow::bail!(
            "migration validation failed: {} conversations have mismatched data",
            validation_errors
        );
    }

    result.duration = start.elapsed();
    tracing::info!(
        migrated = result.migrated_count,
        skipped = result.skipped_count,
        failed = result.failed_count,
        "migration complete"
    );
    Ok(result)
}

/// Field comparison used by post-migration validation
///
/// Raw messages are compared structurally, so formatting differences
/// between the file store's pretty JSON and the destination's compact
/// form do not count as mismatches.
fn records_match(source: &ConversationRecord, stored: &ConversationRecord) -> bool {
    source.id == stored.id
        && source.summary == stored.summary
        && source.created_at == stored.created_at
        && source.raw_messages == stored.raw_messages
}
