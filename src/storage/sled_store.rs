//! Embedded key-value backend for conversation storage
//!
//! Stores conversations in a single sled database with three trees:
//!
//! - `conversations`: full record keyed by ID
//! - `summaries`: denormalized summary keyed by `conv:<id>`
//! - `search_index`: raw first-message and summary text keyed by
//!   `msg:<id>` and `sum:<id>`, scanned linearly for substring search
//!
//! No database handle is held between operations. Every call opens the
//! database, runs one transaction, flushes, and closes, so separate
//! short-lived processes can share the same database file. Lock
//! contention on open is retried up to a fixed deadline and then
//! surfaces as an error.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use sled::transaction::TransactionError;
use sled::{Transactional, Tree};

use crate::error::{Result, StoreError};
use crate::storage::types::{
    ConversationRecord, ConversationSummary, QueryOptions, QueryResult,
};
use crate::storage::{apply_sort, paginate, ConversationStore};

const TREE_CONVERSATIONS: &str = "conversations";
const TREE_SUMMARIES: &str = "summaries";
const TREE_SEARCH_INDEX: &str = "search_index";

const SUMMARY_PREFIX: &str = "conv:";
const MESSAGE_PREFIX: &str = "msg:";
const SUMMARY_TEXT_PREFIX: &str = "sum:";

/// How long to retry acquiring the database lock before giving up
const LOCK_TIMEOUT: Duration = Duration::from_secs(2);
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Conversation store backed by an embedded sled database
///
/// Uses operation-scoped database access for multi-process safety: the
/// database is opened and closed around every call, keeping the lock
/// window as short as one transaction.
pub struct SledConversationStore {
    db_path: PathBuf,
}

impl SledConversationStore {
    /// Create a sled-based conversation store
    ///
    /// Creates the parent directory if needed and opens the database
    /// once to materialize the trees.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the
    /// database cannot be opened within the lock timeout.
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::Io)?;
        }

        let store = Self { db_path };

        store.with_db(|db| {
            open_trees(db)?;
            Ok(())
        })?;

        Ok(store)
    }

    /// Execute an operation against a temporarily opened database
    ///
    /// Retries the open while another process holds the lock, up to the
    /// lock timeout. The database is flushed and dropped after the
    /// operation so no lock outlives the call.
    fn with_db<T>(&self, operation: impl FnOnce(&sled::Db) -> Result<T>) -> Result<T> {
        let deadline = Instant::now() + LOCK_TIMEOUT;

        let db = loop {
            match sled::Config::new().path(&self.db_path).open() {
                Ok(db) => break db,
                Err(err) => {
                    if Instant::now() >= deadline {
                        return Err(StoreError::Storage(format!(
                            "failed to open database: {}",
                            err
                        ))
                        .into());
                    }
                    std::thread::sleep(LOCK_RETRY_DELAY);
                }
            }
        };

        let result = operation(&db)?;

        db.flush()
            .map_err(|err| StoreError::Storage(format!("failed to flush database: {}", err)))?;

        Ok(result)
    }
}

fn open_trees(db: &sled::Db) -> Result<(Tree, Tree, Tree)> {
    let conversations = db
        .open_tree(TREE_CONVERSATIONS)
        .map_err(|err| StoreError::Storage(format!("failed to open conversations tree: {}", err)))?;
    let summaries = db
        .open_tree(TREE_SUMMARIES)
        .map_err(|err| StoreError::Storage(format!("failed to open summaries tree: {}", err)))?;
    let search_index = db
        .open_tree(TREE_SEARCH_INDEX)
        .map_err(|err| StoreError::Storage(format!("failed to open search index tree: {}", err)))?;
    Ok((conversations, summaries, search_index))
}

impl ConversationStore for SledConversationStore {
    /// Save the record, its summary, and its search-index entries in one
    /// transaction; any failure aborts all three trees together.
    fn save(&self, record: &mut ConversationRecord) -> Result<()> {
        record.updated_at = chrono::Utc::now();

        let summary = record.to_summary();
        let record_data = serde_json::to_vec(&*record).map_err(StoreError::Serialization)?;
        let summary_data = serde_json::to_vec(&summary).map_err(StoreError::Serialization)?;

        let summary_key = format!("{}{}", SUMMARY_PREFIX, record.id);
        let message_key = format!("{}{}", MESSAGE_PREFIX, record.id);
        let summary_text_key = format!("{}{}", SUMMARY_TEXT_PREFIX, record.id);

        self.with_db(|db| {
            let (conversations, summaries, search_index) = open_trees(db)?;

            (&conversations, &summaries, &search_index)
                .transaction(|(conv, sums, index)| {
                    conv.insert(record.id.as_bytes(), record_data.as_slice())?;
                    sums.insert(summary_key.as_bytes(), summary_data.as_slice())?;
                    index.insert(message_key.as_bytes(), summary.first_message.as_bytes())?;
                    index.insert(summary_text_key.as_bytes(), summary.summary.as_bytes())?;
                    Ok(())
                })
                .map_err(|err: TransactionError<()>| match err {
                    TransactionError::Abort(()) => {
                        StoreError::Storage("save transaction aborted".to_string())
                    }
                    TransactionError::Storage(e) => {
                        StoreError::Storage(format!("failed to save conversation: {}", e))
                    }
                })?;

            Ok(())
        })
    }

    fn load(&self, id: &str) -> Result<ConversationRecord> {
        self.with_db(|db| {
            let (conversations, _, _) = open_trees(db)?;

            let data = conversations
                .get(id.as_bytes())
                .map_err(|err| StoreError::Storage(format!("failed to read conversation: {}", err)))?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

            let record = serde_json::from_slice(&data).map_err(StoreError::Serialization)?;
            Ok(record)
        })
    }

    /// Remove the conversation from all three trees in one transaction
    ///
    /// Removing an absent key is a no-op, so deleting an unknown ID does
    /// not error.
    fn delete(&self, id: &str) -> Result<()> {
        let summary_key = format!("{}{}", SUMMARY_PREFIX, id);
        let message_key = format!("{}{}", MESSAGE_PREFIX, id);
        let summary_text_key = format!("{}{}", SUMMARY_TEXT_PREFIX, id);

        self.with_db(|db| {
            let (conversations, summaries, search_index) = open_trees(db)?;

            (&conversations, &summaries, &search_index)
                .transaction(|(conv, sums, index)| {
                    conv.remove(id.as_bytes())?;
                    sums.remove(summary_key.as_bytes())?;
                    index.remove(message_key.as_bytes())?;
                    index.remove(summary_text_key.as_bytes())?;
                    Ok(())
                })
                .map_err(|err: TransactionError<()>| match err {
                    TransactionError::Abort(()) => {
                        StoreError::Storage("delete transaction aborted".to_string())
                    }
                    TransactionError::Storage(e) => {
                        StoreError::Storage(format!("failed to delete conversation: {}", e))
                    }
                })?;

            Ok(())
        })
    }

    /// Query over the denormalized trees
    ///
    /// Without a search term this scans the summary tree. With one, it
    /// scans the search index under both prefixes and matches
    /// case-insensitively; only the indexed first-message and summary
    /// text are searched, not the raw message payload. Date filtering
    /// applies to `created_at`. Entries that fail to deserialize are
    /// skipped.
    fn query(&self, options: QueryOptions) -> Result<QueryResult> {
        let mut summaries = self.with_db(|db| {
            let (_, summaries_tree, search_index) = open_trees(db)?;

            match options.search_term.as_deref() {
                Some(term) if !term.is_empty() => {
                    let ids = search_conversations(&search_index, term)?;
                    summaries_by_ids(&summaries_tree, &ids)
                }
                _ => all_summaries(&summaries_tree),
            }
        })?;

        if options.start_date.is_some() || options.end_date.is_some() {
            summaries.retain(|summary| {
                if let Some(start) = options.start_date {
                    if summary.created_at < start {
                        return false;
                    }
                }
                if let Some(end) = options.end_date {
                    if summary.created_at > end {
                        return false;
                    }
                }
                true
            });
        }

        apply_sort(&mut summaries, options.sort_by, options.sort_order);

        let total = summaries.len();
        let summaries = paginate(summaries, options.limit, options.offset);

        Ok(QueryResult {
            summaries,
            total,
            options,
        })
    }

    /// No persistent connection exists with operation-scoped access
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl crate::storage::migrate::MigrationTarget for SledConversationStore {
    /// Write a whole migration batch inside one multi-tree transaction
    ///
    /// Unless forced, IDs already present in the conversations tree are
    /// skipped. A failure aborts the transaction, leaving the database
    /// exactly as it was.
    fn save_batch(
        &self,
        records: &[ConversationRecord],
        force: bool,
    ) -> Result<crate::storage::migrate::BatchOutcome> {
        struct Prepared {
            id: String,
            summary_key: String,
            message_key: String,
            summary_text_key: String,
            record_data: Vec<u8>,
            summary_data: Vec<u8>,
            first_message: String,
            summary_text: String,
        }

        let mut prepared = Vec::with_capacity(records.len());
        for record in records {
            let summary = record.to_summary();
            prepared.push(Prepared {
                id: record.id.clone(),
                summary_key: format!("{}{}", SUMMARY_PREFIX, record.id),
                message_key: format!("{}{}", MESSAGE_PREFIX, record.id),
                summary_text_key: format!("{}{}", SUMMARY_TEXT_PREFIX, record.id),
                record_data: serde_json::to_vec(record).map_err(StoreError::Serialization)?,
                summary_data: serde_json::to_vec(&summary).map_err(StoreError::Serialization)?,
                first_message: summary.first_message,
                summary_text: summary.summary,
            });
        }

        self.with_db(|db| {
            let (conversations, summaries, search_index) = open_trees(db)?;

            let skipped_ids = (&conversations, &summaries, &search_index)
                .transaction(|(conv, sums, index)| {
                    let mut skipped = Vec::new();
                    for entry in &prepared {
                        if !force && conv.get(entry.id.as_bytes())?.is_some() {
                            skipped.push(entry.id.clone());
                            continue;
                        }
                        conv.insert(entry.id.as_bytes(), entry.record_data.as_slice())?;
                        sums.insert(entry.summary_key.as_bytes(), entry.summary_data.as_slice())?;
                        index.insert(entry.message_key.as_bytes(), entry.first_message.as_bytes())?;
                        index.insert(
                            entry.summary_text_key.as_bytes(),
                            entry.summary_text.as_bytes(),
                        )?;
                    }
                    Ok(skipped)
                })
                .map_err(|err: TransactionError<()>| match err {
                    TransactionError::Abort(()) => {
                        StoreError::Storage("batch transaction aborted".to_string())
                    }
                    TransactionError::Storage(e) => {
                        StoreError::Storage(format!("failed to write migration batch: {}", e))
                    }
                })?;

            let skipped: std::collections::HashSet<&String> = skipped_ids.iter().collect();
            let migrated_ids = prepared
                .iter()
                .map(|entry| entry.id.clone())
                .filter(|id| !skipped.contains(id))
                .collect();

            Ok(crate::storage::migrate::BatchOutcome {
                migrated_ids,
                skipped_ids,
            })
        })
    }
}

fn all_summaries(summaries_tree: &Tree) -> Result<Vec<ConversationSummary>> {
    let mut summaries = Vec::new();

    for entry in summaries_tree.scan_prefix(SUMMARY_PREFIX.as_bytes()) {
        let (_, value) = entry
            .map_err(|err| StoreError::Storage(format!("failed to scan summaries: {}", err)))?;

        // Skip corrupted entries
        if let Ok(summary) = serde_json::from_slice::<ConversationSummary>(&value) {
            summaries.push(summary);
        }
    }

    Ok(summaries)
}

/// Scan the search index for IDs whose indexed text contains the term
///
/// First-message matches are collected before summary matches; each ID
/// appears once, in first-seen order.
fn search_conversations(search_index: &Tree, term: &str) -> Result<Vec<String>> {
    let term_lower = term.to_lowercase();
    let mut matching_ids = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for prefix in [MESSAGE_PREFIX, SUMMARY_TEXT_PREFIX] {
        for entry in search_index.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry
                .map_err(|err| StoreError::Storage(format!("failed to scan search index: {}", err)))?;

            let text = String::from_utf8_lossy(&value);
            if !text.to_lowercase().contains(&term_lower) {
                continue;
            }

            let id = String::from_utf8_lossy(&key[prefix.len()..]).to_string();
            if seen.insert(id.clone()) {
                matching_ids.push(id);
            }
        }
    }

    Ok(matching_ids)
}

fn summaries_by_ids(summaries_tree: &Tree, ids: &[String]) -> Result<Vec<ConversationSummary>> {
    let mut summaries = Vec::new();

    for id in ids {
        let key = format!("{}{}", SUMMARY_PREFIX, id);
        let value = summaries_tree
            .get(key.as_bytes())
            .map_err(|err| StoreError::Storage(format!("failed to read summary: {}", err)))?;

        if let Some(value) = value {
            if let Ok(summary) = serde_json::from_slice::<ConversationSummary>(&value) {
                summaries.push(summary);
            }
        }
    }

    Ok(summaries)
}
