//! JSON file backend for conversation storage
//!
//! One `<id>.json` file per conversation under a base directory, with
//! writes made atomic by writing to a temporary file and renaming over
//! the target. Two in-memory maps (full records and summaries) behind a
//! single reader/writer lock serve all reads; they are filled by a
//! directory walk at construction and kept current by a background
//! thread consuming filesystem change notifications. Changes made by
//! other processes become visible when their notifications arrive, so a
//! short detection lag is expected; changes made through this store are
//! applied to the cache synchronously.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::{Result, StoreError};
use crate::storage::types::{
    ConversationRecord, ConversationSummary, QueryOptions, QueryResult,
};
use crate::storage::{apply_sort, paginate, ConversationStore};

#[derive(Default)]
struct Caches {
    records: HashMap<String, ConversationRecord>,
    summaries: HashMap<String, ConversationSummary>,
}

/// Conversation store backed by one JSON file per record
///
/// Reads are served from an in-memory cache; the filesystem is the
/// source of truth and a notify watcher keeps the cache current.
pub struct JsonConversationStore {
    base_path: PathBuf,
    caches: Arc<RwLock<Caches>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    watcher_thread: Mutex<Option<JoinHandle<()>>>,
}

impl JsonConversationStore {
    /// Create a JSON file-based conversation store with file watching
    ///
    /// Creates the directory if needed, loads every existing
    /// conversation file into the cache, and starts the watcher thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the
    /// filesystem watcher cannot be started.
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path).map_err(StoreError::Io)?;

        let caches = Arc::new(RwLock::new(Caches::default()));
        load_all_conversations(&base_path, &caches)?;

        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();
        let mut watcher = notify::recommended_watcher(tx)
            .map_err(|err| StoreError::Storage(format!("failed to create file watcher: {}", err)))?;
        watcher
            .watch(&base_path, RecursiveMode::NonRecursive)
            .map_err(|err| StoreError::Storage(format!("failed to watch directory: {}", err)))?;

        let thread_caches = Arc::clone(&caches);
        let watcher_thread = std::thread::spawn(move || watch_file_changes(rx, thread_caches));

        Ok(Self {
            base_path,
            caches,
            watcher: Mutex::new(Some(watcher)),
            watcher_thread: Mutex::new(Some(watcher_thread)),
        })
    }

    fn file_path(&self, id: &str) -> PathBuf {
        self.base_path.join(format!("{}.json", id))
    }

    fn read_record_from_disk(&self, id: &str) -> Result<ConversationRecord> {
        let path = self.file_path(id);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()).into());
            }
            Err(err) => return Err(StoreError::Io(err).into()),
        };

        let record = serde_json::from_slice(&data).map_err(StoreError::Serialization)?;
        Ok(record)
    }
}

/// Walk the directory and load every conversation file into the cache
fn load_all_conversations(base_path: &Path, caches: &Arc<RwLock<Caches>>) -> Result<()> {
    let mut guard = caches
        .write()
        .map_err(|_| StoreError::Storage("cache lock poisoned".to_string()))?;

    guard.records.clear();
    guard.summaries.clear();

    let entries = std::fs::read_dir(base_path).map_err(StoreError::Io)?;
    for entry in entries {
        let entry = entry.map_err(StoreError::Io)?;
        let path = entry.path();
        if !is_conversation_file(&path) {
            continue;
        }

        if let Err(err) = load_file_into_caches(&path, &mut guard) {
            tracing::warn!("failed to load conversation into cache from {}: {:#}", path.display(), err);
        }
    }

    tracing::debug!(count = guard.summaries.len(), "loaded conversations into cache");
    Ok(())
}

fn load_file_into_caches(path: &Path, caches: &mut Caches) -> Result<()> {
    let data = std::fs::read(path).map_err(StoreError::Io)?;
    let record: ConversationRecord =
        serde_json::from_slice(&data).map_err(StoreError::Serialization)?;

    caches.summaries.insert(record.id.clone(), record.to_summary());
    caches.records.insert(record.id.clone(), record);
    Ok(())
}

/// True for `<id>.json` files, ignoring temporaries from atomic writes
fn is_conversation_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.ends_with(".json") && !name.ends_with(".tmp")
}

fn conversation_id_from_path(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(".json").map(str::to_string)
}

/// Consume watcher events until the event channel closes
///
/// Create and modify events reload the affected file; remove events
/// evict it. The channel closes when the watcher is dropped in `close`.
fn watch_file_changes(rx: mpsc::Receiver<notify::Result<Event>>, caches: Arc<RwLock<Caches>>) {
    while let Ok(event) = rx.recv() {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                tracing::error!("file watcher error: {}", err);
                continue;
            }
        };

        for path in &event.paths {
            if !is_conversation_file(path) {
                continue;
            }
            let Some(id) = conversation_id_from_path(path) else {
                continue;
            };

            match event.kind {
                EventKind::Create(_) | EventKind::Modify(_) => {
                    let Ok(mut guard) = caches.write() else { return };
                    match load_file_into_caches(path, &mut guard) {
                        Ok(()) => tracing::debug!(id = %id, "refreshed conversation in cache"),
                        Err(err) => tracing::warn!(
                            "failed to reload conversation {} into cache: {:#}",
                            id,
                            err
                        ),
                    }
                }
                EventKind::Remove(_) => {
                    let Ok(mut guard) = caches.write() else { return };
                    guard.records.remove(&id);
                    guard.summaries.remove(&id);
                    tracing::debug!(id = %id, "evicted conversation from cache");
                }
                _ => {}
            }
        }
    }
}

impl ConversationStore for JsonConversationStore {
    /// Write the record atomically and update the cache synchronously
    ///
    /// The synchronous cache update means an immediately following load
    /// or query from this process sees the change without waiting for
    /// the watcher to deliver the corresponding event.
    fn save(&self, record: &mut ConversationRecord) -> Result<()> {
        if record.id.is_empty() {
            record.id = crate::storage::types::generate_id();
        }
        record.updated_at = chrono::Utc::now();

        let data = serde_json::to_vec_pretty(&*record).map_err(StoreError::Serialization)?;

        let file_path = self.file_path(&record.id);
        let temp_path = self.base_path.join(format!("{}.json.tmp", record.id));

        std::fs::write(&temp_path, &data).map_err(StoreError::Io)?;
        if let Err(err) = std::fs::rename(&temp_path, &file_path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(StoreError::Io(err).into());
        }

        let mut guard = self
            .caches
            .write()
            .map_err(|_| StoreError::Storage("cache lock poisoned".to_string()))?;
        guard.summaries.insert(record.id.clone(), record.to_summary());
        guard.records.insert(record.id.clone(), record.clone());

        Ok(())
    }

    /// Load from cache, falling back to disk on a miss
    fn load(&self, id: &str) -> Result<ConversationRecord> {
        {
            let guard = self
                .caches
                .read()
                .map_err(|_| StoreError::Storage("cache lock poisoned".to_string()))?;
            if let Some(record) = guard.records.get(id) {
                return Ok(record.clone());
            }
        }

        let record = self.read_record_from_disk(id)?;

        let mut guard = self
            .caches
            .write()
            .map_err(|_| StoreError::Storage("cache lock poisoned".to_string()))?;
        guard.summaries.insert(record.id.clone(), record.to_summary());
        guard.records.insert(record.id.clone(), record.clone());

        Ok(record)
    }

    /// Delete the conversation file and evict it from the cache
    ///
    /// Unlike the database backends, deleting an unknown ID reports
    /// not-found: the file's absence is indistinguishable from a bad ID.
    fn delete(&self, id: &str) -> Result<()> {
        match std::fs::remove_file(self.file_path(id)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()).into());
            }
            Err(err) => return Err(StoreError::Io(err).into()),
        }

        let mut guard = self
            .caches
            .write()
            .map_err(|_| StoreError::Storage("cache lock poisoned".to_string()))?;
        guard.records.remove(id);
        guard.summaries.remove(id);

        Ok(())
    }

    /// Query the in-memory summary cache
    ///
    /// Date filtering applies to `updated_at` on this backend. Search
    /// checks the summary text, then the first message, and finally
    /// falls back to a case-insensitive scan of the raw message payload
    /// (cached record or direct file read), giving this backend broader
    /// search recall than the sled backend's index-only search.
    fn query(&self, options: QueryOptions) -> Result<QueryResult> {
        let guard = self
            .caches
            .read()
            .map_err(|_| StoreError::Storage("cache lock poisoned".to_string()))?;

        let term_lower = options
            .search_term
            .as_deref()
            .filter(|term| !term.is_empty())
            .map(str::to_lowercase);

        let mut summaries: Vec<ConversationSummary> = Vec::new();
        for summary in guard.summaries.values() {
            if let Some(start) = options.start_date {
                if summary.updated_at < start {
                    continue;
                }
            }
            if let Some(end) = options.end_date {
                if summary.updated_at > end {
                    continue;
                }
            }

            if let Some(term) = term_lower.as_deref() {
                let mut found = summary.summary.to_lowercase().contains(term)
                    || summary.first_message.to_lowercase().contains(term);

                if !found {
                    found = match guard.records.get(&summary.id) {
                        Some(record) => {
                            record.raw_messages.to_string().to_lowercase().contains(term)
                        }
                        None => self
                            .read_record_from_disk(&summary.id)
                            .map(|record| {
                                record.raw_messages.to_string().to_lowercase().contains(term)
                            })
                            .unwrap_or(false),
                    };
                }

                if !found {
                    continue;
                }
            }

            summaries.push(summary.clone());
        }
        drop(guard);

        apply_sort(&mut summaries, options.sort_by, options.sort_order);

        let total = summaries.len();
        let summaries = paginate(summaries, options.limit, options.offset);

        Ok(QueryResult {
            summaries,
            total,
            options,
        })
    }

    /// Stop the watcher and wait for its thread to exit
    ///
    /// Dropping the watcher closes the event channel, which ends the
    /// background thread; this joins it so no work continues after
    /// return. Safe to call more than once.
    fn close(&self) -> Result<()> {
        if let Ok(mut watcher) = self.watcher.lock() {
            watcher.take();
        }

        let handle = self
            .watcher_thread
            .lock()
            .map_err(|_| StoreError::Storage("watcher thread lock poisoned".to_string()))?
            .take();

        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| StoreError::Storage("watcher thread panicked".to_string()))?;
        }

        Ok(())
    }
}
