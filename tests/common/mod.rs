use serde_json::json;
use tempfile::TempDir;

use convstore::config::{StorageBackend, StorageConfig};
use convstore::storage::{new_conversation_store, ConversationRecord, ConversationStore};

/// Install a test subscriber so store logs show up under --nocapture
///
/// Safe to call from every test; only the first call installs.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Build a conversation record with a single user message
#[allow(dead_code)]
pub fn sample_record(id: &str, text: &str) -> ConversationRecord {
    let mut record = ConversationRecord::new(id);
    record.raw_messages = json!([
        {"role": "user", "content": [{"type": "text", "text": text}]}
    ]);
    record
}

/// Create one store per backend, each rooted in its own scratch directory
///
/// Returns the TempDir alongside the stores so the caller keeps the
/// directories alive for the duration of the test.
#[allow(dead_code)]
pub fn create_all_backends() -> (Vec<(&'static str, Box<dyn ConversationStore>)>, TempDir) {
    init_tracing();
    let dir = TempDir::new().expect("failed to create tempdir");

    let backends = [
        ("sled", StorageBackend::Sled),
        ("sqlite", StorageBackend::Sqlite),
        ("json", StorageBackend::Json),
    ];

    let stores = backends
        .into_iter()
        .map(|(name, backend)| {
            let config = StorageConfig {
                backend,
                base_path: dir.path().join(name),
            };
            let store = new_conversation_store(&config).expect("failed to create store");
            (name, store)
        })
        .collect();

    (stores, dir)
}
