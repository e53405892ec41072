//! Convstore - conversation persistence for AI agent CLIs
//!
//! This library persists structured conversation records (chat histories,
//! token-usage accounting, and tool-execution results) behind a single
//! storage contract with three interchangeable backends.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `storage`: the [`storage::ConversationStore`] contract, the sled,
//!   SQLite, and JSON-file backends, and the migration utility
//! - `config`: backend selection and base-path configuration
//! - `error`: error types and result aliases
//!
//! # Example
//!
//! ```no_run
//! use convstore::config::StorageConfig;
//! use convstore::storage::{new_conversation_store, ConversationRecord, ConversationStore};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = StorageConfig::from_env()?;
//!     let store = new_conversation_store(&config)?;
//!
//!     let mut record = ConversationRecord::new("");
//!     store.save(&mut record)?;
//!
//!     for summary in store.list()? {
//!         println!("{}: {}", summary.id, summary.first_message);
//!     }
//!
//!     store.close()?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod storage;

// Re-export commonly used types
pub use config::{StorageBackend, StorageConfig};
pub use error::{is_not_found, Result, StoreError};
pub use storage::{
    new_conversation_store, ConversationRecord, ConversationStore, ConversationSummary,
    QueryOptions, QueryResult, SortKey, SortOrder,
};
