//! Conversation record and query types
//!
//! Defines the durable conversation record, its read-optimized summary
//! projection, and the filtering/sorting/pagination options shared by
//! every storage backend.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token and cost counters accumulated over a conversation
///
/// Counters are additive across turns; costs are computed by the LLM
/// layer and stored here as opaque totals.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_creation_cost: f64,
    pub cache_read_cost: f64,
}

impl Usage {
    /// Total tokens across input, output, and cache accounting
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }

    /// Total cost across all counters
    pub fn total_cost(&self) -> f64 {
        self.input_cost + self.output_cost + self.cache_creation_cost + self.cache_read_cost
    }
}

/// Structured result of a single tool invocation
///
/// Keyed by tool call ID on the conversation record. The metadata payload
/// is tool-specific and stored opaquely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredToolResult {
    pub tool_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Persisted conversation record
///
/// The durable unit of truth for a single conversation. The message
/// payload is the LLM provider's own serialized form and is passed
/// through the storage layer without interpretation.
///
/// # Examples
///
/// ```
/// use convstore::storage::ConversationRecord;
///
/// let record = ConversationRecord::new("");
/// assert!(!record.id.is_empty());
/// assert_eq!(record.raw_messages, serde_json::json!([]));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    /// Unique conversation identifier, immutable once assigned
    pub id: String,

    /// Raw LLM provider messages, stored verbatim
    #[serde(default = "empty_messages")]
    pub raw_messages: Value,

    /// LLM provider for this conversation (e.g. "anthropic")
    #[serde(default)]
    pub model_type: String,

    /// Short human-readable summary, if one has been generated
    #[serde(default)]
    pub summary: String,

    /// Creation timestamp, set once
    pub created_at: DateTime<Utc>,

    /// Refreshed on every save
    pub updated_at: DateTime<Utc>,

    /// Open string-keyed metadata
    #[serde(default)]
    pub metadata: HashMap<String, Value>,

    /// Last-access timestamps for files touched during the conversation
    #[serde(default)]
    pub file_last_access: HashMap<String, DateTime<Utc>>,

    /// Token and cost counters
    #[serde(default)]
    pub usage: Usage,

    /// Tool call ID to structured result
    #[serde(default)]
    pub tool_results: HashMap<String, StructuredToolResult>,
}

fn empty_messages() -> Value {
    Value::Array(Vec::new())
}

impl ConversationRecord {
    /// Create a new conversation record
    ///
    /// Generates a fresh ID when an empty one is provided. Timestamps are
    /// set to the current time and the message payload starts empty.
    pub fn new(id: impl Into<String>) -> Self {
        let mut id = id.into();
        if id.is_empty() {
            id = generate_id();
        }

        let now = Utc::now();
        Self {
            id,
            raw_messages: empty_messages(),
            model_type: String::new(),
            summary: String::new(),
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
            file_last_access: HashMap::new(),
            usage: Usage::default(),
            tool_results: HashMap::new(),
        }
    }

    /// Derive the read-optimized summary projection for this record
    ///
    /// The first message is the first user-authored text block, truncated
    /// to 100 characters. The message count is an approximation (the
    /// number of `"role"` keys in the serialized payload), not an exact
    /// parse.
    pub fn to_summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            message_count: approximate_message_count(&self.raw_messages),
            first_message: first_user_message(&self.raw_messages),
            summary: self.summary.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            usage: self.usage.clone(),
        }
    }
}

/// Read-optimized projection of a conversation record
///
/// Denormalized at save time so listings never deserialize full records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub message_count: usize,
    #[serde(default)]
    pub first_message: String,
    #[serde(default)]
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub usage: Usage,
}

/// Field to sort query results by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortKey {
    #[default]
    CreatedAt,
    UpdatedAt,
    MessageCount,
}

/// Direction to sort query results in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Filtering, sorting, and pagination options for conversation queries
///
/// Date bounds are inclusive. A limit of zero means unbounded.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Case-insensitive substring to search for
    pub search_term: Option<String>,
    pub limit: usize,
    pub offset: usize,
    pub sort_by: SortKey,
    pub sort_order: SortOrder,
}

/// Result of a query operation
///
/// `total` counts every match before pagination was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub summaries: Vec<ConversationSummary>,
    pub total: usize,
    pub options: QueryOptions,
}

/// Generate a unique conversation identifier
///
/// The ID is a UTC timestamp prefix plus 8 random bytes in hex, so IDs
/// sort lexicographically by creation time.
///
/// # Examples
///
/// ```
/// use convstore::storage::generate_id;
///
/// let id = generate_id();
/// assert_eq!(id.len(), "20240708T150405".len() + 1 + 16);
/// ```
pub fn generate_id() -> String {
    let timestamp = Utc::now().format("%Y%m%dT%H%M%S");

    let bytes: [u8; 8] = rand::rng().random();
    let random_hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();

    format!("{}-{}", timestamp, random_hex)
}

/// Extract the first user-authored text block from a raw message payload
///
/// Returns an empty string when the payload has no user text. The result
/// is truncated to 100 characters with a trailing ellipsis.
fn first_user_message(raw: &Value) -> String {
    let Some(messages) = raw.as_array() else {
        return String::new();
    };

    for message in messages {
        if message.get("role").and_then(Value::as_str) != Some("user") {
            continue;
        }
        let text = message
            .get("content")
            .and_then(Value::as_array)
            .and_then(|content| content.first())
            .and_then(|block| block.get("text"))
            .and_then(Value::as_str);
        if let Some(text) = text {
            return truncate_message(text);
        }
    }

    String::new()
}

/// Count `"role"` keys in the serialized payload as a message-count estimate
fn approximate_message_count(raw: &Value) -> usize {
    match raw {
        Value::Array(messages) if messages.is_empty() => 0,
        Value::Null => 0,
        _ => raw.to_string().matches("\"role\"").count(),
    }
}

fn truncate_message(text: &str) -> String {
    if text.chars().count() > 100 {
        let head: String = text.chars().take(97).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generate_id_format() {
        let id = generate_id();
        let (timestamp, random) = id.split_once('-').expect("id has a dash");
        assert_eq!(timestamp.len(), 15);
        assert!(timestamp.contains('T'));
        assert_eq!(random.len(), 16);
        assert!(random.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_id_is_unique() {
        let id1 = generate_id();
        let id2 = generate_id();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_new_record_assigns_id_when_empty() {
        let record = ConversationRecord::new("");
        assert!(!record.id.is_empty());
    }

    #[test]
    fn test_new_record_keeps_provided_id() {
        let record = ConversationRecord::new("my-id");
        assert_eq!(record.id, "my-id");
    }

    #[test]
    fn test_to_summary_extracts_first_user_message() {
        let mut record = ConversationRecord::new("x");
        record.raw_messages = json!([
            {"role": "assistant", "content": [{"type": "text", "text": "welcome"}]},
            {"role": "user", "content": [{"type": "text", "text": "fix the parser"}]},
            {"role": "user", "content": [{"type": "text", "text": "second question"}]}
        ]);

        let summary = record.to_summary();
        assert_eq!(summary.first_message, "fix the parser");
        assert_eq!(summary.message_count, 3);
    }

    #[test]
    fn test_to_summary_truncates_long_first_message() {
        let mut record = ConversationRecord::new("x");
        let long = "a".repeat(150);
        record.raw_messages = json!([
            {"role": "user", "content": [{"type": "text", "text": long}]}
        ]);

        let summary = record.to_summary();
        assert_eq!(summary.first_message.chars().count(), 100);
        assert!(summary.first_message.ends_with("..."));
    }

    #[test]
    fn test_to_summary_truncation_respects_char_boundaries() {
        let mut record = ConversationRecord::new("x");
        let long = "é".repeat(150);
        record.raw_messages = json!([
            {"role": "user", "content": [{"type": "text", "text": long}]}
        ]);

        let summary = record.to_summary();
        assert!(summary.first_message.ends_with("..."));
        assert_eq!(summary.first_message.chars().count(), 100);
    }

    #[test]
    fn test_to_summary_empty_payload() {
        let record = ConversationRecord::new("x");
        let summary = record.to_summary();
        assert_eq!(summary.first_message, "");
        assert_eq!(summary.message_count, 0);
    }

    #[test]
    fn test_to_summary_skips_user_message_without_text() {
        let mut record = ConversationRecord::new("x");
        record.raw_messages = json!([
            {"role": "user", "content": [{"type": "image", "source": "img.png"}]},
            {"role": "user", "content": [{"type": "text", "text": "the real question"}]}
        ]);

        let summary = record.to_summary();
        assert_eq!(summary.first_message, "the real question");
    }

    #[test]
    fn test_usage_totals() {
        let usage = Usage {
            input_tokens: 100,
            output_tokens: 50,
            cache_creation_input_tokens: 20,
            cache_read_input_tokens: 30,
            input_cost: 0.1,
            output_cost: 0.2,
            cache_creation_cost: 0.05,
            cache_read_cost: 0.01,
        };
        assert_eq!(usage.total_tokens(), 200);
        assert!((usage.total_cost() - 0.36).abs() < 1e-9);
    }

    #[test]
    fn test_record_serialization_roundtrip() {
        let mut record = ConversationRecord::new("roundtrip-1");
        record.model_type = "anthropic".to_string();
        record.summary = "a summary".to_string();
        record.raw_messages = json!([{"role": "user", "content": [{"text": "hi"}]}]);
        record
            .metadata
            .insert("branch".to_string(), json!("main"));
        record.tool_results.insert(
            "call_1".to_string(),
            StructuredToolResult {
                tool_name: "terminal".to_string(),
                success: true,
                error: None,
                metadata: Some(json!({"exit_code": 0})),
                timestamp: Utc::now(),
            },
        );

        let encoded = serde_json::to_string(&record).expect("serialize");
        let decoded: ConversationRecord = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_record_uses_camel_case_keys() {
        let record = ConversationRecord::new("camel-1");
        let encoded = serde_json::to_value(&record).expect("serialize");
        assert!(encoded.get("rawMessages").is_some());
        assert!(encoded.get("createdAt").is_some());
        assert!(encoded.get("fileLastAccess").is_some());
    }

    #[test]
    fn test_query_options_defaults() {
        let options = QueryOptions::default();
        assert_eq!(options.sort_by, SortKey::CreatedAt);
        assert_eq!(options.sort_order, SortOrder::Desc);
        assert_eq!(options.limit, 0);
        assert_eq!(options.offset, 0);
        assert!(options.search_term.is_none());
    }

    #[test]
    fn test_sort_key_serde_names() {
        assert_eq!(
            serde_json::to_string(&SortKey::MessageCount).unwrap(),
            "\"messageCount\""
        );
        assert_eq!(serde_json::to_string(&SortOrder::Desc).unwrap(), "\"desc\"");
    }
}
