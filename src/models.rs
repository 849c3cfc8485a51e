//! Core data models used throughout the service.
//!
//! These types represent the documents, sync runs, and conversation turns
//! that flow through the ingestion and retrieval pipeline:
//!
//! ```text
//! Connector → RawRecord → normalize() → Document → embed() → vector
//!                                           ↓
//!                                      search() → SearchHit → rank → context
//! ```
//!
//! Every persisted document is uniquely identified by `document_id`
//! (convention: `<source>_<upstream id>`) and owned by a `user_id`.
//! Timestamps are stored as Unix epoch seconds in SQLite and surface as
//! `DateTime<Utc>` here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RecallError, Result};

/// Upstream system a document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentSource {
    Email,
    Calendar,
    Music,
}

impl DocumentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentSource::Email => "email",
            DocumentSource::Calendar => "calendar",
            DocumentSource::Music => "music",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "email" => Ok(DocumentSource::Email),
            "calendar" => Ok(DocumentSource::Calendar),
            "music" => Ok(DocumentSource::Music),
            other => Err(RecallError::validation(format!("unknown source: {other}"))),
        }
    }
}

impl std::fmt::Display for DocumentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape of the record within its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Message,
    Event,
    Track,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Message => "message",
            DocumentType::Event => "event",
            DocumentType::Track => "track",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "message" => Ok(DocumentType::Message),
            "event" => Ok(DocumentType::Event),
            "track" => Ok(DocumentType::Track),
            other => Err(RecallError::validation(format!(
                "unknown document type: {other}"
            ))),
        }
    }
}

/// Content longer than this is truncated with a marker during normalization.
pub const MAX_CONTENT_CHARS: usize = 32_000;

/// Marker appended when content is truncated.
pub const TRUNCATION_MARKER: &str = "\n[content truncated]";

/// One normalized record in the `documents` table.
///
/// `needs_embedding` is the authoritative flag: true iff `content` is
/// non-empty and a vector of the configured dimensionality has not yet
/// been produced (or has been invalidated by [`crate::store::DocumentStore::mark_for_reembedding`]).
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    /// Globally unique id, `<source>_<upstream id>`.
    pub document_id: String,
    /// Owning principal. Every query against the store is scoped by this.
    pub user_id: String,
    pub source: DocumentSource,
    pub doc_type: DocumentType,
    pub title: Option<String>,
    pub author: Option<String>,
    /// Cleaned plain text, at most [`MAX_CONTENT_CHARS`] characters.
    pub content: String,
    /// SHA-256 of `content`, kept for staleness diagnostics.
    pub content_hash: String,
    /// Instant the upstream record was created.
    pub timestamp: DateTime<Utc>,
    /// Source-specific structured blob (recipients, labels, attendees, ...).
    pub metadata: serde_json::Value,
    pub embedding: Option<Vec<f32>>,
    pub needs_embedding: bool,
    pub embedding_model: Option<String>,
    pub embedding_tokens: Option<i64>,
    pub embedding_generated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Build a new document ready for first insertion. Content is truncated
    /// to the bound and the staleness hash is computed here.
    pub fn new(
        document_id: impl Into<String>,
        user_id: impl Into<String>,
        source: DocumentSource,
        doc_type: DocumentType,
        content: String,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let content = truncate_content(content);
        let now = Utc::now();
        Self {
            document_id: document_id.into(),
            user_id: user_id.into(),
            source,
            doc_type,
            title: None,
            author: None,
            content_hash: content_hash(&content),
            needs_embedding: !content.is_empty(),
            content,
            timestamp,
            metadata: serde_json::Value::Object(Default::default()),
            embedding: None,
            embedding_model: None,
            embedding_tokens: None,
            embedding_generated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Truncate to [`MAX_CONTENT_CHARS`] characters, appending the marker.
pub fn truncate_content(content: String) -> String {
    if content.chars().count() <= MAX_CONTENT_CHARS {
        return content;
    }
    let mut truncated: String = content.chars().take(MAX_CONTENT_CHARS).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

/// SHA-256 hex digest of document content.
pub fn content_hash(content: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Outcome of [`crate::store::DocumentStore::create_document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same `document_id` already exists. Not an error;
    /// ingestion counts these as skips.
    Duplicate,
}

/// Status of one ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    InProgress,
    Success,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::InProgress => "in_progress",
            SyncStatus::Success => "success",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(SyncStatus::InProgress),
            "success" => Ok(SyncStatus::Success),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(RecallError::validation(format!(
                "unknown sync status: {other}"
            ))),
        }
    }

    /// Terminal rows are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncStatus::Success | SyncStatus::Failed)
    }
}

/// One row per ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncLog {
    pub id: String,
    pub user_id: String,
    pub source: DocumentSource,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub documents_fetched: i64,
    pub documents_stored: i64,
    /// Cursor for the next incremental run; set on success.
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Audit row for one embedding run.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingCost {
    pub batch_id: String,
    pub model: String,
    pub document_count: i64,
    pub total_tokens: i64,
    pub estimated_cost: f64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// One user query / model answer pair within a conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub query: String,
    pub answer: String,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Inclusive-start, exclusive-end time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Filters applied to store search primitives. Every predicate is appended
/// to the SQL as a bind parameter.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<DocumentSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_type: Option<DocumentType>,
    /// Substring match on the author column.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
}

/// One hit returned by the store's search primitives.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub document_id: String,
    pub source: DocumentSource,
    pub doc_type: DocumentType,
    pub title: Option<String>,
    pub author: Option<String>,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
    /// Cosine similarity in `[-1, 1]`, rounded to 4 decimals upstream.
    pub similarity: f64,
    /// Lexical boost contributed by hybrid search (0 for plain search).
    pub keyword_boost: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_round_trips() {
        for source in [
            DocumentSource::Email,
            DocumentSource::Calendar,
            DocumentSource::Music,
        ] {
            assert_eq!(DocumentSource::parse(source.as_str()).unwrap(), source);
        }
        assert!(DocumentSource::parse("carrier-pigeon").is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!SyncStatus::InProgress.is_terminal());
        assert!(SyncStatus::Success.is_terminal());
        assert!(SyncStatus::Failed.is_terminal());
    }

    #[test]
    fn new_document_flags_embedding_need() {
        let doc = Document::new(
            "email_m1",
            "u1",
            DocumentSource::Email,
            DocumentType::Message,
            "hello".to_string(),
            Utc::now(),
        );
        assert!(doc.needs_embedding);
        assert_eq!(doc.content_hash, content_hash("hello"));

        let empty = Document::new(
            "email_m2",
            "u1",
            DocumentSource::Email,
            DocumentType::Message,
            String::new(),
            Utc::now(),
        );
        assert!(!empty.needs_embedding);
    }

    #[test]
    fn long_content_is_truncated_with_marker() {
        let long = "x".repeat(MAX_CONTENT_CHARS + 500);
        let doc = Document::new(
            "email_m3",
            "u1",
            DocumentSource::Email,
            DocumentType::Message,
            long,
            Utc::now(),
        );
        assert!(doc.content.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            doc.content.chars().count(),
            MAX_CONTENT_CHARS + TRUNCATION_MARKER.chars().count()
        );
    }

    #[test]
    fn short_content_is_untouched() {
        assert_eq!(truncate_content("short".into()), "short");
    }
}
