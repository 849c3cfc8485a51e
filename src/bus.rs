//! Progress bus: in-process publish/subscribe fanning stage updates out to
//! push-channel clients.
//!
//! Built on a broadcast channel: one sender, many receivers, best-effort
//! delivery with drop-on-slow-subscriber semantics (a lagging receiver
//! skips missed events rather than blocking publishers). No persistence,
//! no replay.
//!
//! Channel names:
//!
//! | Channel | Emitted by |
//! |---------|------------|
//! | `sync:<source>:progress` / `:complete` / `:error` | ingestion coordinator |
//! | `embeddings:progress` | embedding pipeline |
//! | `rag:progress` / `rag:complete` / `rag:error` | query pipeline |

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::DocumentSource;

/// Default buffer per subscriber before old events are dropped.
const DEFAULT_CAPACITY: usize = 256;

/// One stage update published on the bus.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    /// Event channel, e.g. `sync:email:progress`.
    pub channel: String,
    /// Sync id or query id the event belongs to.
    pub scope_id: String,
    /// Owning user, used by the push-channel edge to filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl ProgressEvent {
    pub fn new(
        channel: impl Into<String>,
        scope_id: impl Into<String>,
        user_id: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            channel: channel.into(),
            scope_id: scope_id.into(),
            user_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Process-wide fan-out hub. Cheap to clone; all clones share the channel.
#[derive(Clone)]
pub struct ProgressBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers. Publishing with no
    /// subscribers is not an error.
    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    // ---- channel helpers ----

    pub fn sync_progress(
        &self,
        source: DocumentSource,
        sync_id: &str,
        user_id: &str,
        payload: serde_json::Value,
    ) {
        self.publish(ProgressEvent::new(
            format!("sync:{source}:progress"),
            sync_id,
            Some(user_id.to_string()),
            payload,
        ));
    }

    pub fn sync_complete(
        &self,
        source: DocumentSource,
        sync_id: &str,
        user_id: &str,
        payload: serde_json::Value,
    ) {
        self.publish(ProgressEvent::new(
            format!("sync:{source}:complete"),
            sync_id,
            Some(user_id.to_string()),
            payload,
        ));
    }

    pub fn sync_error(
        &self,
        source: DocumentSource,
        sync_id: &str,
        user_id: &str,
        payload: serde_json::Value,
    ) {
        self.publish(ProgressEvent::new(
            format!("sync:{source}:error"),
            sync_id,
            Some(user_id.to_string()),
            payload,
        ));
    }

    pub fn embeddings_progress(&self, scope_id: &str, payload: serde_json::Value) {
        self.publish(ProgressEvent::new(
            "embeddings:progress",
            scope_id,
            None,
            payload,
        ));
    }

    pub fn rag_progress(&self, query_id: &str, user_id: &str, payload: serde_json::Value) {
        self.publish(ProgressEvent::new(
            "rag:progress",
            query_id,
            Some(user_id.to_string()),
            payload,
        ));
    }

    pub fn rag_complete(&self, query_id: &str, user_id: &str, payload: serde_json::Value) {
        self.publish(ProgressEvent::new(
            "rag:complete",
            query_id,
            Some(user_id.to_string()),
            payload,
        ));
    }

    pub fn rag_error(&self, query_id: &str, user_id: &str, payload: serde_json::Value) {
        self.publish(ProgressEvent::new(
            "rag:error",
            query_id,
            Some(user_id.to_string()),
            payload,
        ));
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}
