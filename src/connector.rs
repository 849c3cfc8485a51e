//! Source connector contract and registry.
//!
//! A connector authenticates against an upstream system, fetches raw
//! records since a cursor, and normalizes them into the unified
//! [`Document`] schema. The ingestion coordinator holds a registry of
//! connectors keyed by source and dispatches through the trait.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{Document, DocumentSource};

/// Raw item produced by a connector before normalization.
#[derive(Debug, Clone)]
pub struct RawRecord {
    /// Identifier within the upstream source.
    pub id: String,
    /// Instant the upstream record was created.
    pub timestamp: DateTime<Utc>,
    /// Connector-specific payload, passed to `normalize`.
    pub payload: serde_json::Value,
}

/// Options for a full fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Only records created on or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Stop after this many records.
    pub limit: Option<usize>,
}

/// A data source that produces documents for ingestion.
///
/// Implementations may perform network I/O in every method except
/// `normalize`, which is pure so failures stay attributable to a single
/// record.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// The source this connector serves.
    fn source(&self) -> DocumentSource;

    /// Verify that usable credentials exist for the user.
    async fn authenticate(&self, user_id: &str) -> Result<()>;

    /// Fetch all records matching `options`.
    async fn fetch_all(&self, user_id: &str, options: &FetchOptions) -> Result<Vec<RawRecord>>;

    /// Fetch records created after `since` (incremental mode).
    async fn fetch_new(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<RawRecord>>;

    /// Normalize a raw record into a [`Document`]. Returns `Ok(None)` when
    /// the record has no usable content after cleanup; such records are
    /// dropped with a warning, not persisted.
    fn normalize(&self, user_id: &str, raw: &RawRecord) -> Result<Option<Document>>;

    /// Cheap upstream reachability/credential check.
    async fn validate_connection(&self, user_id: &str) -> Result<bool>;
}

/// Connectors keyed by source name.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<DocumentSource, Arc<dyn SourceConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, connector: Arc<dyn SourceConnector>) {
        self.connectors.insert(connector.source(), connector);
    }

    pub fn get(&self, source: DocumentSource) -> Option<Arc<dyn SourceConnector>> {
        self.connectors.get(&source).cloned()
    }

    pub fn sources(&self) -> Vec<DocumentSource> {
        let mut sources: Vec<_> = self.connectors.keys().copied().collect();
        sources.sort_by_key(|s| s.as_str());
        sources
    }
}
