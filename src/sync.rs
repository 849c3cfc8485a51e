//! Ingestion coordinator.
//!
//! Orchestrates full and incremental syncs for a `(user, source)` pair.
//! `start_sync` creates an in-progress sync log, spawns the work on a
//! background task, and returns the sync id immediately. The run itself is
//! a linear state machine:
//!
//! ```text
//! fetching → normalizing → storing → embedding_start → embedding → complete
//! ```
//!
//! Any state may transition to `failed`; partial progress is preserved
//! (documents already inserted remain, and re-runs are idempotent via
//! `document_id`). Progress is published at every phase boundary and every
//! ten documents within the storing phase.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::ProgressBus;
use crate::connector::{ConnectorRegistry, FetchOptions, SourceConnector};
use crate::embed_pipeline::EmbeddingPipeline;
use crate::error::{RecallError, Result};
use crate::models::{DocumentSource, InsertOutcome, SyncStatus};
use crate::store::DocumentStore;

/// Full re-ingest or resume from the last successful cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Incremental,
}

/// Counters reported in progress events and the final sync log.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncCounts {
    pub fetched: u64,
    pub added: u64,
    pub skipped: u64,
    pub failed: u64,
    pub dropped: u64,
}

impl SyncCounts {
    fn payload(&self) -> serde_json::Value {
        json!({
            "fetched": self.fetched,
            "added": self.added,
            "skipped": self.skipped,
            "failed": self.failed,
            "dropped": self.dropped,
        })
    }
}

pub struct SyncCoordinator {
    store: DocumentStore,
    connectors: ConnectorRegistry,
    pipeline: Arc<EmbeddingPipeline>,
    bus: ProgressBus,
}

impl SyncCoordinator {
    pub fn new(
        store: DocumentStore,
        connectors: ConnectorRegistry,
        pipeline: Arc<EmbeddingPipeline>,
        bus: ProgressBus,
    ) -> Self {
        Self {
            store,
            connectors,
            pipeline,
            bus,
        }
    }

    pub fn connectors(&self) -> &ConnectorRegistry {
        &self.connectors
    }

    /// Begin a sync and return its id. The work runs on a spawned task;
    /// callers watch progress on the bus or poll the sync log.
    pub async fn start_sync(
        self: &Arc<Self>,
        user_id: &str,
        source: DocumentSource,
        mode: SyncMode,
        since: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> Result<String> {
        if user_id.trim().is_empty() {
            return Err(RecallError::validation("user id must not be empty"));
        }
        let connector = self.connectors.get(source).ok_or_else(|| {
            RecallError::validation(format!("no connector registered for source {source}"))
        })?;

        let log = self.store.create_sync_log(user_id, source).await?;
        let sync_id = log.id.clone();

        let coordinator = Arc::clone(self);
        let user = user_id.to_string();
        let id = sync_id.clone();
        tokio::spawn(async move {
            coordinator
                .run_sync(connector, &user, source, &id, mode, since, cancel)
                .await;
        });

        Ok(sync_id)
    }

    /// Drive one sync to a terminal state and record the outcome.
    #[allow(clippy::too_many_arguments)]
    async fn run_sync(
        &self,
        connector: Arc<dyn SourceConnector>,
        user_id: &str,
        source: DocumentSource,
        sync_id: &str,
        mode: SyncMode,
        since: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) {
        match self
            .execute_sync(connector, user_id, source, sync_id, mode, since, &cancel)
            .await
        {
            Ok(counts) => {
                let cursor = Utc::now();
                if let Err(e) = self
                    .store
                    .complete_sync_log(
                        sync_id,
                        SyncStatus::Success,
                        counts.fetched as i64,
                        counts.added as i64,
                        Some(cursor),
                        None,
                    )
                    .await
                {
                    error!(sync_id, error = %e, "failed to finalize sync log");
                }
                info!(sync_id, user_id, %source, added = counts.added, skipped = counts.skipped, "sync complete");
                self.bus
                    .sync_complete(source, sync_id, user_id, counts.payload());
            }
            Err(e) => {
                let message = match &e {
                    RecallError::Cancelled => "cancelled".to_string(),
                    other => other.to_string(),
                };
                if let Err(log_err) = self
                    .store
                    .complete_sync_log(sync_id, SyncStatus::Failed, 0, 0, None, Some(&message))
                    .await
                {
                    error!(sync_id, error = %log_err, "failed to record sync failure");
                }
                error!(sync_id, user_id, %source, error = %message, "sync failed");
                self.bus
                    .sync_error(source, sync_id, user_id, json!({ "error": message }));
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_sync(
        &self,
        connector: Arc<dyn SourceConnector>,
        user_id: &str,
        source: DocumentSource,
        sync_id: &str,
        mode: SyncMode,
        since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<SyncCounts> {
        let mut counts = SyncCounts::default();

        // fetching
        self.publish_stage(source, sync_id, user_id, "fetching", 0, &counts);
        connector.authenticate(user_id).await?;

        let records = match mode {
            SyncMode::Incremental => {
                let cursor = match since {
                    Some(s) => Some(s),
                    None => self
                        .store
                        .latest_successful_sync(user_id, source)
                        .await?
                        .and_then(|log| log.last_sync_timestamp),
                };
                match cursor {
                    Some(cursor) => connector.fetch_new(user_id, cursor).await?,
                    None => {
                        // No prior successful run to resume from.
                        connector
                            .fetch_all(user_id, &FetchOptions::default())
                            .await?
                    }
                }
            }
            SyncMode::Full => {
                connector
                    .fetch_all(
                        user_id,
                        &FetchOptions {
                            since,
                            limit: None,
                        },
                    )
                    .await?
            }
        };
        counts.fetched = records.len() as u64;
        check_cancelled(cancel)?;

        // normalizing
        self.publish_stage(source, sync_id, user_id, "normalizing", 20, &counts);
        let mut documents = Vec::with_capacity(records.len());
        for record in &records {
            match connector.normalize(user_id, record) {
                Ok(Some(doc)) => documents.push(doc),
                Ok(None) => counts.dropped += 1,
                Err(e) => {
                    warn!(record_id = %record.id, error = %e, "failed to normalize record");
                    counts.failed += 1;
                }
            }
        }
        check_cancelled(cancel)?;

        // storing
        self.publish_stage(source, sync_id, user_id, "storing", 40, &counts);
        let total = documents.len().max(1);
        for (i, doc) in documents.iter().enumerate() {
            check_cancelled(cancel)?;
            match self.store.find_by_id(user_id, &doc.document_id).await? {
                Some(_) => counts.skipped += 1,
                None => match self.store.create_document(doc).await {
                    Ok(InsertOutcome::Inserted) => counts.added += 1,
                    Ok(InsertOutcome::Duplicate) => counts.skipped += 1,
                    Err(e) => {
                        warn!(document_id = %doc.document_id, error = %e, "failed to store document");
                        counts.failed += 1;
                    }
                },
            }

            if (i + 1) % 10 == 0 {
                let pct = 40 + (((i + 1) * 40) / total) as u64;
                self.publish_stage(source, sync_id, user_id, "storing", pct, &counts);
            }
        }
        check_cancelled(cancel)?;

        // embedding (reported on the same sync scope)
        self.publish_stage(source, sync_id, user_id, "embedding_start", 80, &counts);
        self.pipeline.drain_all_pending(Some(sync_id), cancel).await?;
        self.publish_stage(source, sync_id, user_id, "embedding", 99, &counts);

        Ok(counts)
    }

    fn publish_stage(
        &self,
        source: DocumentSource,
        sync_id: &str,
        user_id: &str,
        stage: &str,
        percentage: u64,
        counts: &SyncCounts,
    ) {
        self.bus.sync_progress(
            source,
            sync_id,
            user_id,
            json!({
                "stage": stage,
                "message": format!("{stage} ({} fetched)", counts.fetched),
                "percentage": percentage.min(99),
                "counts": counts.payload(),
            }),
        );
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(RecallError::Cancelled)
    } else {
        Ok(())
    }
}
