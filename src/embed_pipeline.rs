//! Embedding pipeline: pulls pending documents, batches them through the
//! embedding provider, and stores vectors transactionally.
//!
//! Two entry points:
//!
//! 1. [`EmbeddingPipeline::process_pending`] — one batch, used by the
//!    periodic trigger and the `recall embed pending` command.
//! 2. [`EmbeddingPipeline::drain_all_pending`] — loops until no flagged
//!    documents remain; invoked after ingestion so coverage is eventual.
//!
//! Documents are grouped into chunks of ten. Each chunk's updates are
//! applied in a single transaction; a chunk that fails to embed is logged
//! and skipped, since every document stays independently flagged. One
//! cost row is written per run. Progress is published per chunk with the
//! percentage capped at 99 until the final complete event.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::ProgressBus;
use crate::embedding::Embedder;
use crate::error::{RecallError, Result};
use crate::models::EmbeddingCost;
use crate::store::{DocumentStore, EmbeddingUpdate};

/// Documents embedded per transactional chunk.
const CHUNK_SIZE: usize = 10;

/// Pause between chunks.
const CHUNK_DELAY: Duration = Duration::from_millis(400);

/// Pause between top-level iterations of the drain loop.
const DRAIN_DELAY: Duration = Duration::from_millis(500);

/// Outcome of one pipeline run.
#[derive(Debug, Clone, Default)]
pub struct EmbedOutcome {
    pub batch_id: String,
    pub processed: u64,
    pub failed: u64,
    pub total_tokens: i64,
    pub estimated_cost: f64,
}

pub struct EmbeddingPipeline {
    store: DocumentStore,
    embedder: Arc<dyn Embedder>,
    bus: ProgressBus,
    batch_size: usize,
}

impl EmbeddingPipeline {
    pub fn new(
        store: DocumentStore,
        embedder: Arc<dyn Embedder>,
        bus: ProgressBus,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            embedder,
            bus,
            batch_size: batch_size.max(1),
        }
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Embed one batch of pending documents (default batch size from
    /// config). Lightweight entry point for periodic runs.
    pub async fn process_pending(&self, limit: Option<usize>) -> Result<EmbedOutcome> {
        let limit = limit.unwrap_or(self.batch_size);
        let scope_id = Uuid::new_v4().to_string();
        let mut outcome = EmbedOutcome {
            batch_id: scope_id.clone(),
            ..Default::default()
        };

        let pending = self
            .store
            .fetch_documents_needing_embedding(limit as i64)
            .await?;
        if pending.is_empty() {
            return Ok(outcome);
        }

        let total = pending.len() as u64;
        self.embed_documents(&pending, &scope_id, total, &mut outcome, &CancellationToken::new())
            .await?;
        self.record_cost(&outcome).await?;
        self.publish_complete(&scope_id, &outcome);
        Ok(outcome)
    }

    /// Loop until no documents are flagged. Chunk failures are swallowed
    /// after logging; only fatal errors (e.g. the store is unreachable)
    /// abort the run. When every remaining flagged document fails to
    /// embed, the loop stops rather than spinning.
    pub async fn drain_all_pending(
        &self,
        sync_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<EmbedOutcome> {
        let scope_id = sync_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut outcome = EmbedOutcome {
            batch_id: Uuid::new_v4().to_string(),
            ..Default::default()
        };

        let mut first_iteration = true;
        loop {
            if cancel.is_cancelled() {
                return Err(RecallError::Cancelled);
            }
            if !first_iteration {
                tokio::time::sleep(DRAIN_DELAY).await;
            }
            first_iteration = false;

            let pending = self
                .store
                .fetch_documents_needing_embedding(self.batch_size as i64)
                .await?;
            if pending.is_empty() {
                break;
            }

            let before_processed = outcome.processed;
            let before_failed = outcome.failed;
            let total = outcome.processed + pending.len() as u64;
            self.embed_documents(&pending, &scope_id, total, &mut outcome, cancel)
                .await?;

            // Every document in this pass failed; they are still flagged
            // and would be fetched again verbatim.
            if outcome.processed == before_processed && outcome.failed > before_failed {
                warn!(scope_id, failed = outcome.failed, "drain made no progress, stopping");
                break;
            }
        }

        if outcome.processed > 0 || outcome.failed > 0 {
            self.record_cost(&outcome).await?;
        }
        self.publish_complete(&scope_id, &outcome);
        Ok(outcome)
    }

    /// Embed a set of documents in transactional chunks.
    async fn embed_documents(
        &self,
        documents: &[crate::models::Document],
        scope_id: &str,
        total: u64,
        outcome: &mut EmbedOutcome,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for (chunk_index, chunk) in documents.chunks(CHUNK_SIZE).enumerate() {
            if cancel.is_cancelled() {
                return Err(RecallError::Cancelled);
            }
            if chunk_index > 0 {
                tokio::time::sleep(CHUNK_DELAY).await;
            }

            let texts: Vec<String> = chunk.iter().map(|d| d.content.clone()).collect();
            match self.embedder.embed_batch(&texts).await {
                Ok(outputs) => {
                    let updates: Vec<EmbeddingUpdate> = chunk
                        .iter()
                        .zip(outputs.iter())
                        .map(|(doc, out)| EmbeddingUpdate {
                            document_id: doc.document_id.clone(),
                            vector: out.vector.clone(),
                            tokens: out.tokens,
                        })
                        .collect();

                    let tokens: i64 = outputs.iter().map(|o| o.tokens).sum();
                    self.store
                        .batch_update_embeddings(self.embedder.model_name(), &updates)
                        .await?;
                    outcome.processed += updates.len() as u64;
                    outcome.total_tokens += tokens;
                }
                Err(e) => {
                    warn!(scope_id, error = %e, "embedding chunk failed, continuing");
                    outcome.failed += chunk.len() as u64;
                }
            }

            let done = outcome.processed + outcome.failed;
            let percentage = ((done * 100) / total.max(1)).min(99);
            self.bus.embeddings_progress(
                scope_id,
                json!({
                    "processed": outcome.processed,
                    "failed": outcome.failed,
                    "total": total,
                    "percentage": percentage,
                }),
            );
        }
        Ok(())
    }

    async fn record_cost(&self, outcome: &EmbedOutcome) -> Result<()> {
        let cost = EmbeddingCost {
            batch_id: outcome.batch_id.clone(),
            model: self.embedder.model_name().to_string(),
            document_count: outcome.processed as i64,
            total_tokens: outcome.total_tokens,
            estimated_cost: self.embedder.estimate_cost(outcome.total_tokens),
            status: if outcome.failed == 0 {
                "completed".to_string()
            } else {
                "completed_with_errors".to_string()
            },
            created_at: Utc::now(),
        };
        self.store.record_embedding_cost(&cost).await?;
        info!(
            batch_id = %cost.batch_id,
            documents = cost.document_count,
            tokens = cost.total_tokens,
            "recorded embedding cost"
        );
        Ok(())
    }

    fn publish_complete(&self, scope_id: &str, outcome: &EmbedOutcome) {
        self.bus.embeddings_progress(
            scope_id,
            json!({
                "processed": outcome.processed,
                "failed": outcome.failed,
                "total_tokens": outcome.total_tokens,
                "percentage": 100,
                "complete": true,
            }),
        );
    }
}
