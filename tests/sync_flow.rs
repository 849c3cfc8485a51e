//! End-to-end ingestion scenarios: fresh sync, idempotent re-sync, and
//! incremental resume, driven through the coordinator with a scripted
//! upstream and a deterministic embedder.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use recall::bus::ProgressBus;
use recall::config::DbConfig;
use recall::connector::{ConnectorRegistry, FetchOptions, RawRecord, SourceConnector};
use recall::embed_pipeline::EmbeddingPipeline;
use recall::embedding::{Embedder, EmbeddingOutput};
use recall::error::Result as RecallResult;
use recall::models::{Document, DocumentSource, DocumentType, SyncStatus};
use recall::store::DocumentStore;
use recall::sync::{SyncCoordinator, SyncMode};
use recall::{db, migrate};

const DIMS: usize = 4;

// ============================================================================
// Test doubles
// ============================================================================

/// Embedder returning a deterministic unit vector per text.
struct StubEmbedder {
    calls: AtomicUsize,
}

impl StubEmbedder {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, text: &str) -> RecallResult<EmbeddingOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let n = text.len() as f32;
        Ok(EmbeddingOutput {
            vector: vec![1.0, n % 7.0, n % 3.0, 0.5],
            tokens: (text.len() as i64 / 4).max(1),
        })
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn model_name(&self) -> &str {
        "stub-embedder"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    fn estimate_cost(&self, tokens: i64) -> f64 {
        tokens as f64 / 1_000_000.0 * 0.02
    }
}

/// Scripted upstream: a mutable list of (id, timestamp, body) messages.
#[derive(Clone)]
struct ScriptedUpstream {
    messages: Arc<Mutex<Vec<(String, DateTime<Utc>, String)>>>,
}

struct ScriptedConnector {
    upstream: ScriptedUpstream,
}

#[async_trait]
impl SourceConnector for ScriptedConnector {
    fn source(&self) -> DocumentSource {
        DocumentSource::Email
    }

    async fn authenticate(&self, _user_id: &str) -> RecallResult<()> {
        Ok(())
    }

    async fn fetch_all(
        &self,
        _user_id: &str,
        options: &FetchOptions,
    ) -> RecallResult<Vec<RawRecord>> {
        let messages = self.upstream.messages.lock().expect("upstream lock");
        Ok(messages
            .iter()
            .filter(|(_, ts, _)| options.since.map(|since| *ts >= since).unwrap_or(true))
            .map(|(id, ts, body)| RawRecord {
                id: id.clone(),
                timestamp: *ts,
                payload: serde_json::json!({ "body": body }),
            })
            .collect())
    }

    async fn fetch_new(
        &self,
        _user_id: &str,
        since: DateTime<Utc>,
    ) -> RecallResult<Vec<RawRecord>> {
        let messages = self.upstream.messages.lock().expect("upstream lock");
        Ok(messages
            .iter()
            .filter(|(_, ts, _)| *ts > since)
            .map(|(id, ts, body)| RawRecord {
                id: id.clone(),
                timestamp: *ts,
                payload: serde_json::json!({ "body": body }),
            })
            .collect())
    }

    fn normalize(&self, user_id: &str, raw: &RawRecord) -> RecallResult<Option<Document>> {
        let body = raw
            .payload
            .get("body")
            .and_then(|b| b.as_str())
            .unwrap_or_default();
        if body.is_empty() {
            return Ok(None);
        }
        Ok(Some(Document::new(
            format!("email_{}", raw.id),
            user_id,
            DocumentSource::Email,
            DocumentType::Message,
            body.to_string(),
            raw.timestamp,
        )))
    }

    async fn validate_connection(&self, _user_id: &str) -> RecallResult<bool> {
        Ok(true)
    }
}

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    store: DocumentStore,
    coordinator: Arc<SyncCoordinator>,
    upstream: ScriptedUpstream,
    embedder: Arc<StubEmbedder>,
}

async fn harness() -> Harness {
    let mut path = std::env::temp_dir();
    path.push(format!("recall-sync-{}.sqlite", Uuid::new_v4()));
    let config = DbConfig {
        path,
        max_connections: 5,
        connect_timeout: Duration::from_secs(5),
    };
    let pool = db::connect(&config).await.expect("connect");
    migrate::run_migrations(&pool).await.expect("migrate");

    let store = DocumentStore::new(pool);
    let bus = ProgressBus::new();
    let embedder = Arc::new(StubEmbedder::new());
    let pipeline = Arc::new(EmbeddingPipeline::new(
        store.clone(),
        embedder.clone(),
        bus.clone(),
        50,
    ));

    let upstream = ScriptedUpstream {
        messages: Arc::new(Mutex::new(vec![
            (
                "m1".to_string(),
                Utc.with_ymd_and_hms(2025, 10, 1, 9, 0, 0).unwrap(),
                "quarterly budget draft attached".to_string(),
            ),
            (
                "m2".to_string(),
                Utc.with_ymd_and_hms(2025, 10, 2, 9, 0, 0).unwrap(),
                "lunch on thursday?".to_string(),
            ),
            (
                "m3".to_string(),
                Utc.with_ymd_and_hms(2025, 10, 3, 9, 0, 0).unwrap(),
                "flight confirmation for the offsite".to_string(),
            ),
        ])),
    };

    let mut connectors = ConnectorRegistry::new();
    connectors.register(Arc::new(ScriptedConnector {
        upstream: upstream.clone(),
    }));

    let coordinator = Arc::new(SyncCoordinator::new(
        store.clone(),
        connectors,
        pipeline,
        bus,
    ));

    Harness {
        store,
        coordinator,
        upstream,
        embedder,
    }
}

/// Poll the sync log until it reaches a terminal status.
async fn await_sync(store: &DocumentStore, sync_id: &str) -> recall::models::SyncLog {
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let log = store
            .get_sync_log(sync_id)
            .await
            .expect("get log")
            .expect("log exists");
        if log.status.is_terminal() {
            return log;
        }
    }
    panic!("sync {sync_id} did not finish in time");
}

async fn run_sync(h: &Harness, mode: SyncMode, since: Option<DateTime<Utc>>) -> recall::models::SyncLog {
    let sync_id = h
        .coordinator
        .start_sync("u1", DocumentSource::Email, mode, since, CancellationToken::new())
        .await
        .expect("start");
    await_sync(&h.store, &sync_id).await
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn fresh_ingestion_stores_and_embeds_everything() {
    let h = harness().await;
    let since = Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap();

    let log = run_sync(&h, SyncMode::Full, Some(since)).await;
    assert_eq!(log.status, SyncStatus::Success);
    assert_eq!(log.documents_fetched, 3);
    assert_eq!(log.documents_stored, 3);
    assert!(log.last_sync_timestamp.is_some());
    assert!(log.completed_at.is_some());

    // All three documents exist and carry vectors of the right width.
    for id in ["email_m1", "email_m2", "email_m3"] {
        let doc = h
            .store
            .find_by_id("u1", id)
            .await
            .expect("find")
            .unwrap_or_else(|| panic!("{id} missing"));
        assert!(!doc.needs_embedding, "{id} still flagged");
        assert_eq!(doc.embedding.expect("vector").len(), DIMS);
        assert_eq!(doc.embedding_model.as_deref(), Some("stub-embedder"));
    }

    // Drain left nothing pending and wrote one cost row.
    assert!(h
        .store
        .fetch_documents_needing_embedding(10)
        .await
        .expect("pending")
        .is_empty());
    let costs = h.store.list_embedding_costs(10).await.expect("costs");
    assert_eq!(costs.len(), 1);
    assert_eq!(costs[0].document_count, 3);
}

#[tokio::test]
async fn repeat_sync_is_idempotent() {
    let h = harness().await;

    let first = run_sync(&h, SyncMode::Full, None).await;
    assert_eq!(first.documents_stored, 3);
    let embed_calls_after_first = h.embedder.calls.load(Ordering::SeqCst);

    let second = run_sync(&h, SyncMode::Full, None).await;
    assert_eq!(second.status, SyncStatus::Success);
    assert_eq!(second.documents_fetched, 3);
    assert_eq!(second.documents_stored, 0);

    assert_eq!(h.store.count_documents("u1").await.expect("count"), 3);
    // Nothing new to embed on the second pass.
    assert_eq!(h.embedder.calls.load(Ordering::SeqCst), embed_calls_after_first);
}

#[tokio::test]
async fn incremental_sync_picks_up_only_new_messages() {
    let h = harness().await;

    let first = run_sync(&h, SyncMode::Full, None).await;
    assert_eq!(first.documents_stored, 3);

    // Upstream gains one message newer than the cursor.
    let new_ts = Utc::now() + chrono::Duration::minutes(5);
    h.upstream
        .messages
        .lock()
        .expect("upstream lock")
        .push(("m4".to_string(), new_ts, "expense report reminder".to_string()));

    let second = run_sync(&h, SyncMode::Incremental, None).await;
    assert_eq!(second.status, SyncStatus::Success);
    assert_eq!(second.documents_fetched, 1);
    assert_eq!(second.documents_stored, 1);
    assert!(second.last_sync_timestamp.expect("cursor") >= first.last_sync_timestamp.expect("cursor"));

    assert_eq!(h.store.count_documents("u1").await.expect("count"), 4);
    let m4 = h
        .store
        .find_by_id("u1", "email_m4")
        .await
        .expect("find")
        .expect("m4 stored");
    assert!(!m4.needs_embedding);
}

#[tokio::test]
async fn empty_bodies_are_dropped_not_stored() {
    let h = harness().await;
    h.upstream
        .messages
        .lock()
        .expect("upstream lock")
        .push((
            "m-empty".to_string(),
            Utc.with_ymd_and_hms(2025, 10, 4, 9, 0, 0).unwrap(),
            String::new(),
        ));

    let log = run_sync(&h, SyncMode::Full, None).await;
    assert_eq!(log.status, SyncStatus::Success);
    assert_eq!(log.documents_fetched, 4);
    assert_eq!(log.documents_stored, 3);
    assert!(h
        .store
        .find_by_id("u1", "email_m-empty")
        .await
        .expect("find")
        .is_none());
}

#[tokio::test]
async fn unknown_source_is_rejected_up_front() {
    let h = harness().await;
    let err = h
        .coordinator
        .start_sync(
            "u1",
            DocumentSource::Music,
            SyncMode::Full,
            None,
            CancellationToken::new(),
        )
        .await
        .expect_err("no music connector registered");
    assert!(err.to_string().contains("no connector"));
}

#[tokio::test]
async fn cancelled_sync_fails_with_marker() {
    let h = harness().await;
    let cancel = CancellationToken::new();
    cancel.cancel();

    let sync_id = h
        .coordinator
        .start_sync("u1", DocumentSource::Email, SyncMode::Full, None, cancel)
        .await
        .expect("start");

    let log = await_sync(&h.store, &sync_id).await;
    assert_eq!(log.status, SyncStatus::Failed);
    assert_eq!(log.error_message.as_deref(), Some("cancelled"));
}
