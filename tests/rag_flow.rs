//! Query pipeline end-to-end: retrieval strategy selection, filtering,
//! fallback, context packing, and prompt assembly over a seeded store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use recall::bus::ProgressBus;
use recall::config::{DbConfig, RankerWeights, RetrievalConfig, SourcePriority};
use recall::embedding::{Embedder, EmbeddingOutput};
use recall::error::Result as RecallResult;
use recall::models::{Document, DocumentSource, DocumentType};
use recall::rag::RagPipeline;
use recall::store::DocumentStore;
use recall::vector_search::VectorSearch;
use recall::{db, migrate};

/// Embedder that maps every text to the same unit query vector, so a
/// document's stored vector fully controls its similarity.
struct FixedEmbedder;

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, _text: &str) -> RecallResult<EmbeddingOutput> {
        Ok(EmbeddingOutput {
            vector: vec![1.0, 0.0, 0.0],
            tokens: 1,
        })
    }
    async fn health_check(&self) -> bool {
        true
    }
    fn model_name(&self) -> &str {
        "fixed"
    }
    fn dims(&self) -> usize {
        3
    }
    fn estimate_cost(&self, _tokens: i64) -> f64 {
        0.0
    }
}

fn retrieval_config() -> RetrievalConfig {
    RetrievalConfig {
        default_top_n: 10,
        default_top_k: 20,
        default_min_similarity: 0.35,
        min_similarity_floor: 0.25,
        max_context_tokens: 28_000,
        hybrid_keyword_threshold: 2,
        diversity_threshold: 0.85,
        recency_decay_days: 60.0,
        min_results: 3,
        weights: RankerWeights::default(),
        intent_boost: 1.3,
        source_priority: SourcePriority::default(),
    }
}

async fn open_store() -> DocumentStore {
    let mut path = std::env::temp_dir();
    path.push(format!("recall-rag-{}.sqlite", Uuid::new_v4()));
    let config = DbConfig {
        path,
        max_connections: 5,
        connect_timeout: Duration::from_secs(5),
    };
    let pool = db::connect(&config).await.expect("connect");
    migrate::run_migrations(&pool).await.expect("migrate");
    DocumentStore::new(pool)
}

fn pipeline(store: &DocumentStore) -> RagPipeline {
    let search = Arc::new(VectorSearch::new(store.clone(), Arc::new(FixedEmbedder)));
    RagPipeline::new(search, retrieval_config(), ProgressBus::new())
}

async fn seed(
    store: &DocumentStore,
    id: &str,
    author: &str,
    content: &str,
    vector: Vec<f32>,
    days_old: i64,
) {
    let mut doc = Document::new(
        id,
        "u1",
        DocumentSource::Email,
        DocumentType::Message,
        content.to_string(),
        Utc::now() - ChronoDuration::days(days_old),
    )
    .with_title(format!("subject of {id}"))
    .with_author(author);
    doc.embedding = Some(vector);
    doc.needs_embedding = false;
    store.create_document(&doc).await.expect("seed");
}

#[tokio::test]
async fn hybrid_retrieval_with_author_filter() {
    let store = open_store().await;
    seed(
        &store,
        "email_ravi",
        "Ravi Kumar <ravi@example.com>",
        "the quarterly budget forecast is ready for review with all numbers",
        vec![1.0, 0.0, 0.0],
        2,
    )
    .await;
    seed(
        &store,
        "email_bob",
        "Bob <bob@example.com>",
        "the quarterly budget forecast is ready for review with all numbers",
        vec![1.0, 0.0, 0.0],
        2,
    )
    .await;

    let rag = pipeline(&store);
    let output = rag
        .run("u1", "q1", "emails from Ravi about budget")
        .await
        .expect("run");

    // ≥2 keywords → hybrid; the author filter restricts to Ravi's mail.
    assert_eq!(output.retrieval.strategy, "hybrid");
    assert_eq!(output.context.selected, 1);
    assert_eq!(output.citations.len(), 1);
    assert_eq!(output.citations[0].document_id, "email_ravi");
    assert_eq!(
        output.processed_query.filters.author.as_deref(),
        Some("Ravi")
    );
    assert!(output.prompt.contains("[Document 1]"));
    assert!(output.prompt.contains("cite documents by number"));
}

#[tokio::test]
async fn empty_results_use_no_context_template() {
    let store = open_store().await;
    let rag = pipeline(&store);

    let output = rag.run("u1", "q2", "zxq9").await.expect("run");

    assert_eq!(output.context.selected, 0);
    assert!(output.citations.is_empty());
    assert!(output.context.is_empty());
    assert!(output.prompt.contains("No documents relevant"));
    assert!(output.prompt.contains("zxq9"));
}

#[tokio::test]
async fn fallback_relaxes_similarity_floor() {
    let store = open_store().await;
    // cos = 0.28: below the 0.35 default, above the 0.25 floor.
    seed(
        &store,
        "email_weak",
        "Ana",
        "vaguely related travel plans for the offsite next quarter",
        vec![0.28, 0.96, 0.0],
        5,
    )
    .await;

    let rag = pipeline(&store);
    let output = rag
        .run("u1", "q3", "offsite travel plans")
        .await
        .expect("run");

    assert!(output.retrieval.fallback_used);
    assert_eq!(output.context.selected, 1);
    assert_eq!(output.citations[0].document_id, "email_weak");
}

#[tokio::test]
async fn single_keyword_queries_use_semantic_expansion() {
    let store = open_store().await;
    seed(
        &store,
        "email_hit",
        "Ana",
        "everything about the reorganization in one long thread",
        vec![1.0, 0.0, 0.0],
        1,
    )
    .await;

    let rag = pipeline(&store);
    // One keyword ("reorganization") stays under the hybrid threshold.
    let output = rag.run("u1", "q4", "the reorganization").await.expect("run");

    assert_eq!(output.retrieval.strategy, "semantic");
    assert_eq!(output.context.selected, 1);
}

#[tokio::test]
async fn empty_query_is_a_validation_error() {
    let store = open_store().await;
    let rag = pipeline(&store);

    let err = rag.run("u1", "q5", "   ").await.expect_err("rejected");
    assert!(matches!(err, recall::RecallError::Validation(_)));
}

#[tokio::test]
async fn citations_match_context_blocks() {
    let store = open_store().await;
    for (i, vector) in [
        vec![1.0, 0.0, 0.0],
        vec![0.9, 0.435_889_9, 0.0],
        vec![0.8, 0.6, 0.0],
    ]
    .into_iter()
    .enumerate()
    {
        seed(
            &store,
            &format!("email_m{i}"),
            "Ana",
            &format!("distinct content number {i} about the budget planning cycle"),
            vector,
            i as i64,
        )
        .await;
    }

    let rag = pipeline(&store);
    let output = rag
        .run("u1", "q6", "budget planning emails")
        .await
        .expect("run");

    assert!(output.context.selected >= 2);
    for citation in &output.citations {
        assert!(output
            .context
            .text
            .contains(&format!("[Document {}]", citation.id)));
    }
}
