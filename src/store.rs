//! Document Store: durable storage for normalized documents, embeddings,
//! sync logs, embedding costs, and conversation history.
//!
//! Every query is parameterized end-to-end; filters are composed by
//! appending bound predicates, never by interpolating user input. Vector
//! search loads candidate rows through the same parameterized filters and
//! orders them by cosine similarity computed over the stored BLOBs.
//!
//! # Failure semantics
//!
//! Transient database errors bubble up for the caller to retry. A unique
//! violation on insert is reported as [`InsertOutcome::Duplicate`] rather
//! than an error: re-ingesting the same upstream records is expected and
//! counted as skips.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, SqlitePool};
use uuid::Uuid;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{RecallError, Result};
use crate::models::{
    ConversationTurn, Document, DocumentSource, DocumentType, EmbeddingCost, InsertOutcome,
    SearchFilters, SearchHit, SyncLog, SyncStatus,
};

/// Lexical boost added to a hit's score when any keyword substring-matches.
pub const KEYWORD_BOOST: f64 = 0.1;

/// One embedding to apply in a transactional batch.
#[derive(Debug, Clone)]
pub struct EmbeddingUpdate {
    pub document_id: String,
    pub vector: Vec<f32>,
    pub tokens: i64,
}

/// Aggregate embedding coverage, served by `GET /embedding/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingStats {
    pub total_documents: i64,
    pub embedded: i64,
    pub pending: i64,
    pub total_tokens: i64,
}

/// One problem found by [`DocumentStore::diagnose_embeddings`].
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingDiagnosis {
    pub document_id: String,
    pub issue: String,
}

#[derive(Clone)]
pub struct DocumentStore {
    pool: SqlitePool,
}

impl DocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ documents ============

    /// Insert a document, reporting a duplicate `document_id` as a typed
    /// outcome instead of an error.
    pub async fn create_document(&self, doc: &Document) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO documents (document_id, user_id, source, doc_type, title, author,
                                   content, content_hash, timestamp, metadata_json,
                                   embedding, needs_embedding, embedding_model,
                                   embedding_tokens, embedding_generated_at,
                                   created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.document_id)
        .bind(&doc.user_id)
        .bind(doc.source.as_str())
        .bind(doc.doc_type.as_str())
        .bind(&doc.title)
        .bind(&doc.author)
        .bind(&doc.content)
        .bind(&doc.content_hash)
        .bind(doc.timestamp.timestamp())
        .bind(doc.metadata.to_string())
        .bind(doc.embedding.as_deref().map(vec_to_blob))
        .bind(doc.needs_embedding as i64)
        .bind(&doc.embedding_model)
        .bind(doc.embedding_tokens)
        .bind(doc.embedding_generated_at.map(|t| t.timestamp()))
        .bind(doc.created_at.timestamp())
        .bind(doc.updated_at.timestamp())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn find_by_id(&self, user_id: &str, document_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE user_id = ? AND document_id = ?")
            .bind(user_id)
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_document(&r)).transpose()
    }

    pub async fn count_documents(&self, user_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Documents flagged for embedding, oldest first.
    pub async fn fetch_documents_needing_embedding(&self, limit: i64) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM documents
            WHERE needs_embedding = 1 AND content != ''
            ORDER BY created_at ASC, document_id ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_document).collect()
    }

    /// Apply a chunk of embedding updates inside a single transaction:
    /// either every update in the chunk lands or none does.
    pub async fn batch_update_embeddings(
        &self,
        model: &str,
        updates: &[EmbeddingUpdate],
    ) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for update in updates {
            sqlx::query(
                r#"
                UPDATE documents
                SET embedding = ?, needs_embedding = 0, embedding_model = ?,
                    embedding_tokens = ?, embedding_generated_at = ?, updated_at = ?
                WHERE document_id = ?
                "#,
            )
            .bind(vec_to_blob(&update.vector))
            .bind(model)
            .bind(update.tokens)
            .bind(now)
            .bind(now)
            .bind(&update.document_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Flag documents for re-embedding. `None` flags every document with
    /// content for the user; otherwise only the listed ids. Returns the
    /// number of rows flagged.
    pub async fn mark_for_reembedding(
        &self,
        user_id: &str,
        document_ids: Option<&[String]>,
    ) -> Result<u64> {
        let mut qb = QueryBuilder::new(
            "UPDATE documents SET needs_embedding = 1, updated_at = ",
        );
        qb.push_bind(Utc::now().timestamp());
        qb.push(" WHERE user_id = ");
        qb.push_bind(user_id);
        qb.push(" AND content != ''");

        if let Some(ids) = document_ids {
            if ids.is_empty() {
                return Ok(0);
            }
            qb.push(" AND document_id IN (");
            {
                let mut separated = qb.separated(", ");
                for id in ids {
                    separated.push_bind(id);
                }
            }
            qb.push(")");
        }

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    // ============ search ============

    /// Cosine-similarity search over the user's embedded documents.
    ///
    /// Candidates are selected with parameterized filter predicates, then
    /// ordered by similarity to `vector`; hits below `min_similarity` are
    /// dropped and the top `limit` returned.
    pub async fn search(
        &self,
        user_id: &str,
        vector: &[f32],
        filters: &SearchFilters,
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<SearchHit>> {
        let mut hits = self.scored_candidates(user_id, vector, filters, None).await?;
        hits.retain(|h| h.similarity >= min_similarity);
        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    /// Keyword-boosted variant: a hit scoring `similarity + 0.1` when any
    /// keyword substring-matches its title, author, or content, sorted by
    /// the boosted sum.
    pub async fn hybrid_search(
        &self,
        user_id: &str,
        vector: &[f32],
        keywords: &[String],
        filters: &SearchFilters,
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<SearchHit>> {
        let mut hits = self
            .scored_candidates(user_id, vector, filters, None)
            .await?;
        hits.retain(|h| h.similarity >= min_similarity);

        let lowered: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
        for hit in &mut hits {
            if keyword_matches(hit, &lowered) {
                hit.keyword_boost = KEYWORD_BOOST;
            }
        }

        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    /// K nearest neighbours of a stored document, excluding the seed.
    pub async fn find_similar(
        &self,
        user_id: &str,
        document_id: &str,
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        let seed = self
            .find_by_id(user_id, document_id)
            .await?
            .ok_or_else(|| RecallError::not_found(format!("document {document_id}")))?;
        let vector = seed.embedding.ok_or_else(|| {
            RecallError::validation(format!("document {document_id} has no embedding"))
        })?;

        let mut hits = self
            .scored_candidates(user_id, &vector, &SearchFilters::default(), Some(document_id))
            .await?;
        sort_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    /// Load embedded candidate rows through bound filter predicates and
    /// score each against `vector`.
    async fn scored_candidates(
        &self,
        user_id: &str,
        vector: &[f32],
        filters: &SearchFilters,
        exclude_id: Option<&str>,
    ) -> Result<Vec<SearchHit>> {
        let mut qb = QueryBuilder::new(
            "SELECT document_id, source, doc_type, title, author, content, timestamp, \
             metadata_json, embedding FROM documents WHERE user_id = ",
        );
        qb.push_bind(user_id);
        qb.push(" AND embedding IS NOT NULL");

        if let Some(source) = filters.source {
            qb.push(" AND source = ");
            qb.push_bind(source.as_str());
        }
        if let Some(doc_type) = filters.doc_type {
            qb.push(" AND doc_type = ");
            qb.push_bind(doc_type.as_str());
        }
        if let Some(author) = &filters.author {
            qb.push(" AND author LIKE ");
            qb.push_bind(format!("%{author}%"));
        }
        if let Some(range) = &filters.time_range {
            qb.push(" AND timestamp >= ");
            qb.push_bind(range.start.timestamp());
            qb.push(" AND timestamp < ");
            qb.push_bind(range.end.timestamp());
        }
        if let Some(excluded) = exclude_id {
            qb.push(" AND document_id != ");
            qb.push_bind(excluded);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let candidate = blob_to_vec(&blob);
            let similarity = cosine_similarity(vector, &candidate) as f64;

            let source = DocumentSource::parse(row.get("source"))?;
            let doc_type = DocumentType::parse(row.get("doc_type"))?;
            let metadata: serde_json::Value =
                serde_json::from_str(row.get("metadata_json")).unwrap_or_default();

            hits.push(SearchHit {
                document_id: row.get("document_id"),
                source,
                doc_type,
                title: row.get("title"),
                author: row.get("author"),
                content: row.get("content"),
                timestamp: ts_to_datetime(row.get("timestamp")),
                metadata,
                similarity,
                keyword_boost: 0.0,
            });
        }

        Ok(hits)
    }

    // ============ sync logs ============

    pub async fn create_sync_log(
        &self,
        user_id: &str,
        source: DocumentSource,
    ) -> Result<SyncLog> {
        let log = SyncLog {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            source,
            status: SyncStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            documents_fetched: 0,
            documents_stored: 0,
            last_sync_timestamp: None,
            error_message: None,
        };

        sqlx::query(
            r#"
            INSERT INTO sync_logs (id, user_id, source, status, started_at,
                                   documents_fetched, documents_stored)
            VALUES (?, ?, ?, ?, ?, 0, 0)
            "#,
        )
        .bind(&log.id)
        .bind(&log.user_id)
        .bind(log.source.as_str())
        .bind(log.status.as_str())
        .bind(log.started_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(log)
    }

    pub async fn get_sync_log(&self, sync_id: &str) -> Result<Option<SyncLog>> {
        let row = sqlx::query("SELECT * FROM sync_logs WHERE id = ?")
            .bind(sync_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| row_to_sync_log(&r)).transpose()
    }

    /// Move a sync log into a terminal state. Rows that already reached a
    /// terminal status are immutable; attempting to transition them again
    /// is a validation error.
    pub async fn complete_sync_log(
        &self,
        sync_id: &str,
        status: SyncStatus,
        documents_fetched: i64,
        documents_stored: i64,
        last_sync_timestamp: Option<DateTime<Utc>>,
        error_message: Option<&str>,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(RecallError::validation(
                "sync log can only transition to a terminal status",
            ));
        }

        let result = sqlx::query(
            r#"
            UPDATE sync_logs
            SET status = ?, completed_at = ?, documents_fetched = ?,
                documents_stored = ?, last_sync_timestamp = ?, error_message = ?
            WHERE id = ? AND status = 'in_progress'
            "#,
        )
        .bind(status.as_str())
        .bind(Utc::now().timestamp())
        .bind(documents_fetched)
        .bind(documents_stored)
        .bind(last_sync_timestamp.map(|t| t.timestamp()))
        .bind(error_message)
        .bind(sync_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_sync_log(sync_id).await? {
                Some(_) => Err(RecallError::validation(format!(
                    "sync log {sync_id} already reached a terminal status"
                ))),
                None => Err(RecallError::not_found(format!("sync log {sync_id}"))),
            };
        }
        Ok(())
    }

    /// The most recent successful run for `(user, source)`; its
    /// `last_sync_timestamp` is the resume cursor for incremental syncs.
    pub async fn latest_successful_sync(
        &self,
        user_id: &str,
        source: DocumentSource,
    ) -> Result<Option<SyncLog>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM sync_logs
            WHERE user_id = ? AND source = ? AND status = 'success'
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_sync_log(&r)).transpose()
    }

    pub async fn list_sync_logs(
        &self,
        user_id: &str,
        source: Option<DocumentSource>,
        limit: i64,
    ) -> Result<Vec<SyncLog>> {
        let mut qb = QueryBuilder::new("SELECT * FROM sync_logs WHERE user_id = ");
        qb.push_bind(user_id);
        if let Some(source) = source {
            qb.push(" AND source = ");
            qb.push_bind(source.as_str());
        }
        qb.push(" ORDER BY started_at DESC LIMIT ");
        qb.push_bind(limit);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_sync_log).collect()
    }

    // ============ embedding costs ============

    pub async fn record_embedding_cost(&self, cost: &EmbeddingCost) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO embedding_costs (batch_id, model, document_count, total_tokens,
                                         estimated_cost, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&cost.batch_id)
        .bind(&cost.model)
        .bind(cost.document_count)
        .bind(cost.total_tokens)
        .bind(cost.estimated_cost)
        .bind(&cost.status)
        .bind(cost.created_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_embedding_costs(&self, limit: i64) -> Result<Vec<EmbeddingCost>> {
        let rows = sqlx::query(
            "SELECT * FROM embedding_costs ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(EmbeddingCost {
                    batch_id: row.get("batch_id"),
                    model: row.get("model"),
                    document_count: row.get("document_count"),
                    total_tokens: row.get("total_tokens"),
                    estimated_cost: row.get("estimated_cost"),
                    status: row.get("status"),
                    created_at: ts_to_datetime(row.get("created_at")),
                })
            })
            .collect()
    }

    pub async fn embedding_stats(&self) -> Result<EmbeddingStats> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   SUM(CASE WHEN embedding IS NOT NULL THEN 1 ELSE 0 END) AS embedded,
                   SUM(CASE WHEN needs_embedding = 1 THEN 1 ELSE 0 END) AS pending,
                   COALESCE(SUM(embedding_tokens), 0) AS total_tokens
            FROM documents
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(EmbeddingStats {
            total_documents: row.get("total"),
            embedded: row.get::<Option<i64>, _>("embedded").unwrap_or(0),
            pending: row.get::<Option<i64>, _>("pending").unwrap_or(0),
            total_tokens: row.get("total_tokens"),
        })
    }

    /// Find documents whose embedding state is inconsistent: flagged but
    /// never drained, vector missing despite content, or a stored vector
    /// of the wrong dimensionality.
    pub async fn diagnose_embeddings(&self, dimensions: usize) -> Result<Vec<EmbeddingDiagnosis>> {
        let rows = sqlx::query(
            r#"
            SELECT document_id, needs_embedding, content, embedding
            FROM documents
            WHERE needs_embedding = 1
               OR (embedding IS NULL AND content != '')
               OR (embedding IS NOT NULL AND length(embedding) != ?)
            "#,
        )
        .bind((dimensions * 4) as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut diagnoses = Vec::new();
        for row in &rows {
            let document_id: String = row.get("document_id");
            let needs: i64 = row.get("needs_embedding");
            let blob: Option<Vec<u8>> = row.get("embedding");
            let issue = match &blob {
                Some(b) if b.len() != dimensions * 4 => format!(
                    "vector has {} dimensions, expected {dimensions}",
                    b.len() / 4
                ),
                None => "vector missing".to_string(),
                Some(_) if needs == 1 => "flagged for re-embedding".to_string(),
                Some(_) => continue,
            };
            diagnoses.push(EmbeddingDiagnosis { document_id, issue });
        }
        Ok(diagnoses)
    }

    // ============ conversations ============

    pub async fn create_conversation(&self, user_id: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        sqlx::query("INSERT INTO conversations (id, user_id, created_at) VALUES (?, ?, ?)")
            .bind(&id)
            .bind(user_id)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    pub async fn conversation_exists(&self, conversation_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conversations WHERE id = ?")
            .bind(conversation_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn append_turn(&self, turn: &ConversationTurn) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO conversation_turns (id, conversation_id, user_id, query, answer,
                                            metadata_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&turn.id)
        .bind(&turn.conversation_id)
        .bind(&turn.user_id)
        .bind(&turn.query)
        .bind(&turn.answer)
        .bind(turn.metadata.to_string())
        .bind(turn.created_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Turns in chronological order, newest `limit` of them.
    pub async fn list_turns(
        &self,
        conversation_id: &str,
        limit: i64,
    ) -> Result<Vec<ConversationTurn>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT * FROM conversation_turns
                WHERE conversation_id = ?
                ORDER BY created_at DESC, id DESC
                LIMIT ?
            ) ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(conversation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ConversationTurn {
                    id: row.get("id"),
                    conversation_id: row.get("conversation_id"),
                    user_id: row.get("user_id"),
                    query: row.get("query"),
                    answer: row.get("answer"),
                    metadata: serde_json::from_str(row.get("metadata_json")).unwrap_or_default(),
                    created_at: ts_to_datetime(row.get("created_at")),
                })
            })
            .collect()
    }
}

fn sort_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| {
        let score_a = a.similarity + a.keyword_boost;
        let score_b = b.similarity + b.keyword_boost;
        score_b
            .partial_cmp(&score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.timestamp.cmp(&a.timestamp))
            .then(a.document_id.cmp(&b.document_id))
    });
}

fn keyword_matches(hit: &SearchHit, lowered_keywords: &[String]) -> bool {
    if lowered_keywords.is_empty() {
        return false;
    }
    let haystack = format!(
        "{} {} {}",
        hit.title.as_deref().unwrap_or("").to_lowercase(),
        hit.author.as_deref().unwrap_or("").to_lowercase(),
        hit.content.to_lowercase()
    );
    lowered_keywords.iter().any(|kw| haystack.contains(kw))
}

fn ts_to_datetime(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let source = DocumentSource::parse(row.get("source"))?;
    let doc_type = DocumentType::parse(row.get("doc_type"))?;
    let embedding: Option<Vec<u8>> = row.get("embedding");

    Ok(Document {
        document_id: row.get("document_id"),
        user_id: row.get("user_id"),
        source,
        doc_type,
        title: row.get("title"),
        author: row.get("author"),
        content: row.get("content"),
        content_hash: row.get("content_hash"),
        timestamp: ts_to_datetime(row.get("timestamp")),
        metadata: serde_json::from_str(row.get("metadata_json")).unwrap_or_default(),
        embedding: embedding.map(|b| blob_to_vec(&b)),
        needs_embedding: row.get::<i64, _>("needs_embedding") == 1,
        embedding_model: row.get("embedding_model"),
        embedding_tokens: row.get("embedding_tokens"),
        embedding_generated_at: row
            .get::<Option<i64>, _>("embedding_generated_at")
            .map(ts_to_datetime),
        created_at: ts_to_datetime(row.get("created_at")),
        updated_at: ts_to_datetime(row.get("updated_at")),
    })
}

fn row_to_sync_log(row: &SqliteRow) -> Result<SyncLog> {
    Ok(SyncLog {
        id: row.get("id"),
        user_id: row.get("user_id"),
        source: DocumentSource::parse(row.get("source"))?,
        status: SyncStatus::parse(row.get("status"))?,
        started_at: ts_to_datetime(row.get("started_at")),
        completed_at: row.get::<Option<i64>, _>("completed_at").map(ts_to_datetime),
        documents_fetched: row.get("documents_fetched"),
        documents_stored: row.get("documents_stored"),
        last_sync_timestamp: row
            .get::<Option<i64>, _>("last_sync_timestamp")
            .map(ts_to_datetime),
        error_message: row.get("error_message"),
    })
}
