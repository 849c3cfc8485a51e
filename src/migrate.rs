//! Database schema migrations.
//!
//! Creates all required tables and ensures idempotent execution. Run via
//! `recall init`; `recall serve` also runs them at boot so a fresh
//! deployment needs no separate step.
//!
//! # Tables
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `documents` | Normalized documents with embedding BLOBs and provenance |
//! | `sync_logs` | One row per ingestion run, terminal rows immutable |
//! | `credentials` | Encrypted tokens per `(user_id, source)` |
//! | `embedding_costs` | Audit trail per embedding run |
//! | `conversations` / `conversation_turns` | Chat history |
//! | `users` | Known principals |
//!
//! Embedding vectors are little-endian `f32` BLOBs of the configured
//! dimensionality (see [`crate::embedding::vec_to_blob`]).

use sqlx::SqlitePool;

use crate::error::Result;

/// Run all migrations. Safe to call multiple times.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            document_id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            source TEXT NOT NULL,
            doc_type TEXT NOT NULL,
            title TEXT,
            author TEXT,
            content TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            embedding BLOB,
            needs_embedding INTEGER NOT NULL DEFAULT 0,
            embedding_model TEXT,
            embedding_tokens INTEGER,
            embedding_generated_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_logs (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            source TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            completed_at INTEGER,
            documents_fetched INTEGER NOT NULL DEFAULT 0,
            documents_stored INTEGER NOT NULL DEFAULT 0,
            last_sync_timestamp INTEGER,
            error_message TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS credentials (
            user_id TEXT NOT NULL,
            source TEXT NOT NULL,
            access_token TEXT NOT NULL,
            refresh_token TEXT,
            expires_at INTEGER,
            scopes TEXT,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (user_id, source)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_costs (
            batch_id TEXT PRIMARY KEY,
            model TEXT NOT NULL,
            document_count INTEGER NOT NULL,
            total_tokens INTEGER NOT NULL,
            estimated_cost REAL NOT NULL,
            status TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversations (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_turns (
            id TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            query TEXT NOT NULL,
            answer TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            FOREIGN KEY (conversation_id) REFERENCES conversations(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_user_source ON documents(user_id, source)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_needs_embedding
         ON documents(needs_embedding) WHERE needs_embedding = 1",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_timestamp ON documents(timestamp DESC)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sync_logs_user_source ON sync_logs(user_id, source, started_at DESC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_turns_conversation
         ON conversation_turns(conversation_id, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
