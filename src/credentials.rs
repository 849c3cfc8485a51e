//! Credential lookup for `(user, source)` pairs.
//!
//! Token acquisition and encryption are handled by the external identity
//! layer; this module only answers "a currently valid access token for
//! (user, source)". Tokens are stored opaquely in the single `credentials`
//! table.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::{RecallError, Result};
use crate::models::DocumentSource;

#[derive(Debug, Clone)]
pub struct Credential {
    pub user_id: String,
    pub source: DocumentSource,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Option<String>,
}

impl Credential {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Clone)]
pub struct CredentialStore {
    pool: SqlitePool,
}

impl CredentialStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(
        &self,
        user_id: &str,
        source: DocumentSource,
    ) -> Result<Option<Credential>> {
        let row = sqlx::query("SELECT * FROM credentials WHERE user_id = ? AND source = ?")
            .bind(user_id)
            .bind(source.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| Credential {
            user_id: r.get("user_id"),
            source,
            access_token: r.get("access_token"),
            refresh_token: r.get("refresh_token"),
            expires_at: r
                .get::<Option<i64>, _>("expires_at")
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
            scopes: r.get("scopes"),
        }))
    }

    /// A currently valid access token for `(user, source)`.
    ///
    /// # Errors
    ///
    /// [`RecallError::NotFound`] when the source was never connected,
    /// [`RecallError::Validation`] when the stored token has expired (the
    /// identity layer must refresh it first).
    pub async fn access_token(&self, user_id: &str, source: DocumentSource) -> Result<String> {
        let credential = self.get(user_id, source).await?.ok_or_else(|| {
            RecallError::not_found(format!("no credentials for user {user_id} and {source}"))
        })?;

        if credential.is_expired(Utc::now()) {
            return Err(RecallError::validation(format!(
                "access token for {source} has expired"
            )));
        }

        Ok(credential.access_token)
    }

    pub async fn upsert(&self, credential: &Credential) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO credentials (user_id, source, access_token, refresh_token,
                                     expires_at, scopes, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, source) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                scopes = excluded.scopes,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&credential.user_id)
        .bind(credential.source.as_str())
        .bind(&credential.access_token)
        .bind(&credential.refresh_token)
        .bind(credential.expires_at.map(|t| t.timestamp()))
        .bind(&credential.scopes)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn expiry_check() {
        let now = Utc::now();
        let mut credential = Credential {
            user_id: "u1".into(),
            source: DocumentSource::Email,
            access_token: "tok".into(),
            refresh_token: None,
            expires_at: None,
            scopes: None,
        };
        assert!(!credential.is_expired(now));

        credential.expires_at = Some(now + Duration::hours(1));
        assert!(!credential.is_expired(now));

        credential.expires_at = Some(now - Duration::seconds(1));
        assert!(credential.is_expired(now));
    }
}
