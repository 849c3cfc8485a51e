//! Email connector.
//!
//! Pages through the upstream mail API with a page-token cursor, fetches
//! message bodies in bounded-concurrency sub-batches, and normalizes each
//! message into the unified document schema.
//!
//! # Fetch workflow
//!
//! 1. Obtain a currently valid access token for `(user, email)`.
//! 2. `GET /messages?q=after:YYYY/MM/DD&maxResults=N[&pageToken=...]` —
//!    returns message ids plus an optional `nextPageToken`.
//! 3. Per page, fetch full messages in sub-batches (≤50) concurrently,
//!    skipping individual failures with a warning.
//! 4. Sleep ~100 ms between pages and sub-batches to avoid bursts.
//!
//! # Normalization
//!
//! The `text/plain` body is preferred; otherwise HTML is stripped
//! (script/style removed, tags dropped, entities decoded, whitespace
//! collapsed). Sender signature blocks after the `-- ` marker are dropped,
//! overly long content is truncated, and `document_id` becomes
//! `email_<upstream id>`. Messages whose body is empty after cleanup are
//! dropped with a warning, not persisted.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::warn;

use crate::config::EmailConfig;
use crate::connector::{FetchOptions, RawRecord, SourceConnector};
use crate::credentials::CredentialStore;
use crate::error::{RecallError, Result};
use crate::models::{Document, DocumentSource, DocumentType};

/// Pause between pages and between body sub-batches.
const PACING_DELAY: Duration = Duration::from_millis(100);

pub struct EmailConnector {
    client: reqwest::Client,
    api_url: String,
    page_size: usize,
    fetch_batch_size: usize,
    credentials: CredentialStore,
}

impl EmailConnector {
    pub fn new(config: &EmailConfig, credentials: CredentialStore) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            page_size: config.page_size,
            fetch_batch_size: config.fetch_batch_size.min(50),
            credentials,
        }
    }

    /// List one page of message ids.
    async fn list_page(
        &self,
        token: &str,
        query: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>)> {
        let mut request = self
            .client
            .get(format!("{}/messages", self.api_url))
            .bearer_auth(token)
            .query(&[("maxResults", self.page_size.to_string())]);
        if let Some(q) = query {
            request = request.query(&[("q", q)]);
        }
        if let Some(pt) = page_token {
            request = request.query(&[("pageToken", pt)]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                return Err(RecallError::rate_limited("email", detail));
            }
            return Err(RecallError::external(
                "email",
                format!("list failed: {status}: {detail}"),
            ));
        }

        let payload: serde_json::Value = response.json().await?;
        let ids = payload
            .get("messages")
            .and_then(|m| m.as_array())
            .map(|messages| {
                messages
                    .iter()
                    .filter_map(|m| m.get("id").and_then(|id| id.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let next = payload
            .get("nextPageToken")
            .and_then(|t| t.as_str())
            .map(str::to_string);

        Ok((ids, next))
    }

    /// Fetch one full message.
    async fn get_message(&self, token: &str, id: &str) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(format!("{}/messages/{id}", self.api_url))
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RecallError::external(
                "email",
                format!("fetch message {id} failed: {status}"),
            ));
        }
        Ok(response.json().await?)
    }

    /// Page through the list endpoint and fetch bodies, skipping
    /// individual message failures.
    async fn fetch_with_query(
        &self,
        user_id: &str,
        query: Option<String>,
        limit: Option<usize>,
    ) -> Result<Vec<RawRecord>> {
        let token = self
            .credentials
            .access_token(user_id, DocumentSource::Email)
            .await?;

        let mut records = Vec::new();
        let mut page_token: Option<String> = None;
        let mut first_page = true;

        loop {
            if !first_page {
                tokio::time::sleep(PACING_DELAY).await;
            }
            first_page = false;

            let (ids, next) = self
                .list_page(&token, query.as_deref(), page_token.as_deref())
                .await?;

            for (batch_index, batch) in ids.chunks(self.fetch_batch_size).enumerate() {
                if batch_index > 0 {
                    tokio::time::sleep(PACING_DELAY).await;
                }

                let fetches = batch.iter().map(|id| self.get_message(&token, id));
                for (id, result) in batch.iter().zip(futures::future::join_all(fetches).await) {
                    match result {
                        Ok(payload) => {
                            let timestamp = internal_date(&payload).unwrap_or_else(Utc::now);
                            records.push(RawRecord {
                                id: id.clone(),
                                timestamp,
                                payload,
                            });
                        }
                        Err(e) => warn!(message_id = %id, error = %e, "skipping message"),
                    }
                }

                if let Some(max) = limit {
                    if records.len() >= max {
                        records.truncate(max);
                        return Ok(records);
                    }
                }
            }

            match next {
                Some(t) => page_token = Some(t),
                None => break,
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl SourceConnector for EmailConnector {
    fn source(&self) -> DocumentSource {
        DocumentSource::Email
    }

    async fn authenticate(&self, user_id: &str) -> Result<()> {
        self.credentials
            .access_token(user_id, DocumentSource::Email)
            .await
            .map(|_| ())
    }

    async fn fetch_all(&self, user_id: &str, options: &FetchOptions) -> Result<Vec<RawRecord>> {
        let query = options.since.map(after_query);
        self.fetch_with_query(user_id, query, options.limit).await
    }

    async fn fetch_new(&self, user_id: &str, since: DateTime<Utc>) -> Result<Vec<RawRecord>> {
        self.fetch_with_query(user_id, Some(after_query(since)), None)
            .await
    }

    fn normalize(&self, user_id: &str, raw: &RawRecord) -> Result<Option<Document>> {
        let payload = &raw.payload;
        let content = extract_body(payload);
        let content = strip_signature(&content);

        if content.trim().is_empty() {
            warn!(message_id = %raw.id, "dropping message with empty body after cleanup");
            return Ok(None);
        }

        let headers = payload.get("headers");
        let header = |name: &str| -> Option<String> {
            headers
                .and_then(|h| h.get(name))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        let metadata = serde_json::json!({
            "from": header("From"),
            "to": header("To"),
            "subject": header("Subject"),
            "labels": payload.get("labels").cloned().unwrap_or_default(),
            "thread_id": payload.get("threadId").cloned().unwrap_or_default(),
            "snippet": payload.get("snippet").cloned().unwrap_or_default(),
        });

        let mut doc = Document::new(
            format!("email_{}", raw.id),
            user_id,
            DocumentSource::Email,
            DocumentType::Message,
            content.to_string(),
            raw.timestamp,
        )
        .with_metadata(metadata);

        if let Some(subject) = header("Subject") {
            doc = doc.with_title(subject);
        }
        if let Some(from) = header("From") {
            doc = doc.with_author(from);
        }

        Ok(Some(doc))
    }

    async fn validate_connection(&self, user_id: &str) -> Result<bool> {
        let token = match self
            .credentials
            .access_token(user_id, DocumentSource::Email)
            .await
        {
            Ok(t) => t,
            Err(_) => return Ok(false),
        };
        Ok(self.list_page(&token, None, None).await.is_ok())
    }
}

/// Translate `since` into the upstream-native after-date query.
fn after_query(since: DateTime<Utc>) -> String {
    format!("after:{}", since.format("%Y/%m/%d"))
}

/// The upstream internal timestamp (epoch milliseconds, possibly a string).
fn internal_date(payload: &serde_json::Value) -> Option<DateTime<Utc>> {
    let raw = payload.get("internalDate")?;
    let millis = raw
        .as_i64()
        .or_else(|| raw.as_str().and_then(|s| s.parse().ok()))?;
    DateTime::from_timestamp_millis(millis)
}

/// Prefer the `text/plain` part; otherwise strip the HTML part.
fn extract_body(payload: &serde_json::Value) -> String {
    let body = payload.get("body");
    if let Some(plain) = body
        .and_then(|b| b.get("plain"))
        .and_then(|p| p.as_str())
        .filter(|p| !p.trim().is_empty())
    {
        return plain.to_string();
    }
    if let Some(html) = body.and_then(|b| b.get("html")).and_then(|h| h.as_str()) {
        return strip_html(html);
    }
    String::new()
}

fn script_style_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").expect("valid regex")
    })
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("valid regex"))
}

/// Strip HTML down to plain text: script/style blocks removed, tags
/// dropped, common entities decoded, whitespace collapsed.
pub fn strip_html(html: &str) -> String {
    let without_blocks = script_style_re().replace_all(html, " ");
    let without_tags = tag_re().replace_all(&without_blocks, " ");

    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'");

    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drop everything after the conventional `-- ` signature marker.
pub fn strip_signature(content: &str) -> &str {
    for marker in ["\n-- \n", "\n-- \r\n"] {
        if let Some(pos) = content.find(marker) {
            return &content[..pos];
        }
    }
    if content.starts_with("-- \n") {
        return "";
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector_payload(plain: Option<&str>, html: Option<&str>) -> serde_json::Value {
        serde_json::json!({
            "id": "m1",
            "threadId": "t1",
            "internalDate": "1759327200000",
            "snippet": "snippet text",
            "headers": {
                "From": "Ravi Kumar <ravi@example.com>",
                "To": "me@example.com",
                "Subject": "Q4 budget"
            },
            "labels": ["INBOX"],
            "body": { "plain": plain, "html": html }
        })
    }

    fn test_connector() -> EmailConnector {
        // The credential store is never hit by normalize().
        let pool = sqlx::SqlitePool::connect_lazy("sqlite::memory:").expect("pool");
        EmailConnector::new(
            &EmailConfig {
                api_url: "http://localhost:0".into(),
                page_size: 100,
                fetch_batch_size: 50,
            },
            CredentialStore::new(pool),
        )
    }

    #[test]
    fn strip_html_drops_scripts_and_tags() {
        let html = r#"<html><head><style>p{color:red}</style></head>
            <body><script>alert(1)</script><p>Hello &amp; welcome</p></body></html>"#;
        assert_eq!(strip_html(html), "Hello & welcome");
    }

    #[test]
    fn strip_html_decodes_entities() {
        assert_eq!(strip_html("a &lt;b&gt; &quot;c&quot;&nbsp;d"), "a <b> \"c\" d");
    }

    #[test]
    fn signature_block_is_dropped() {
        let body = "See you tomorrow.\n-- \nRavi Kumar\nVP of Budgets";
        assert_eq!(strip_signature(body), "See you tomorrow.");
    }

    #[test]
    fn double_dash_without_space_is_kept() {
        let body = "version bump\n--\nnot a signature";
        assert_eq!(strip_signature(body), body);
    }

    #[tokio::test]
    async fn normalize_prefers_plain_text() {
        let connector = test_connector();
        let raw = RawRecord {
            id: "m1".into(),
            timestamp: Utc::now(),
            payload: connector_payload(Some("plain body"), Some("<p>html body</p>")),
        };
        let doc = connector.normalize("u1", &raw).expect("ok").expect("doc");
        assert_eq!(doc.document_id, "email_m1");
        assert_eq!(doc.content, "plain body");
        assert_eq!(doc.title.as_deref(), Some("Q4 budget"));
        assert_eq!(doc.author.as_deref(), Some("Ravi Kumar <ravi@example.com>"));
        assert_eq!(doc.metadata["thread_id"], "t1");
        assert!(doc.needs_embedding);
    }

    #[tokio::test]
    async fn normalize_falls_back_to_html() {
        let connector = test_connector();
        let raw = RawRecord {
            id: "m2".into(),
            timestamp: Utc::now(),
            payload: connector_payload(None, Some("<p>from &amp; html</p>")),
        };
        let doc = connector.normalize("u1", &raw).expect("ok").expect("doc");
        assert_eq!(doc.content, "from & html");
    }

    #[tokio::test]
    async fn normalize_drops_empty_bodies() {
        let connector = test_connector();
        let raw = RawRecord {
            id: "m3".into(),
            timestamp: Utc::now(),
            payload: connector_payload(Some("-- \nonly a signature"), None),
        };
        // The body is a bare signature; nothing usable remains.
        assert!(connector.normalize("u1", &raw).expect("ok").is_none());
    }

    #[test]
    fn after_query_uses_upstream_date_format() {
        let since = DateTime::parse_from_rfc3339("2025-09-01T10:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(after_query(since), "after:2025/09/01");
    }

    #[test]
    fn internal_date_accepts_string_millis() {
        let payload = serde_json::json!({"internalDate": "1759327200000"});
        let ts = internal_date(&payload).expect("timestamp");
        assert_eq!(ts.timestamp(), 1_759_327_200);
    }
}
