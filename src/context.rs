//! Context formatter: packs ranked documents into a token-budgeted context
//! block and emits citation records.
//!
//! Documents are added greedily in priority order; one whose rendering
//! alone exceeds the remaining budget is skipped, never split. Each
//! rendered document is wrapped between `[Document N]` and a separator,
//! and citation N always refers to that block.

use serde::Serialize;

use crate::embedding::estimate_tokens;
use crate::models::DocumentSource;
use crate::ranker::RankedDocument;

/// Emitted when no documents fit or none were supplied.
pub const NO_CONTEXT_SENTINEL: &str =
    "No relevant documents were retrieved for this question.";

const SEPARATOR: &str = "---";

/// Numbered source reference the model can cite.
#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    /// Matches the `[Document N]` marker in the context text.
    pub id: usize,
    pub document_id: String,
    pub source: DocumentSource,
    pub title: Option<String>,
    pub date: String,
    pub author: Option<String>,
}

/// The packed context plus bookkeeping for the response metadata.
#[derive(Debug, Clone, Serialize)]
pub struct FormattedContext {
    pub text: String,
    pub citations: Vec<Citation>,
    /// Estimated tokens consumed by the selected documents.
    pub tokens_used: usize,
    /// Documents offered to the formatter.
    pub total_candidates: usize,
    /// Documents that fit the budget.
    pub selected: usize,
}

impl FormattedContext {
    pub fn is_empty(&self) -> bool {
        self.selected == 0
    }
}

#[derive(Clone)]
pub struct ContextFormatter {
    max_tokens: usize,
}

impl ContextFormatter {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    /// Pack ranked documents under the token budget.
    pub fn format(&self, ranked: &[RankedDocument]) -> FormattedContext {
        let mut blocks: Vec<String> = Vec::new();
        let mut citations: Vec<Citation> = Vec::new();
        let mut tokens_used = 0usize;

        for doc in ranked {
            let index = blocks.len() + 1;
            let rendered = render_document(index, doc);
            let tokens = estimate_tokens(&rendered) as usize;

            if tokens_used + tokens > self.max_tokens {
                continue;
            }

            tokens_used += tokens;
            citations.push(Citation {
                id: index,
                document_id: doc.hit.document_id.clone(),
                source: doc.hit.source,
                title: doc.hit.title.clone(),
                date: doc.hit.timestamp.format("%Y-%m-%d").to_string(),
                author: doc.hit.author.clone(),
            });
            blocks.push(rendered);
        }

        if blocks.is_empty() {
            return FormattedContext {
                text: NO_CONTEXT_SENTINEL.to_string(),
                citations: Vec::new(),
                tokens_used: 0,
                total_candidates: ranked.len(),
                selected: 0,
            };
        }

        let mut text = blocks.join("\n");
        text.push('\n');
        text.push_str(&footer(&citations));

        FormattedContext {
            selected: blocks.len(),
            total_candidates: ranked.len(),
            text,
            citations,
            tokens_used,
        }
    }
}

fn render_document(index: usize, doc: &RankedDocument) -> String {
    let hit = &doc.hit;
    let mut lines = vec![format!("[Document {index}]")];

    if let Some(title) = &hit.title {
        lines.push(format!("Title: {title}"));
    }
    lines.push(format!("Source: {}", hit.source));
    lines.push(format!(
        "Date: {}",
        hit.timestamp.format("%Y-%m-%d %H:%M")
    ));
    if let Some(author) = &hit.author {
        lines.push(format!("Author: {author}"));
    }
    lines.push(format!("Relevance: {:.2}", doc.final_score));

    for line in metadata_lines(hit) {
        lines.push(line);
    }

    lines.push(String::new());
    lines.push(hit.content.clone());
    lines.push(SEPARATOR.to_string());

    lines.join("\n")
}

/// Source-specific metadata lines pulled from the document's blob.
fn metadata_lines(hit: &crate::models::SearchHit) -> Vec<String> {
    let meta = &hit.metadata;
    let field = |key: &str| -> Option<String> {
        meta.get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let list = |key: &str| -> Option<String> {
        meta.get(key).and_then(|v| v.as_array()).and_then(|items| {
            let joined: Vec<&str> = items.iter().filter_map(|i| i.as_str()).collect();
            if joined.is_empty() {
                None
            } else {
                Some(joined.join(", "))
            }
        })
    };

    let mut lines = Vec::new();
    match hit.source {
        DocumentSource::Email => {
            if let Some(to) = field("to") {
                lines.push(format!("To: {to}"));
            }
            if let Some(labels) = list("labels") {
                lines.push(format!("Labels: {labels}"));
            }
        }
        DocumentSource::Calendar => {
            if let Some(attendees) = list("attendees") {
                lines.push(format!("Attendees: {attendees}"));
            }
            if let Some(location) = field("location") {
                lines.push(format!("Location: {location}"));
            }
        }
        DocumentSource::Music => {
            if let Some(artist) = field("artist") {
                lines.push(format!("Artist: {artist}"));
            }
            if let Some(album) = field("album") {
                lines.push(format!("Album: {album}"));
            }
        }
    }
    lines
}

/// Total count plus per-source breakdown.
fn footer(citations: &[Citation]) -> String {
    let mut by_source: Vec<(DocumentSource, usize)> = Vec::new();
    for citation in citations {
        match by_source.iter_mut().find(|(s, _)| *s == citation.source) {
            Some((_, count)) => *count += 1,
            None => by_source.push((citation.source, 1)),
        }
    }

    let breakdown: Vec<String> = by_source
        .iter()
        .map(|(source, count)| format!("{source}: {count}"))
        .collect();

    format!(
        "Retrieved {} document{} ({})",
        citations.len(),
        if citations.len() == 1 { "" } else { "s" },
        breakdown.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentType, SearchHit};
    use crate::ranker::ScoreSignals;
    use chrono::{TimeZone, Utc};

    fn ranked(
        id: &str,
        source: DocumentSource,
        content: &str,
        score: f64,
        metadata: serde_json::Value,
    ) -> RankedDocument {
        RankedDocument {
            hit: SearchHit {
                document_id: id.to_string(),
                source,
                doc_type: DocumentType::Message,
                title: Some(format!("title of {id}")),
                author: Some("Ravi".to_string()),
                content: content.to_string(),
                timestamp: Utc.with_ymd_and_hms(2025, 10, 1, 9, 30, 0).unwrap(),
                metadata,
                similarity: score,
                keyword_boost: 0.0,
            },
            final_score: score,
            signals: ScoreSignals {
                vector: score,
                recency: 1.0,
                keyword: 0.0,
                source: 1.0,
                length: 1.0,
            },
        }
    }

    #[test]
    fn empty_input_yields_sentinel() {
        let formatter = ContextFormatter::new(1000);
        let context = formatter.format(&[]);
        assert_eq!(context.text, NO_CONTEXT_SENTINEL);
        assert!(context.citations.is_empty());
        assert!(context.is_empty());
    }

    #[test]
    fn documents_render_with_numbered_blocks() {
        let formatter = ContextFormatter::new(10_000);
        let docs = vec![
            ranked(
                "email_m1",
                DocumentSource::Email,
                "budget discussion",
                0.9,
                serde_json::json!({"to": "me@example.com", "labels": ["INBOX"]}),
            ),
            ranked(
                "music_t1",
                DocumentSource::Music,
                "a song I liked",
                0.7,
                serde_json::json!({"artist": "Ana", "album": "Blue"}),
            ),
        ];

        let context = formatter.format(&docs);
        assert!(context.text.contains("[Document 1]"));
        assert!(context.text.contains("[Document 2]"));
        assert!(context.text.contains("To: me@example.com"));
        assert!(context.text.contains("Labels: INBOX"));
        assert!(context.text.contains("Artist: Ana"));
        assert!(context.text.contains("Retrieved 2 documents (email: 1, music: 1)"));
        assert_eq!(context.selected, 2);
    }

    #[test]
    fn citations_match_document_numbers() {
        let formatter = ContextFormatter::new(10_000);
        let docs = vec![
            ranked("a", DocumentSource::Email, "first", 0.9, serde_json::json!({})),
            ranked("b", DocumentSource::Email, "second", 0.8, serde_json::json!({})),
            ranked("c", DocumentSource::Email, "third", 0.7, serde_json::json!({})),
        ];

        let context = formatter.format(&docs);
        for citation in &context.citations {
            assert!(context.text.contains(&format!("[Document {}]", citation.id)));
        }
        assert_eq!(context.citations.len(), 3);
        assert_eq!(context.citations[1].document_id, "b");
    }

    #[test]
    fn budget_is_never_exceeded() {
        // Each doc renders to roughly 60 tokens; a 100-token budget fits
        // exactly one.
        let formatter = ContextFormatter::new(100);
        let body = "word ".repeat(40);
        let docs = vec![
            ranked("a", DocumentSource::Email, &body, 0.9, serde_json::json!({})),
            ranked("b", DocumentSource::Email, &body, 0.8, serde_json::json!({})),
            ranked("c", DocumentSource::Email, &body, 0.7, serde_json::json!({})),
        ];

        let context = formatter.format(&docs);
        assert!(context.tokens_used <= 100);
        assert!(context.selected >= 1);
        assert!(context.selected < 3);
        assert_eq!(context.total_candidates, 3);
    }

    #[test]
    fn oversized_document_is_skipped_not_split() {
        let formatter = ContextFormatter::new(200);
        let huge = "x".repeat(10_000);
        let small = "a short note about the budget";
        let docs = vec![
            ranked("huge", DocumentSource::Email, &huge, 0.95, serde_json::json!({})),
            ranked("small", DocumentSource::Email, small, 0.5, serde_json::json!({})),
        ];

        let context = formatter.format(&docs);
        assert_eq!(context.selected, 1);
        assert_eq!(context.citations[0].document_id, "small");
        // The skipped document must not leak into the text.
        assert!(!context.text.contains("xxxx"));
    }
}
