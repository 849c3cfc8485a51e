//! RAG pipeline: glues query processing, hybrid retrieval, ranking, and
//! context packing, then assembles the final prompt from a template.
//!
//! Strategy selection: hybrid search when the processed query yields at
//! least `HYBRID_KEYWORD_THRESHOLD` keywords, otherwise plain search with
//! similarity expansion. When fewer than `min_results` ranked documents
//! survive, one fallback pass re-runs retrieval with the similarity floor
//! and looser diversity before giving up.
//!
//! Prompt templates are data, selected by query type; an empty context
//! switches to a dedicated no-context template that instructs the model
//! to acknowledge the absence.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::debug;

use crate::bus::ProgressBus;
use crate::config::RetrievalConfig;
use crate::context::{Citation, ContextFormatter, FormattedContext};
use crate::error::Result;
use crate::models::SearchFilters;
use crate::query::{self, ProcessedQuery, QueryType};
use crate::ranker::{RankOptions, Ranker};
use crate::vector_search::{SearchOptions, VectorSearch};

/// Diversity threshold used by the relaxed fallback pass.
const FALLBACK_DIVERSITY: f64 = 0.95;

const DEFAULT_SYSTEM: &str = "You are a personal assistant with access to the user's own data: \
email, calendar, and listening history. Answer the question using the retrieved documents below.";

const ANALYTICAL_SYSTEM: &str = "You are a personal analyst. Examine the retrieved documents \
below for patterns, frequencies, and trends relevant to the question, and summarize what the \
data actually shows.";

const CONVERSATIONAL_SYSTEM: &str = "You are a friendly personal assistant. Use the retrieved \
documents below to give a helpful, conversational answer with concrete suggestions.";

const INSTRUCTIONS: &str = "Instructions: cite documents by number (for example [Document 2]). \
Prefer the retrieved context over general knowledge. If the context does not contain enough \
information to answer, say so.";

const NO_CONTEXT_SYSTEM: &str = "You are a personal assistant. No documents relevant to the \
question were found in the user's data. Tell the user that nothing was found and suggest how \
they might rephrase, connect more sources, or sync recent data. Do not invent facts.";

/// Retrieval bookkeeping returned alongside the prompt.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalMetadata {
    /// `"hybrid"` or `"semantic"`.
    pub strategy: String,
    /// Hits returned by search before ranking.
    pub candidates: usize,
    /// Documents surviving ranking and diversification.
    pub ranked: usize,
    /// Documents packed into the context.
    pub selected: usize,
    pub fallback_used: bool,
}

/// Everything the chat layer needs to call the model and answer.
#[derive(Debug, Clone)]
pub struct RagOutput {
    pub prompt: String,
    pub context: FormattedContext,
    pub citations: Vec<Citation>,
    pub processed_query: ProcessedQuery,
    pub retrieval: RetrievalMetadata,
}

pub struct RagPipeline {
    search: Arc<VectorSearch>,
    ranker: Ranker,
    formatter: ContextFormatter,
    bus: ProgressBus,
    retrieval: RetrievalConfig,
}

impl RagPipeline {
    pub fn new(
        search: Arc<VectorSearch>,
        retrieval: RetrievalConfig,
        bus: ProgressBus,
    ) -> Self {
        Self {
            ranker: Ranker::new(&retrieval),
            formatter: ContextFormatter::new(retrieval.max_context_tokens),
            search,
            bus,
            retrieval,
        }
    }

    /// Run the full pipeline for one query.
    pub async fn run(&self, user_id: &str, query_id: &str, raw_query: &str) -> Result<RagOutput> {
        let processed = query::process(raw_query)?;
        self.progress(query_id, user_id, "processing_query", &processed.intent);

        let options = SearchOptions {
            top_k: self.retrieval.default_top_k,
            min_similarity: self.retrieval.default_min_similarity,
            filters: to_search_filters(&processed),
        };

        let hybrid = processed.keywords.len() >= self.retrieval.hybrid_keyword_threshold;
        self.progress(query_id, user_id, "searching", &processed.intent);
        let hits = if hybrid {
            self.search
                .hybrid_search(user_id, raw_query, &processed.keywords, &options)
                .await?
        } else {
            self.search
                .search_with_expansion(user_id, raw_query, &options)
                .await?
        };
        let candidates = hits.len();

        self.progress(query_id, user_id, "ranking", &processed.intent);
        let rank_options = RankOptions {
            diversify: true,
            diversity_threshold: None,
            intent_source: processed.intent.source(),
        };
        let mut ranked = self.ranker.rank(hits, &processed, &rank_options);
        let mut fallback_used = false;

        // Relaxed pass: similarity floor, looser diversity.
        if ranked.len() < self.retrieval.min_results
            && self.retrieval.min_similarity_floor < options.min_similarity
        {
            debug!(query_id, "falling back to relaxed retrieval");
            fallback_used = true;
            let relaxed = SearchOptions {
                top_k: options.top_k,
                min_similarity: self.retrieval.min_similarity_floor,
                filters: options.filters.clone(),
            };
            let hits = if hybrid {
                self.search
                    .hybrid_search(user_id, raw_query, &processed.keywords, &relaxed)
                    .await?
            } else {
                self.search.search(user_id, raw_query, &relaxed).await?
            };
            ranked = self.ranker.rank(
                hits,
                &processed,
                &RankOptions {
                    diversify: true,
                    diversity_threshold: Some(FALLBACK_DIVERSITY),
                    intent_source: processed.intent.source(),
                },
            );
        }

        self.progress(query_id, user_id, "formatting", &processed.intent);
        let context = self.formatter.format(&ranked);
        let prompt = build_prompt(processed.query_type, &context, raw_query);

        let retrieval = RetrievalMetadata {
            strategy: if hybrid { "hybrid" } else { "semantic" }.to_string(),
            candidates,
            ranked: ranked.len(),
            selected: context.selected,
            fallback_used,
        };

        Ok(RagOutput {
            prompt,
            citations: context.citations.clone(),
            context,
            processed_query: processed,
            retrieval,
        })
    }

    /// The ranked documents for one query without prompt assembly; used by
    /// the explain/debug surface.
    pub fn ranker(&self) -> &Ranker {
        &self.ranker
    }

    fn progress(
        &self,
        query_id: &str,
        user_id: &str,
        stage: &str,
        intent: &crate::query::QueryIntent,
    ) {
        self.bus.rag_progress(
            query_id,
            user_id,
            json!({ "stage": stage, "intent": intent.as_str() }),
        );
    }
}

fn to_search_filters(processed: &ProcessedQuery) -> SearchFilters {
    SearchFilters {
        source: processed.filters.source,
        doc_type: None,
        author: processed.filters.author.clone(),
        time_range: processed.filters.time_range.clone(),
    }
}

/// Concatenate system block, context, instruction block, and question.
pub fn build_prompt(query_type: QueryType, context: &FormattedContext, question: &str) -> String {
    if context.is_empty() {
        return format!(
            "{NO_CONTEXT_SYSTEM}\n\nQuestion: {question}"
        );
    }

    let system = match query_type {
        QueryType::Pattern => ANALYTICAL_SYSTEM,
        QueryType::Recommendation => CONVERSATIONAL_SYSTEM,
        QueryType::MemoryRecall | QueryType::General => DEFAULT_SYSTEM,
    };

    format!(
        "{system}\n\nRetrieved context:\n{context}\n\n{INSTRUCTIONS}\n\nQuestion: {question}",
        context = context.text
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NO_CONTEXT_SENTINEL;

    fn empty_context() -> FormattedContext {
        FormattedContext {
            text: NO_CONTEXT_SENTINEL.to_string(),
            citations: Vec::new(),
            tokens_used: 0,
            total_candidates: 0,
            selected: 0,
        }
    }

    fn filled_context() -> FormattedContext {
        FormattedContext {
            text: "[Document 1]\nSource: email\n\nhello\n---\nRetrieved 1 document (email: 1)"
                .to_string(),
            citations: Vec::new(),
            tokens_used: 20,
            total_candidates: 1,
            selected: 1,
        }
    }

    #[test]
    fn empty_context_uses_no_context_template() {
        let prompt = build_prompt(QueryType::General, &empty_context(), "find zxq9");
        assert!(prompt.contains("nothing was found") || prompt.contains("No documents relevant"));
        assert!(prompt.contains("find zxq9"));
        assert!(!prompt.contains("Retrieved context:"));
    }

    #[test]
    fn templates_select_by_query_type() {
        let context = filled_context();
        let analytical = build_prompt(QueryType::Pattern, &context, "how often?");
        assert!(analytical.contains("personal analyst"));

        let conversational = build_prompt(QueryType::Recommendation, &context, "suggest?");
        assert!(conversational.contains("friendly personal assistant"));

        let default = build_prompt(QueryType::MemoryRecall, &context, "what?");
        assert!(default.contains("personal assistant with access"));
    }

    #[test]
    fn prompt_contains_context_instructions_and_question() {
        let prompt = build_prompt(QueryType::General, &filled_context(), "what did Ravi say?");
        assert!(prompt.contains("[Document 1]"));
        assert!(prompt.contains("cite documents by number"));
        assert!(prompt.ends_with("Question: what did Ravi say?"));
    }
}
