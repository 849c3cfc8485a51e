//! Result ranker: re-scores search hits with weighted signals and
//! diversifies the final list.
//!
//! The final score is the dot product of the configured weights and five
//! per-document sub-scores, each in `[0, 1]`:
//!
//! | Signal | Meaning |
//! |--------|---------|
//! | vector | cosine similarity from search |
//! | recency | exponential decay with a configurable half-life |
//! | keyword | query keyword presence in title/author/content |
//! | source | per-source priority table |
//! | length | preference for the 200–2000 character window |
//!
//! An intent boost multiplies the score of documents whose source matches
//! the query intent, then the list is re-sorted. Diversification drops
//! candidates whose 200-character content prefix is nearly identical
//! (Jaccard word overlap above the threshold) to an already-kept result.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;

use crate::config::{RankerWeights, RetrievalConfig, SourcePriority};
use crate::models::{DocumentSource, SearchHit};
use crate::query::ProcessedQuery;

/// Characters of content considered for near-duplicate detection.
const DIVERSITY_PREFIX_CHARS: usize = 200;

/// Per-signal sub-scores, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ScoreSignals {
    pub vector: f64,
    pub recency: f64,
    pub keyword: f64,
    pub source: f64,
    pub length: f64,
}

/// A hit with its computed score and signal breakdown.
#[derive(Debug, Clone, Serialize)]
pub struct RankedDocument {
    pub hit: SearchHit,
    pub final_score: f64,
    pub signals: ScoreSignals,
}

/// Full scoring explanation for one ranked result.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreBreakdown {
    pub signals: ScoreSignals,
    pub weights: WeightedContributions,
    pub final_score: f64,
}

/// Weight × signal for each component.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WeightedContributions {
    pub vector: f64,
    pub recency: f64,
    pub keyword: f64,
    pub source: f64,
    pub length: f64,
}

/// Per-call ranking options.
#[derive(Debug, Clone)]
pub struct RankOptions {
    pub diversify: bool,
    /// Overrides the configured diversity threshold (used by the relaxed
    /// fallback pass).
    pub diversity_threshold: Option<f64>,
    /// Source matching the query intent, if any; matching documents get
    /// the intent boost.
    pub intent_source: Option<DocumentSource>,
}

impl Default for RankOptions {
    fn default() -> Self {
        Self {
            diversify: true,
            diversity_threshold: None,
            intent_source: None,
        }
    }
}

#[derive(Clone)]
pub struct Ranker {
    weights: RankerWeights,
    recency_decay_days: f64,
    source_priority: SourcePriority,
    intent_boost: f64,
    diversity_threshold: f64,
}

impl Ranker {
    pub fn new(config: &RetrievalConfig) -> Self {
        Self {
            weights: config.weights,
            recency_decay_days: config.recency_decay_days,
            source_priority: config.source_priority,
            intent_boost: config.intent_boost,
            diversity_threshold: config.diversity_threshold,
        }
    }

    /// Rank hits for a processed query using the current clock.
    pub fn rank(
        &self,
        hits: Vec<SearchHit>,
        query: &ProcessedQuery,
        options: &RankOptions,
    ) -> Vec<RankedDocument> {
        self.rank_at(hits, query, options, Utc::now())
    }

    /// Rank against an explicit `now` (deterministic for tests).
    pub fn rank_at(
        &self,
        hits: Vec<SearchHit>,
        query: &ProcessedQuery,
        options: &RankOptions,
        now: DateTime<Utc>,
    ) -> Vec<RankedDocument> {
        let mut ranked: Vec<RankedDocument> = hits
            .into_iter()
            .map(|hit| {
                let signals = self.signals_for(&hit, query, now);
                let mut score = self.weighted_sum(&signals).clamp(0.0, 1.0);

                if options.intent_source == Some(hit.source) {
                    score = (score * self.intent_boost).clamp(0.0, 1.0);
                }

                RankedDocument {
                    hit,
                    final_score: score,
                    signals,
                }
            })
            .collect();

        sort_ranked(&mut ranked);

        if options.diversify {
            let threshold = options
                .diversity_threshold
                .unwrap_or(self.diversity_threshold);
            ranked = diversify(ranked, threshold);
        }

        ranked
    }

    /// The full per-signal breakdown for one ranked result.
    pub fn explain(&self, ranked: &RankedDocument) -> ScoreBreakdown {
        let s = &ranked.signals;
        ScoreBreakdown {
            signals: *s,
            weights: WeightedContributions {
                vector: self.weights.vector * s.vector,
                recency: self.weights.recency * s.recency,
                keyword: self.weights.keyword * s.keyword,
                source: self.weights.source * s.source,
                length: self.weights.length * s.length,
            },
            final_score: ranked.final_score,
        }
    }

    fn signals_for(
        &self,
        hit: &SearchHit,
        query: &ProcessedQuery,
        now: DateTime<Utc>,
    ) -> ScoreSignals {
        ScoreSignals {
            vector: hit.similarity.clamp(0.0, 1.0),
            recency: self.recency_score(hit.timestamp, now),
            keyword: self.keyword_score(hit, query),
            source: self.source_score(hit.source),
            length: length_score(hit.content.chars().count()),
        }
    }

    fn weighted_sum(&self, s: &ScoreSignals) -> f64 {
        self.weights.vector * s.vector
            + self.weights.recency * s.recency
            + self.weights.keyword * s.keyword
            + self.weights.source * s.source
            + self.weights.length * s.length
    }

    /// Exponential decay with half-life `recency_decay_days`.
    fn recency_score(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let days_old = (now - timestamp).num_seconds().max(0) as f64 / 86_400.0;
        (-days_old * std::f64::consts::LN_2 / self.recency_decay_days)
            .exp()
            .clamp(0.0, 1.0)
    }

    /// Keyword presence: +0.4 title, +0.3 author, +0.2 content per
    /// keyword, +0.5 when the raw query appears verbatim in the content;
    /// normalized by keyword count and capped at 1. A keyword boost from
    /// hybrid search blends in at half weight.
    fn keyword_score(&self, hit: &SearchHit, query: &ProcessedQuery) -> f64 {
        let title = hit.title.as_deref().unwrap_or("").to_lowercase();
        let author = hit.author.as_deref().unwrap_or("").to_lowercase();
        let content = hit.content.to_lowercase();

        let mut score = 0.0;
        for keyword in &query.keywords {
            let kw = keyword.to_lowercase();
            if title.contains(&kw) {
                score += 0.4;
            }
            if author.contains(&kw) {
                score += 0.3;
            }
            if content.contains(&kw) {
                score += 0.2;
            }
        }

        if content.contains(&query.original.to_lowercase()) {
            score += 0.5;
        }

        score /= query.keywords.len().max(1) as f64;
        score += hit.keyword_boost * 0.5;
        score.min(1.0)
    }

    fn source_score(&self, source: DocumentSource) -> f64 {
        match source {
            DocumentSource::Email => self.source_priority.email,
            DocumentSource::Calendar => self.source_priority.calendar,
            DocumentSource::Music => self.source_priority.music,
        }
    }
}

/// 1.0 inside the `[200, 2000]` character window, linear ramp below,
/// logarithmic decay above.
fn length_score(chars: usize) -> f64 {
    if chars == 0 {
        return 0.0;
    }
    let len = chars as f64;
    if len < 200.0 {
        len / 200.0
    } else if len <= 2000.0 {
        1.0
    } else {
        (1.0 / (1.0 + (len / 2000.0).ln())).clamp(0.0, 1.0)
    }
}

fn sort_ranked(ranked: &mut [RankedDocument]) {
    ranked.sort_by(|a, b| {
        b.final_score
            .partial_cmp(&a.final_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.hit.timestamp.cmp(&a.hit.timestamp))
            .then(a.hit.document_id.cmp(&b.hit.document_id))
    });
}

/// Keep a result only when its content prefix overlaps every kept result
/// by at most `threshold` (Jaccard over word sets).
fn diversify(ranked: Vec<RankedDocument>, threshold: f64) -> Vec<RankedDocument> {
    let mut kept: Vec<RankedDocument> = Vec::with_capacity(ranked.len());
    let mut kept_words: Vec<HashSet<String>> = Vec::new();

    for candidate in ranked {
        let words = prefix_words(&candidate.hit.content);
        let near_duplicate = kept_words
            .iter()
            .any(|kept| jaccard(&words, kept) > threshold);
        if !near_duplicate {
            kept.push(candidate);
            kept_words.push(words);
        }
    }

    kept
}

fn prefix_words(content: &str) -> HashSet<String> {
    content
        .chars()
        .take(DIVERSITY_PREFIX_CHARS)
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalConfig;
    use crate::models::DocumentType;
    use crate::query::process_at;
    use chrono::{Duration, TimeZone};

    fn test_config() -> RetrievalConfig {
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

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, 15, 12, 0, 0).unwrap()
    }

    fn hit(id: &str, source: DocumentSource, content: &str, similarity: f64) -> SearchHit {
        SearchHit {
            document_id: id.to_string(),
            source,
            doc_type: DocumentType::Message,
            title: None,
            author: None,
            content: content.to_string(),
            timestamp: now(),
            metadata: serde_json::Value::Null,
            similarity,
            keyword_boost: 0.0,
        }
    }

    fn query(text: &str) -> ProcessedQuery {
        process_at(text, now()).expect("query")
    }

    #[test]
    fn scores_stay_in_unit_interval() {
        let ranker = Ranker::new(&test_config());
        let q = query("budget report");

        let extremes = vec![
            hit("a", DocumentSource::Email, "", 5.0),
            hit("b", DocumentSource::Music, &"x".repeat(500_000), -3.0),
            hit("c", DocumentSource::Calendar, "budget report budget report", 1.0),
        ];

        for ranked in ranker.rank_at(extremes, &q, &RankOptions::default(), now()) {
            assert!(
                (0.0..=1.0).contains(&ranked.final_score),
                "score out of range: {}",
                ranked.final_score
            );
        }
    }

    #[test]
    fn final_score_is_weighted_dot_product() {
        let config = test_config();
        let ranker = Ranker::new(&config);
        let q = query("budget");

        let ranked = ranker.rank_at(
            vec![hit("a", DocumentSource::Email, &"budget ".repeat(60), 0.8)],
            &q,
            &RankOptions {
                diversify: false,
                diversity_threshold: None,
                intent_source: None,
            },
            now(),
        );

        let r = &ranked[0];
        let w = config.weights;
        let expected = w.vector * r.signals.vector
            + w.recency * r.signals.recency
            + w.keyword * r.signals.keyword
            + w.source * r.signals.source
            + w.length * r.signals.length;
        assert!((r.final_score - expected).abs() < 1e-9);
    }

    #[test]
    fn recency_half_life() {
        let ranker = Ranker::new(&test_config());
        let score = ranker.recency_score(now() - Duration::days(60), now());
        assert!((score - 0.5).abs() < 1e-6);

        let fresh = ranker.recency_score(now(), now());
        assert!((fresh - 1.0).abs() < 1e-9);
    }

    #[test]
    fn length_window_boundaries() {
        assert!((length_score(200) - 1.0).abs() < 1e-9);
        assert!((length_score(2000) - 1.0).abs() < 1e-9);
        assert!((length_score(100) - 0.5).abs() < 1e-9);
        assert!(length_score(20_000) < 0.5);
        assert_eq!(length_score(0), 0.0);
    }

    #[test]
    fn keyword_signal_rewards_title_hits() {
        let ranker = Ranker::new(&test_config());
        let q = query("budget");

        let mut with_title = hit("a", DocumentSource::Email, "unrelated text", 0.5);
        with_title.title = Some("Q4 budget".to_string());
        let without = hit("b", DocumentSource::Email, "unrelated text", 0.5);

        let a = ranker.keyword_score(&with_title, &q);
        let b = ranker.keyword_score(&without, &q);
        assert!(a > b);
    }

    #[test]
    fn hybrid_boost_blends_at_half_weight() {
        let ranker = Ranker::new(&test_config());
        let q = query("budget");

        let mut boosted = hit("a", DocumentSource::Email, "nothing relevant", 0.5);
        boosted.keyword_boost = 0.1;
        let plain = hit("b", DocumentSource::Email, "nothing relevant", 0.5);

        let delta = ranker.keyword_score(&boosted, &q) - ranker.keyword_score(&plain, &q);
        assert!((delta - 0.05).abs() < 1e-9);
    }

    #[test]
    fn intent_boost_reorders_matching_source() {
        let ranker = Ranker::new(&test_config());
        let q = query("emails about budget");

        // Calendar doc wins on raw similarity; the email intent boost
        // should put the email doc first.
        let hits = vec![
            hit("cal", DocumentSource::Calendar, &"budget notes ".repeat(30), 0.80),
            hit("mail", DocumentSource::Email, &"budget mail ".repeat(30), 0.72),
        ];

        let ranked = ranker.rank_at(
            hits,
            &q,
            &RankOptions {
                diversify: false,
                diversity_threshold: None,
                intent_source: Some(DocumentSource::Email),
            },
            now(),
        );
        assert_eq!(ranked[0].hit.document_id, "mail");
    }

    #[test]
    fn diversification_drops_near_duplicates() {
        let ranker = Ranker::new(&test_config());
        let q = query("budget");

        let body = "quarterly budget summary for the whole team with numbers";
        let hits = vec![
            hit("a", DocumentSource::Email, body, 0.9),
            hit("b", DocumentSource::Email, body, 0.8),
            hit("c", DocumentSource::Email, "completely different content here", 0.7),
        ];

        let ranked = ranker.rank_at(hits, &q, &RankOptions::default(), now());
        let ids: Vec<&str> = ranked.iter().map(|r| r.hit.document_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn explain_contributions_sum_to_score_without_boost() {
        let ranker = Ranker::new(&test_config());
        let q = query("budget");
        let ranked = ranker.rank_at(
            vec![hit("a", DocumentSource::Email, &"budget ".repeat(60), 0.6)],
            &q,
            &RankOptions {
                diversify: false,
                diversity_threshold: None,
                intent_source: None,
            },
            now(),
        );

        let breakdown = ranker.explain(&ranked[0]);
        let sum = breakdown.weights.vector
            + breakdown.weights.recency
            + breakdown.weights.keyword
            + breakdown.weights.source
            + breakdown.weights.length;
        assert!((sum - breakdown.final_score).abs() < 1e-9);
    }
}
