//! Query processor: parses a natural-language question into intent,
//! keywords, entities, person, time range, and search filters.
//!
//! Processing is pure: the only ambient input is the clock, which every
//! extractor takes explicitly so tests are deterministic.
//!
//! # Conventions
//!
//! - Intent detection applies ordered pattern lists; the first match wins.
//! - Week boundaries are ISO weeks, Monday 00:00:00 UTC inclusive through
//!   the next Monday exclusive.
//! - Time ranges are `[start, end)` instants in UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::OnceLock;

use crate::error::{RecallError, Result};
use crate::models::{DocumentSource, TimeRange};

/// Maximum keywords returned.
const DEFAULT_KEYWORD_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    SearchEmail,
    SearchCalendar,
    SearchMusic,
    PatternAnalysis,
    Recommendation,
    GeneralSearch,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryIntent::SearchEmail => "search_email",
            QueryIntent::SearchCalendar => "search_calendar",
            QueryIntent::SearchMusic => "search_music",
            QueryIntent::PatternAnalysis => "pattern_analysis",
            QueryIntent::Recommendation => "recommendation",
            QueryIntent::GeneralSearch => "general_search",
        }
    }

    /// The source this intent targets, if any.
    pub fn source(&self) -> Option<DocumentSource> {
        match self {
            QueryIntent::SearchEmail => Some(DocumentSource::Email),
            QueryIntent::SearchCalendar => Some(DocumentSource::Calendar),
            QueryIntent::SearchMusic => Some(DocumentSource::Music),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    MemoryRecall,
    Pattern,
    Recommendation,
    General,
}

/// Filters assembled from the parse, handed to vector search.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueryFilters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<DocumentSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    /// Hard author filter, set when a person was extracted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Advisory author hint (first entity) when no person matched; not
    /// applied as a hard predicate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub potential_author: Option<String>,
}

/// The processed form of one query, owned by the request that produced it.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedQuery {
    pub original: String,
    pub intent: QueryIntent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<DocumentSource>,
    pub keywords: Vec<String>,
    pub entities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    pub filters: QueryFilters,
    pub query_type: QueryType,
}

/// Parse a query using the current clock.
pub fn process(query: &str) -> Result<ProcessedQuery> {
    process_at(query, Utc::now())
}

/// Parse a query against an explicit `now` (deterministic for tests).
pub fn process_at(query: &str, now: DateTime<Utc>) -> Result<ProcessedQuery> {
    let original = query.trim();
    if original.is_empty() {
        return Err(RecallError::validation("query must not be empty"));
    }

    let intent = detect_intent(original);
    let source = intent.source();
    let time_range = extract_time_range(original, now);
    let person = extract_person(original);
    let entities = extract_entities(original);
    let keywords = extract_keywords(original, DEFAULT_KEYWORD_LIMIT);

    let potential_author = if person.is_none() {
        entities.first().cloned()
    } else {
        None
    };

    let filters = QueryFilters {
        source,
        time_range: time_range.clone(),
        author: person.clone(),
        potential_author,
    };

    let query_type = match intent {
        QueryIntent::SearchEmail | QueryIntent::SearchCalendar | QueryIntent::SearchMusic => {
            QueryType::MemoryRecall
        }
        QueryIntent::PatternAnalysis => QueryType::Pattern,
        QueryIntent::Recommendation => QueryType::Recommendation,
        QueryIntent::GeneralSearch => QueryType::General,
    };

    Ok(ProcessedQuery {
        original: original.to_string(),
        intent,
        source,
        keywords,
        entities,
        person,
        time_range,
        filters,
        query_type,
    })
}

// ============ intent ============

fn intent_patterns() -> &'static [(QueryIntent, Regex)] {
    static PATTERNS: OnceLock<Vec<(QueryIntent, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                QueryIntent::SearchEmail,
                Regex::new(r"(?i)\b(emails?|mail|inbox|messages?)\b").expect("valid regex"),
            ),
            (
                QueryIntent::SearchCalendar,
                Regex::new(r"(?i)\b(calendar|meetings?|events?|appointments?|schedule)\b")
                    .expect("valid regex"),
            ),
            (
                QueryIntent::SearchMusic,
                Regex::new(r"(?i)\b(music|songs?|tracks?|playlists?|albums?|listen(ed|ing)?)\b")
                    .expect("valid regex"),
            ),
            (
                QueryIntent::PatternAnalysis,
                Regex::new(r"(?i)\b(how often|how many times|patterns?|trends?|usually|typically|frequency)\b")
                    .expect("valid regex"),
            ),
            (
                QueryIntent::Recommendation,
                Regex::new(r"(?i)\b(recommend(ation)?s?|suggest(ion)?s?|should i)\b")
                    .expect("valid regex"),
            ),
        ]
    })
}

/// Ordered pattern lists; the first matching intent wins.
pub fn detect_intent(query: &str) -> QueryIntent {
    for (intent, pattern) in intent_patterns() {
        if pattern.is_match(query) {
            return *intent;
        }
    }
    QueryIntent::GeneralSearch
}

// ============ time ranges ============

/// Recognize fixed labels (today, last week, ...) and parametric forms
/// (last N days, N weeks ago, in <month>, on YYYY-MM-DD).
pub fn extract_time_range(query: &str, now: DateTime<Utc>) -> Option<TimeRange> {
    let lowered = query.to_lowercase();
    let today = now.date_naive();

    // Parametric forms first so "last 2 weeks" is not shadowed by "last week".
    static LAST_N: OnceLock<Regex> = OnceLock::new();
    let last_n = LAST_N
        .get_or_init(|| Regex::new(r"\blast (\d+) (day|week|month)s?\b").expect("valid regex"));
    if let Some(caps) = last_n.captures(&lowered) {
        let n: i64 = caps[1].parse().ok()?;
        let unit = &caps[2];
        let start = match unit {
            "day" => now - Duration::days(n),
            "week" => now - Duration::weeks(n),
            _ => now - Duration::days(n * 30),
        };
        return Some(range(start, now, format!("last {n} {unit}s")));
    }

    static N_AGO: OnceLock<Regex> = OnceLock::new();
    let n_ago =
        N_AGO.get_or_init(|| Regex::new(r"\b(\d+) (day|week)s? ago\b").expect("valid regex"));
    if let Some(caps) = n_ago.captures(&lowered) {
        let n: i64 = caps[1].parse().ok()?;
        return match &caps[2] {
            "day" => {
                let day = today - Duration::days(n);
                Some(day_range(day, format!("{n} days ago")))
            }
            _ => {
                let week_start = monday_of(today - Duration::weeks(n));
                Some(range_naive(
                    week_start,
                    week_start + Duration::days(7),
                    format!("{n} weeks ago"),
                ))
            }
        };
    }

    static ON_DATE: OnceLock<Regex> = OnceLock::new();
    let on_date =
        ON_DATE.get_or_init(|| Regex::new(r"\bon (\d{4}-\d{2}-\d{2})\b").expect("valid regex"));
    if let Some(caps) = on_date.captures(&lowered) {
        let day = NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d").ok()?;
        return Some(day_range(day, caps[1].to_string()));
    }

    static IN_MONTH: OnceLock<Regex> = OnceLock::new();
    let in_month = IN_MONTH.get_or_init(|| {
        Regex::new(
            r"\bin (january|february|march|april|may|june|july|august|september|october|november|december)\b",
        )
        .expect("valid regex")
    });
    if let Some(caps) = in_month.captures(&lowered) {
        let month = month_number(&caps[1])?;
        let start = NaiveDate::from_ymd_opt(today.year(), month, 1)?;
        let end = next_month(start);
        return Some(range_naive(start, end, format!("in {}", &caps[1])));
    }

    // Fixed labels.
    if lowered.contains("today") {
        return Some(day_range(today, "today".into()));
    }
    if lowered.contains("yesterday") {
        return Some(day_range(today - Duration::days(1), "yesterday".into()));
    }
    if lowered.contains("last week") {
        let start = monday_of(today) - Duration::days(7);
        return Some(range_naive(start, start + Duration::days(7), "last week".into()));
    }
    if lowered.contains("this week") {
        let start = monday_of(today);
        return Some(range_naive(start, start + Duration::days(7), "this week".into()));
    }
    if lowered.contains("last month") {
        let this_month_start = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?;
        let start = previous_month(this_month_start);
        return Some(range_naive(start, this_month_start, "last month".into()));
    }
    if lowered.contains("this month") {
        let start = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?;
        return Some(range_naive(start, next_month(start), "this month".into()));
    }
    if lowered.contains("last year") {
        let start = NaiveDate::from_ymd_opt(today.year() - 1, 1, 1)?;
        let end = NaiveDate::from_ymd_opt(today.year(), 1, 1)?;
        return Some(range_naive(start, end, "last year".into()));
    }
    if lowered.contains("this year") {
        let start = NaiveDate::from_ymd_opt(today.year(), 1, 1)?;
        let end = NaiveDate::from_ymd_opt(today.year() + 1, 1, 1)?;
        return Some(range_naive(start, end, "this year".into()));
    }

    None
}

fn range(start: DateTime<Utc>, end: DateTime<Utc>, label: String) -> TimeRange {
    TimeRange {
        start,
        end,
        label: Some(label),
    }
}

fn range_naive(start: NaiveDate, end: NaiveDate, label: String) -> TimeRange {
    range(
        Utc.from_utc_datetime(&start.and_hms_opt(0, 0, 0).expect("valid midnight")),
        Utc.from_utc_datetime(&end.and_hms_opt(0, 0, 0).expect("valid midnight")),
        label,
    )
}

fn day_range(day: NaiveDate, label: String) -> TimeRange {
    range_naive(day, day + Duration::days(1), label)
}

/// Monday of the ISO week containing `date`.
fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

fn next_month(first_of_month: NaiveDate) -> NaiveDate {
    let (year, month) = if first_of_month.month() == 12 {
        (first_of_month.year() + 1, 1)
    } else {
        (first_of_month.year(), first_of_month.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).expect("valid first of month")
}

fn previous_month(first_of_month: NaiveDate) -> NaiveDate {
    let (year, month) = if first_of_month.month() == 1 {
        (first_of_month.year() - 1, 12)
    } else {
        (first_of_month.year(), first_of_month.month() - 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).expect("valid first of month")
}

fn month_number(name: &str) -> Option<u32> {
    Some(match name {
        "january" => 1,
        "february" => 2,
        "march" => 3,
        "april" => 4,
        "may" => 5,
        "june" => 6,
        "july" => 7,
        "august" => 8,
        "september" => 9,
        "october" => 10,
        "november" => 11,
        "december" => 12,
        _ => return None,
    })
}

// ============ person ============

/// Words never accepted as (part of) a person name.
const NAME_REJECTS: &[&str] = &[
    "the", "this", "that", "these", "those", "a", "an", "i", "me", "my", "mine", "you", "your",
    "he", "him", "his", "she", "her", "we", "us", "our", "they", "them", "their", "it", "its",
    "what", "when", "where", "who", "whom", "why", "how", "someone", "anyone", "everybody",
];

/// Trailing capture words that belong to the query, not the name.
const NAME_TRAILERS: &[&str] = &[
    "about", "regarding", "concerning", "last", "this", "next", "yesterday", "today",
];

fn person_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        // Ordered: the most specific anchor first.
        ["discussed with", "from", "with", "to"]
            .iter()
            .map(|prep| {
                Regex::new(&format!(
                    r"\b(?i:{prep})\s+([A-Z][A-Za-z'-]+(?:\s+[A-Z][A-Za-z'-]+)?)"
                ))
                .expect("valid regex")
            })
            .collect()
    })
}

/// Extract a person name anchored on a preposition. The first accepted
/// capture wins.
pub fn extract_person(query: &str) -> Option<String> {
    for pattern in person_patterns() {
        for caps in pattern.captures_iter(query) {
            let candidate = caps.get(1)?.as_str();
            if let Some(name) = accept_name(candidate) {
                return Some(name);
            }
        }
    }
    None
}

fn accept_name(candidate: &str) -> Option<String> {
    let mut words: Vec<&str> = candidate.split_whitespace().collect();

    while let Some(last) = words.last() {
        if NAME_TRAILERS.contains(&last.to_lowercase().as_str()) {
            words.pop();
        } else {
            break;
        }
    }

    if words.is_empty() {
        return None;
    }
    if words
        .iter()
        .any(|w| NAME_REJECTS.contains(&w.to_lowercase().as_str()))
    {
        return None;
    }
    Some(words.join(" "))
}

// ============ entities ============

/// Sentence starters and verbs excluded from entity extraction.
const ENTITY_STOPS: &[&str] = &[
    "the", "a", "an", "i", "what", "when", "where", "who", "why", "how", "is", "are", "was",
    "were", "do", "does", "did", "show", "find", "get", "tell", "give", "list", "search", "can",
    "could", "would", "should", "please", "any", "all", "my",
];

/// Capitalized tokens outside the stop list; adjacent tokens join into one
/// entity.
pub fn extract_entities(query: &str) -> Vec<String> {
    static WORD: OnceLock<Regex> = OnceLock::new();
    let word = WORD.get_or_init(|| Regex::new(r"[A-Za-z'-]+").expect("valid regex"));

    let mut entities: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for token in word.find_iter(query) {
        let text = token.as_str();
        let capitalized = text.chars().next().is_some_and(|c| c.is_uppercase());
        if capitalized && !ENTITY_STOPS.contains(&text.to_lowercase().as_str()) {
            current.push(text);
        } else if !current.is_empty() {
            entities.push(current.join(" "));
            current.clear();
        }
    }
    if !current.is_empty() {
        entities.push(current.join(" "));
    }

    entities.dedup();
    entities
}

// ============ keywords ============

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "up", "about", "into", "over", "after", "is", "are", "was", "were", "be", "been",
    "being", "have", "has", "had", "do", "does", "did", "will", "would", "could", "should",
    "may", "might", "must", "can", "this", "that", "these", "those", "i", "you", "he", "she",
    "it", "we", "they", "me", "him", "her", "us", "them", "my", "your", "his", "its", "our",
    "their", "all", "any", "some", "please",
];

const INTERROGATIVES: &[&str] = &["what", "when", "where", "who", "whom", "why", "how", "which"];

/// Lower-cased, stop-word-filtered tokens ranked by frequency, at most
/// `limit` of them. Ties keep first-occurrence order.
pub fn extract_keywords(query: &str, limit: usize) -> Vec<String> {
    static WORD: OnceLock<Regex> = OnceLock::new();
    let word = WORD.get_or_init(|| Regex::new(r"[a-z0-9'-]+").expect("valid regex"));

    let lowered = query.to_lowercase();
    let mut frequency: HashMap<String, usize> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for token in word.find_iter(&lowered) {
        let text = token.as_str();
        if text.len() < 3 {
            continue;
        }
        if STOP_WORDS.contains(&text) || INTERROGATIVES.contains(&text) {
            continue;
        }
        let entry = frequency.entry(text.to_string()).or_insert(0);
        if *entry == 0 {
            order.push(text.to_string());
        }
        *entry += 1;
    }

    let mut ranked: Vec<String> = order;
    ranked.sort_by(|a, b| frequency[b].cmp(&frequency[a]));
    ranked.truncate(limit);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        // Wednesday 2025-10-15 15:00 UTC.
        Utc.with_ymd_and_hms(2025, 10, 15, 15, 0, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn empty_query_is_rejected() {
        assert!(process("").is_err());
        assert!(process("   ").is_err());
    }

    #[test]
    fn intent_first_match_wins() {
        assert_eq!(detect_intent("emails about rust"), QueryIntent::SearchEmail);
        assert_eq!(
            detect_intent("meetings next tuesday"),
            QueryIntent::SearchCalendar
        );
        assert_eq!(
            detect_intent("what songs did I play"),
            QueryIntent::SearchMusic
        );
        assert_eq!(
            detect_intent("how often do I work late"),
            QueryIntent::PatternAnalysis
        );
        assert_eq!(
            detect_intent("recommend something to read"),
            QueryIntent::Recommendation
        );
        assert_eq!(detect_intent("tax documents"), QueryIntent::GeneralSearch);
    }

    #[test]
    fn email_outranks_pattern_when_both_match() {
        // Ordered lists: "emails" matches before "how often".
        assert_eq!(
            detect_intent("how often do I get emails"),
            QueryIntent::SearchEmail
        );
    }

    #[test]
    fn time_today_and_yesterday() {
        let now = fixed_now();
        let today = extract_time_range("what happened today", now).unwrap();
        assert_eq!(today.start, date(2025, 10, 15));
        assert_eq!(today.end, date(2025, 10, 16));
        assert_eq!(today.label.as_deref(), Some("today"));

        let yesterday = extract_time_range("emails yesterday", now).unwrap();
        assert_eq!(yesterday.start, date(2025, 10, 14));
        assert_eq!(yesterday.end, date(2025, 10, 15));
    }

    #[test]
    fn time_iso_weeks() {
        let now = fixed_now();
        let last = extract_time_range("emails last week", now).unwrap();
        assert_eq!(last.start, date(2025, 10, 6));
        assert_eq!(last.end, date(2025, 10, 13));
        assert_eq!(last.label.as_deref(), Some("last week"));

        let this = extract_time_range("meetings this week", now).unwrap();
        assert_eq!(this.start, date(2025, 10, 13));
        assert_eq!(this.end, date(2025, 10, 20));
    }

    #[test]
    fn time_months_and_years() {
        let now = fixed_now();
        let last_month = extract_time_range("invoices last month", now).unwrap();
        assert_eq!(last_month.start, date(2025, 9, 1));
        assert_eq!(last_month.end, date(2025, 10, 1));

        let this_year = extract_time_range("trips this year", now).unwrap();
        assert_eq!(this_year.start, date(2025, 1, 1));
        assert_eq!(this_year.end, date(2026, 1, 1));

        let last_year = extract_time_range("summary of last year", now).unwrap();
        assert_eq!(last_year.start, date(2024, 1, 1));
        assert_eq!(last_year.end, date(2025, 1, 1));
    }

    #[test]
    fn time_parametric_last_n() {
        let now = fixed_now();
        let range = extract_time_range("emails from the last 7 days", now).unwrap();
        assert_eq!(range.start, now - Duration::days(7));
        assert_eq!(range.end, now);
        assert_eq!(range.label.as_deref(), Some("last 7 days"));

        let weeks = extract_time_range("activity last 2 weeks", now).unwrap();
        assert_eq!(weeks.start, now - Duration::weeks(2));
    }

    #[test]
    fn time_n_ago_uses_day_and_week_boundaries() {
        let now = fixed_now();
        let days = extract_time_range("what arrived 3 days ago", now).unwrap();
        assert_eq!(days.start, date(2025, 10, 12));
        assert_eq!(days.end, date(2025, 10, 13));

        // Two ISO weeks back from the week of Oct 13: Sep 29 – Oct 6.
        let weeks = extract_time_range("the report from 2 weeks ago", now).unwrap();
        assert_eq!(weeks.start, date(2025, 9, 29));
        assert_eq!(weeks.end, date(2025, 10, 6));
    }

    #[test]
    fn time_in_month_and_on_date() {
        let now = fixed_now();
        let january = extract_time_range("bills in january", now).unwrap();
        assert_eq!(january.start, date(2025, 1, 1));
        assert_eq!(january.end, date(2025, 2, 1));

        let day = extract_time_range("notes on 2025-03-01", now).unwrap();
        assert_eq!(day.start, date(2025, 3, 1));
        assert_eq!(day.end, date(2025, 3, 2));
    }

    #[test]
    fn time_absent() {
        assert!(extract_time_range("emails about budget", fixed_now()).is_none());
    }

    #[test]
    fn person_from_preposition() {
        assert_eq!(
            extract_person("emails from Ravi about budget").as_deref(),
            Some("Ravi")
        );
        assert_eq!(
            extract_person("what I discussed with Maya Chen last week").as_deref(),
            Some("Maya Chen")
        );
    }

    #[test]
    fn person_rejects_pronouns_and_articles() {
        assert!(extract_person("emails from The Bank").is_none());
        assert!(extract_person("a note to My Future Self").is_none());
        assert!(extract_person("messages from them").is_none());
    }

    #[test]
    fn person_strips_trailing_noise() {
        // The capture grabs "Ravi Last"; the trailer is stripped.
        assert_eq!(
            extract_person("emails from Ravi Last week").as_deref(),
            Some("Ravi")
        );
    }

    #[test]
    fn entities_join_adjacent_capitals() {
        let entities = extract_entities("Show emails from Ravi Kumar about Project Atlas");
        assert_eq!(entities, vec!["Ravi Kumar", "Project Atlas"]);
    }

    #[test]
    fn entities_skip_sentence_starters() {
        let entities = extract_entities("What did Alice say");
        assert_eq!(entities, vec!["Alice"]);
    }

    #[test]
    fn keywords_are_ranked_by_frequency() {
        let keywords = extract_keywords("budget report budget meeting notes budget", 10);
        assert_eq!(keywords[0], "budget");
        assert!(keywords.contains(&"report".to_string()));
        assert!(keywords.contains(&"meeting".to_string()));
    }

    #[test]
    fn keywords_drop_stop_words_and_short_tokens() {
        let keywords = extract_keywords("what is the plan for Q4 of the year", 10);
        assert!(!keywords.contains(&"what".to_string()));
        assert!(!keywords.contains(&"the".to_string()));
        assert!(!keywords.contains(&"q4".to_string())); // shorter than 3 chars
        assert!(keywords.contains(&"plan".to_string()));
        assert!(keywords.contains(&"year".to_string()));
    }

    #[test]
    fn keywords_respect_limit() {
        let keywords = extract_keywords(
            "alpha bravo charlie delta echo foxtrot golf hotel india juliet kilo lima",
            10,
        );
        assert_eq!(keywords.len(), 10);
    }

    #[test]
    fn full_parse_with_time_and_person() {
        let parsed =
            process_at("emails from Ravi about budget last week", fixed_now()).expect("parse");

        assert_eq!(parsed.intent, QueryIntent::SearchEmail);
        assert_eq!(parsed.query_type, QueryType::MemoryRecall);
        assert_eq!(parsed.source, Some(DocumentSource::Email));
        assert_eq!(parsed.person.as_deref(), Some("Ravi"));

        let range = parsed.time_range.expect("time range");
        assert_eq!(range.label.as_deref(), Some("last week"));
        assert_eq!(range.start, date(2025, 10, 6));
        assert_eq!(range.end, date(2025, 10, 13));

        assert_eq!(parsed.filters.source, Some(DocumentSource::Email));
        assert_eq!(parsed.filters.author.as_deref(), Some("Ravi"));
        assert!(parsed.filters.potential_author.is_none());
        assert!(parsed.keywords.contains(&"budget".to_string()));
        assert!(parsed.keywords.len() >= 2);
    }

    #[test]
    fn potential_author_falls_back_to_first_entity() {
        let parsed = process_at("notes mentioning Project Atlas", fixed_now()).expect("parse");
        assert!(parsed.person.is_none());
        assert_eq!(
            parsed.filters.potential_author.as_deref(),
            Some("Project Atlas")
        );
    }

    #[test]
    fn query_types_map_from_intents() {
        let now = fixed_now();
        assert_eq!(
            process_at("how often do I travel", now).unwrap().query_type,
            QueryType::Pattern
        );
        assert_eq!(
            process_at("suggest a restaurant", now).unwrap().query_type,
            QueryType::Recommendation
        );
        assert_eq!(
            process_at("tax paperwork", now).unwrap().query_type,
            QueryType::General
        );
    }
}
