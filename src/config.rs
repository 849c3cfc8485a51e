//! Environment-driven configuration.
//!
//! All settings are read from the process environment (a `.env` file is
//! loaded by the binary before this runs). Every key has a default except
//! the upstream API credentials, which are validated lazily by the
//! providers that need them.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{RecallError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub db: DbConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
    pub retrieval: RetrievalConfig,
    pub email: EmailConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address, e.g. `127.0.0.1:3001`.
    pub bind: String,
    pub frontend_url: String,
    /// Comma-separated allowed CORS origins; empty means allow any.
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    pub max_connections: u32,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Base URL of the embedding endpoint (OpenAI-compatible).
    pub api_url: String,
    /// Environment variable name holding the API key.
    pub api_key_var: String,
    pub model: String,
    pub dimensions: usize,
    /// Documents per coordinator batch (`process_pending` default limit).
    pub batch_size: usize,
    pub cost_per_million_tokens: f64,
    /// Optional periodic trigger, e.g. `30m`, `6h`, `900s`.
    pub schedule: Option<Duration>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_url: String,
    pub api_key_var: String,
    pub chat_model: String,
    pub temperature: f64,
    pub top_k: u32,
    pub top_p: f64,
    pub max_output_tokens: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Keywords returned by the query processor.
    pub default_top_n: usize,
    /// Search hits requested from the store.
    pub default_top_k: usize,
    pub default_min_similarity: f64,
    pub min_similarity_floor: f64,
    pub max_context_tokens: usize,
    /// Hybrid search is chosen when at least this many keywords are extracted.
    pub hybrid_keyword_threshold: usize,
    pub diversity_threshold: f64,
    pub recency_decay_days: f64,
    /// Minimum ranked results before the relaxed fallback pass runs.
    pub min_results: usize,
    pub weights: RankerWeights,
    pub intent_boost: f64,
    pub source_priority: SourcePriority,
}

/// Weighted-signal coefficients for the result ranker. Must be
/// non-negative; they are not required to sum to 1 but the defaults do.
#[derive(Debug, Clone, Copy)]
pub struct RankerWeights {
    pub vector: f64,
    pub recency: f64,
    pub keyword: f64,
    pub source: f64,
    pub length: f64,
}

impl Default for RankerWeights {
    fn default() -> Self {
        Self {
            vector: 0.45,
            recency: 0.15,
            keyword: 0.25,
            source: 0.10,
            length: 0.05,
        }
    }
}

/// Per-source ranking priority, in `[0, 1]`.
#[derive(Debug, Clone, Copy)]
pub struct SourcePriority {
    pub email: f64,
    pub calendar: f64,
    pub music: f64,
}

impl Default for SourcePriority {
    fn default() -> Self {
        Self {
            email: 1.0,
            calendar: 0.95,
            music: 0.80,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Base URL of the upstream mail API.
    pub api_url: String,
    /// Messages listed per page.
    pub page_size: usize,
    /// Message bodies fetched concurrently within one sub-batch.
    pub fetch_batch_size: usize,
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Config`] when a set variable fails to parse
    /// or a value is out of range.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            server: ServerConfig {
                bind: env_or("BIND_ADDR", "127.0.0.1:3001"),
                frontend_url: env_or("FRONTEND_URL", "http://localhost:5173"),
                cors_origins: std::env::var("CORS_ORIGIN")
                    .ok()
                    .map(|s| {
                        s.split(',')
                            .map(|o| o.trim().to_string())
                            .filter(|o| !o.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            db: DbConfig {
                path: PathBuf::from(env_or("DATABASE_PATH", "./data/recall.sqlite")),
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10)?,
                connect_timeout: Duration::from_secs(parse_env(
                    "DATABASE_CONNECT_TIMEOUT_SECS",
                    5,
                )?),
            },
            embedding: EmbeddingConfig {
                api_url: env_or("EMBEDDING_API_URL", "https://api.openai.com/v1"),
                api_key_var: env_or("EMBEDDING_API_KEY_VAR", "EMBEDDING_API_KEY"),
                model: env_or("EMBEDDING_MODEL", "text-embedding-3-small"),
                dimensions: parse_env("EMBEDDING_DIMENSIONS", 768)?,
                batch_size: parse_env("EMBEDDING_BATCH_SIZE", 50)?,
                cost_per_million_tokens: parse_env("COST_PER_MILLION_TOKENS", 0.02)?,
                schedule: parse_schedule(std::env::var("EMBEDDING_CRON_SCHEDULE").ok())?,
                timeout: Duration::from_secs(parse_env("EMBEDDING_TIMEOUT_SECS", 30)?),
            },
            llm: LlmConfig {
                api_url: env_or("LLM_API_URL", "https://api.openai.com/v1"),
                api_key_var: env_or("LLM_API_KEY_VAR", "LLM_API_KEY"),
                chat_model: env_or("LLM_CHAT_MODEL", "gpt-4o-mini"),
                temperature: parse_env("LLM_TEMPERATURE", 0.3)?,
                top_k: parse_env("LLM_TOP_K", 40)?,
                top_p: parse_env("LLM_TOP_P", 0.95)?,
                max_output_tokens: parse_env("LLM_MAX_OUTPUT_TOKENS", 2048)?,
                timeout: Duration::from_secs(parse_env("LLM_TIMEOUT_SECS", 120)?),
            },
            retrieval: RetrievalConfig {
                default_top_n: parse_env("DEFAULT_TOP_N", 10)?,
                default_top_k: parse_env("DEFAULT_TOP_K", 20)?,
                default_min_similarity: parse_env("DEFAULT_MIN_SIMILARITY", 0.35)?,
                min_similarity_floor: parse_env("MIN_SIMILARITY_FLOOR", 0.25)?,
                max_context_tokens: parse_env("MAX_CONTEXT_TOKENS", 28_000)?,
                hybrid_keyword_threshold: parse_env("HYBRID_KEYWORD_THRESHOLD", 2)?,
                diversity_threshold: parse_env("DIVERSITY_THRESHOLD", 0.85)?,
                recency_decay_days: parse_env("RECENCY_DECAY_DAYS", 60.0)?,
                min_results: parse_env("MIN_RESULTS", 3)?,
                weights: RankerWeights {
                    vector: parse_env("WEIGHT_VECTOR", RankerWeights::default().vector)?,
                    recency: parse_env("WEIGHT_RECENCY", RankerWeights::default().recency)?,
                    keyword: parse_env("WEIGHT_KEYWORD", RankerWeights::default().keyword)?,
                    source: parse_env("WEIGHT_SOURCE", RankerWeights::default().source)?,
                    length: parse_env("WEIGHT_LENGTH", RankerWeights::default().length)?,
                },
                intent_boost: parse_env("INTENT_BOOST", 1.3)?,
                source_priority: SourcePriority {
                    email: parse_env("SOURCE_PRIORITY_EMAIL", SourcePriority::default().email)?,
                    calendar: parse_env(
                        "SOURCE_PRIORITY_CALENDAR",
                        SourcePriority::default().calendar,
                    )?,
                    music: parse_env("SOURCE_PRIORITY_MUSIC", SourcePriority::default().music)?,
                },
            },
            email: EmailConfig {
                api_url: env_or("EMAIL_API_URL", "https://mail.example.com/api/v1"),
                page_size: parse_env("EMAIL_PAGE_SIZE", 100)?,
                fetch_batch_size: parse_env("EMAIL_FETCH_BATCH_SIZE", 50)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.embedding.dimensions == 0 {
            return Err(RecallError::Config(
                "EMBEDDING_DIMENSIONS must be > 0".into(),
            ));
        }
        if self.embedding.batch_size == 0 {
            return Err(RecallError::Config(
                "EMBEDDING_BATCH_SIZE must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retrieval.default_min_similarity) {
            return Err(RecallError::Config(
                "DEFAULT_MIN_SIMILARITY must be in [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retrieval.min_similarity_floor) {
            return Err(RecallError::Config(
                "MIN_SIMILARITY_FLOOR must be in [0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retrieval.diversity_threshold) {
            return Err(RecallError::Config(
                "DIVERSITY_THRESHOLD must be in [0, 1]".into(),
            ));
        }
        if self.retrieval.recency_decay_days <= 0.0 {
            return Err(RecallError::Config("RECENCY_DECAY_DAYS must be > 0".into()));
        }
        let w = &self.retrieval.weights;
        for (name, value) in [
            ("WEIGHT_VECTOR", w.vector),
            ("WEIGHT_RECENCY", w.recency),
            ("WEIGHT_KEYWORD", w.keyword),
            ("WEIGHT_SOURCE", w.source),
            ("WEIGHT_LENGTH", w.length),
        ] {
            if value < 0.0 {
                return Err(RecallError::Config(format!("{name} must be >= 0")));
            }
        }
        if self.email.fetch_batch_size == 0 || self.email.fetch_batch_size > 50 {
            return Err(RecallError::Config(
                "EMAIL_FETCH_BATCH_SIZE must be in 1..=50".into(),
            ));
        }
        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| RecallError::Config(format!("{key} has invalid value '{raw}'"))),
        Err(_) => Ok(default),
    }
}

/// Parse the periodic-embedding trigger: `<N>s`, `<N>m`, `<N>h`, or a bare
/// number of seconds. `None` (unset or empty) disables the trigger.
fn parse_schedule(raw: Option<String>) -> Result<Option<Duration>> {
    let Some(raw) = raw else { return Ok(None) };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    let (digits, unit) = match raw.chars().last() {
        Some('s') => (&raw[..raw.len() - 1], 1u64),
        Some('m') => (&raw[..raw.len() - 1], 60),
        Some('h') => (&raw[..raw.len() - 1], 3600),
        _ => (raw, 1),
    };
    let n: u64 = digits.trim().parse().map_err(|_| {
        RecallError::Config(format!(
            "EMBEDDING_CRON_SCHEDULE has invalid value '{raw}' (expected e.g. 30m)"
        ))
    })?;
    if n == 0 {
        return Err(RecallError::Config(
            "EMBEDDING_CRON_SCHEDULE must be a positive period".into(),
        ));
    }
    Ok(Some(Duration::from_secs(n * unit)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_parses_units() {
        assert_eq!(
            parse_schedule(Some("90s".into())).unwrap(),
            Some(Duration::from_secs(90))
        );
        assert_eq!(
            parse_schedule(Some("30m".into())).unwrap(),
            Some(Duration::from_secs(1800))
        );
        assert_eq!(
            parse_schedule(Some("6h".into())).unwrap(),
            Some(Duration::from_secs(21600))
        );
        assert_eq!(
            parse_schedule(Some("45".into())).unwrap(),
            Some(Duration::from_secs(45))
        );
    }

    #[test]
    fn schedule_empty_disables() {
        assert_eq!(parse_schedule(None).unwrap(), None);
        assert_eq!(parse_schedule(Some("  ".into())).unwrap(), None);
    }

    #[test]
    fn schedule_rejects_garbage() {
        assert!(parse_schedule(Some("soon".into())).is_err());
        assert!(parse_schedule(Some("0m".into())).is_err());
    }

    #[test]
    fn default_weights_sum_to_one() {
        let w = RankerWeights::default();
        let sum = w.vector + w.recency + w.keyword + w.source + w.length;
        assert!((sum - 1.0).abs() < 1e-9);
    }
}
