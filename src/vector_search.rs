//! Vector search over the document store, with a bounded query-embedding
//! cache.
//!
//! Query embeddings are cached in a process-local LRU keyed by the
//! trimmed, lower-cased query (capacity 100, TTL 5 minutes) so repeated
//! questions cost one provider call. The cache is guarded by a mutex and
//! evicts oldest-first at capacity; it never grows unbounded.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::embedding::Embedder;
use crate::error::Result;
use crate::models::{SearchFilters, SearchHit};
use crate::store::DocumentStore;

const CACHE_CAPACITY: usize = 100;
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Minimum similarity used by the expansion retry.
const EXPANSION_MIN_SIMILARITY: f64 = 0.3;

/// Result count below which expansion kicks in.
const EXPANSION_THRESHOLD: usize = 3;

/// Per-request search options.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Clamped to `1..=100`.
    pub top_k: usize,
    /// Clamped to `[0, 1]`.
    pub min_similarity: f64,
    pub filters: SearchFilters,
}

pub struct VectorSearch {
    store: DocumentStore,
    embedder: Arc<dyn Embedder>,
    cache: Mutex<QueryEmbeddingCache>,
}

impl VectorSearch {
    pub fn new(store: DocumentStore, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            store,
            embedder,
            cache: Mutex::new(QueryEmbeddingCache::new(CACHE_CAPACITY, CACHE_TTL)),
        }
    }

    /// Embed a query, consulting the LRU cache first.
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let key = query.trim().to_lowercase();

        if let Some(vector) = self.cache.lock().expect("cache lock").get(&key) {
            return Ok(vector);
        }

        let output = self.embedder.embed(query).await?;
        self.cache
            .lock()
            .expect("cache lock")
            .insert(key, output.vector.clone());
        Ok(output.vector)
    }

    /// Plain cosine search with filters.
    pub async fn search(
        &self,
        user_id: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let (top_k, min_similarity) = clamp_options(options);
        let vector = self.embed_query(query).await?;
        let mut hits = self
            .store
            .search(user_id, &vector, &options.filters, top_k, min_similarity)
            .await?;
        round_similarities(&mut hits);
        Ok(hits)
    }

    /// Keyword-boosted search.
    pub async fn hybrid_search(
        &self,
        user_id: &str,
        query: &str,
        keywords: &[String],
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let (top_k, min_similarity) = clamp_options(options);
        let vector = self.embed_query(query).await?;
        let mut hits = self
            .store
            .hybrid_search(
                user_id,
                &vector,
                keywords,
                &options.filters,
                top_k,
                min_similarity,
            )
            .await?;
        round_similarities(&mut hits);
        Ok(hits)
    }

    /// Plain search that relaxes `min_similarity` to 0.3 when the first
    /// pass returns fewer than three hits at a stricter threshold.
    pub async fn search_with_expansion(
        &self,
        user_id: &str,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let hits = self.search(user_id, query, options).await?;
        if hits.len() >= EXPANSION_THRESHOLD || options.min_similarity <= EXPANSION_MIN_SIMILARITY {
            return Ok(hits);
        }

        let relaxed = SearchOptions {
            top_k: options.top_k,
            min_similarity: EXPANSION_MIN_SIMILARITY,
            filters: options.filters.clone(),
        };
        self.search(user_id, query, &relaxed).await
    }

    /// Nearest neighbours of a stored document.
    pub async fn find_similar(
        &self,
        user_id: &str,
        document_id: &str,
        k: usize,
    ) -> Result<Vec<SearchHit>> {
        let k = k.clamp(1, 100);
        let mut hits = self.store.find_similar(user_id, document_id, k).await?;
        round_similarities(&mut hits);
        Ok(hits)
    }
}

fn clamp_options(options: &SearchOptions) -> (usize, f64) {
    (
        options.top_k.clamp(1, 100),
        options.min_similarity.clamp(0.0, 1.0),
    )
}

fn round_similarities(hits: &mut [SearchHit]) {
    for hit in hits {
        hit.similarity = (hit.similarity * 10_000.0).round() / 10_000.0;
    }
}

/// Bounded LRU with TTL for query embeddings.
struct QueryEmbeddingCache {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<String, CacheEntry>,
    /// Keys ordered least- to most-recently used.
    order: VecDeque<String>,
}

struct CacheEntry {
    vector: Vec<f32>,
    inserted_at: Instant,
}

impl QueryEmbeddingCache {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, key: &str) -> Option<Vec<f32>> {
        let entry = self.entries.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            self.remove(key);
            return None;
        }
        let vector = entry.vector.clone();
        self.touch(key);
        Some(vector)
    }

    fn insert(&mut self, key: String, vector: Vec<f32>) {
        if self.entries.contains_key(&key) {
            self.remove(&key);
        }
        while self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
        self.entries.insert(
            key.clone(),
            CacheEntry {
                vector,
                inserted_at: Instant::now(),
            },
        );
        self.order.push_back(key);
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}
