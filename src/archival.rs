//! Archival Memory
//!
//! Append-only, embedding-indexed long-term store. Entries are immutable
//! once written; the only removal path is an explicit operator purge.
//!
//! Ranking blends cosine similarity with importance:
//! `blended = (1 - w) * similarity + w * importance`. Entries whose blended
//! score falls in the same tolerance band are ordered by importance, then
//! similarity, then recency.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::embeddings::{cosine_similarity, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::store::StateStore;

/// Long-term memory entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivalEntry {
    pub id: String,
    pub text: String,
    pub tags: BTreeSet<String>,
    /// In [0, 1]
    pub importance: f32,
    pub embedding: Vec<f32>,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Archival ranking and dimension settings
#[derive(Debug, Clone)]
pub struct ArchivalConfig {
    /// Fixed embedding dimension; learned from the provider or first insert when unset
    pub dimension: Option<usize>,
    /// Weight of importance in the blended score (0.0 = similarity only)
    pub importance_weight: f32,
    /// Width of the score band inside which importance breaks ties
    pub tolerance_band: f32,
}

impl Default for ArchivalConfig {
    fn default() -> Self {
        Self {
            dimension: None,
            importance_weight: 0.0,
            tolerance_band: 0.01,
        }
    }
}

/// Content hash used for de-duplication (first 16 bytes of SHA-256)
pub fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// One ranked search result
#[derive(Debug, Clone)]
pub struct SearchHit<'a> {
    pub entry: &'a ArchivalEntry,
    pub similarity: f32,
    pub score: f32,
}

#[derive(Debug, Clone)]
struct Ranked<'a> {
    bucket: i64,
    similarity: f32,
    score: f32,
    entry: &'a ArchivalEntry,
}

impl Ord for Ranked<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bucket
            .cmp(&other.bucket)
            .then_with(|| self.entry.importance.total_cmp(&other.entry.importance))
            .then_with(|| self.similarity.total_cmp(&other.similarity))
            .then_with(|| self.entry.created_at.cmp(&other.entry.created_at))
            // lower id ranks first
            .then_with(|| other.entry.id.cmp(&self.entry.id))
    }
}

impl PartialOrd for Ranked<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Ranked<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Ranked<'_> {}

/// Lazy, finite ranked results
///
/// Yields at most `top_k` hits, best first. Clone before iterating to
/// replay the same sequence.
#[derive(Debug, Clone)]
pub struct SearchHits<'a> {
    heap: BinaryHeap<Ranked<'a>>,
    remaining: usize,
}

impl<'a> Iterator for SearchHits<'a> {
    type Item = SearchHit<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let ranked = self.heap.pop()?;
        self.remaining -= 1;
        Some(SearchHit {
            entry: ranked.entry,
            similarity: ranked.similarity,
            score: ranked.score,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.remaining.min(self.heap.len());
        (n, Some(n))
    }
}

/// Archival store statistics
#[derive(Debug, Clone)]
pub struct ArchivalStats {
    pub total_entries: usize,
    pub dimension: Option<usize>,
    pub by_tag: Vec<(String, usize)>,
}

/// Append-only long-term memory
pub struct ArchivalStore {
    entries: Vec<ArchivalEntry>,
    dimension: Option<usize>,
    config: ArchivalConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
}

impl ArchivalStore {
    pub fn open(
        config: ArchivalConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let entries = store.load_archival()?;
        let dimension = config
            .dimension
            .or_else(|| embedder.dimension())
            .or_else(|| entries.first().map(|e| e.embedding.len()));

        if let Some(dim) = dimension {
            let stale = entries.iter().filter(|e| e.embedding.len() != dim).count();
            if stale > 0 {
                warn!("{} archival entries have a dimension other than {}", stale, dim);
            }
        }

        info!("Archival store opened: {} entries", entries.len());
        Ok(Self {
            entries,
            dimension,
            config,
            embedder,
            store,
            clock,
        })
    }

    /// Embed and append a new entry, returning its id
    pub async fn insert(&mut self, text: &str, tags: &[String], importance: f32) -> Result<String> {
        let embedding = self.embedder.embed(text).await?;
        self.insert_embedded(text, tags, importance, embedding)
    }

    /// Append an entry with a precomputed embedding
    pub fn insert_embedded(
        &mut self,
        text: &str,
        tags: &[String],
        importance: f32,
        embedding: Vec<f32>,
    ) -> Result<String> {
        self.check_dimension(embedding.len())?;

        let importance = if importance.is_finite() {
            importance.clamp(0.0, 1.0)
        } else {
            0.0
        };

        let entry = ArchivalEntry {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
            tags: tags.iter().map(|t| t.trim().to_lowercase()).filter(|t| !t.is_empty()).collect(),
            importance,
            content_hash: hash_content(text),
            created_at: self.clock.now(),
            embedding,
        };

        self.store.append_archival(&entry)?;
        if self.dimension.is_none() {
            self.dimension = Some(entry.embedding.len());
        }

        debug!("Archived {} ({} chars, importance {:.2})", &entry.id[..8], text.len(), importance);
        let id = entry.id.clone();
        self.entries.push(entry);
        Ok(id)
    }

    /// Rank entries against `query`; an empty `tag_filter` matches everything
    pub async fn search(&self, query: &str, top_k: usize, tag_filter: &[String]) -> Result<SearchHits<'_>> {
        if query.trim().is_empty() {
            return Err(Error::EmptyQuery);
        }
        let query_embedding = self.embedder.embed(query).await?;
        self.search_by_embedding(&query_embedding, top_k, tag_filter)
    }

    /// Rank entries against a precomputed query embedding
    pub fn search_by_embedding(
        &self,
        query_embedding: &[f32],
        top_k: usize,
        tag_filter: &[String],
    ) -> Result<SearchHits<'_>> {
        self.check_dimension(query_embedding.len())?;

        let weight = self.config.importance_weight.clamp(0.0, 1.0);
        let band = self.config.tolerance_band.max(f32::EPSILON);

        let heap = self
            .entries
            .iter()
            .filter(|e| matches_tags(e, tag_filter))
            .map(|entry| {
                let similarity = cosine_similarity(query_embedding, &entry.embedding);
                let score = (1.0 - weight) * similarity + weight * entry.importance;
                Ranked {
                    bucket: (score / band).floor() as i64,
                    similarity,
                    score,
                    entry,
                }
            })
            .collect();

        Ok(SearchHits {
            heap,
            remaining: top_k,
        })
    }

    /// Hard delete by id (operator correction only)
    pub fn purge(&mut self, id: &str) -> Result<bool> {
        let removed = self.store.delete_archival(id)?;
        self.entries.retain(|e| e.id != id);
        if removed {
            info!("Purged archival entry {}", id);
        }
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<&ArchivalEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Entry with identical content, if any
    pub fn find_by_hash(&self, content_hash: &str) -> Option<&ArchivalEntry> {
        self.entries.iter().find(|e| e.content_hash == content_hash)
    }

    /// Newest-first listing, 1-based pages
    pub fn list(&self, page: usize, per_page: usize, tag: Option<&str>) -> Vec<&ArchivalEntry> {
        let filter: Vec<String> = tag.map(|t| vec![t.to_lowercase()]).unwrap_or_default();
        let skip = page.saturating_sub(1) * per_page;
        self.entries
            .iter()
            .rev()
            .filter(|e| matches_tags(e, &filter))
            .skip(skip)
            .take(per_page)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn stats(&self) -> ArchivalStats {
        let mut counts = std::collections::BTreeMap::new();
        for tag in self.entries.iter().flat_map(|e| e.tags.iter()) {
            *counts.entry(tag.clone()).or_insert(0usize) += 1;
        }
        ArchivalStats {
            total_entries: self.entries.len(),
            dimension: self.dimension,
            by_tag: counts.into_iter().collect(),
        }
    }

    fn check_dimension(&self, actual: usize) -> Result<()> {
        match self.dimension {
            Some(expected) if expected != actual => Err(Error::DimensionMismatch { expected, actual }),
            None if actual == 0 => Err(Error::DimensionMismatch { expected: 1, actual }),
            _ => Ok(()),
        }
    }
}

fn matches_tags(entry: &ArchivalEntry, filter: &[String]) -> bool {
    filter.is_empty() || filter.iter().any(|t| entry.tags.contains(&t.to_lowercase()))
}
