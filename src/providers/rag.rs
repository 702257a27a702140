//! Retrieval over a flat vector index
//!
//! The index is a JSON file of `{text, embedding}` entries built with
//! `empath build-index`. Queries are embedded through an `OpenAI`-compatible
//! embeddings endpoint and ranked by squared L2 distance.

use std::path::Path;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{Retriever, error_body};
use crate::{Error, Result};

/// Rough characters-per-token ratio used for context budgeting
const CHARS_PER_TOKEN: usize = 4;

/// Text embedder for an `OpenAI`-compatible `/embeddings` endpoint
#[derive(Debug, Clone)]
pub struct Embedder {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl Embedder {
    /// Create an embedder
    #[must_use]
    pub fn new(client: Client, base_url: &str, api_key: String, model: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
        }
    }

    /// Embedding model name
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate embedding for a single text
    ///
    /// # Errors
    ///
    /// Returns error if the API call fails
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Retrieval("empty embedding response".to_string()))
    }

    /// Generate embeddings for multiple texts, in input order
    ///
    /// # Errors
    ///
    /// Returns error if the API call fails
    pub async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        #[derive(Serialize)]
        struct EmbeddingRequest<'a> {
            model: &'a str,
            input: &'a [&'a str],
        }

        #[derive(Deserialize)]
        struct EmbeddingResponse {
            data: Vec<EmbeddingData>,
        }

        #[derive(Deserialize)]
        struct EmbeddingData {
            embedding: Vec<f32>,
            index: usize,
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Retrieval(format!("embedding request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(Error::Retrieval(format!("embedding API error {status}: {body}")));
        }

        let mut result: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::Retrieval(format!("failed to parse embedding response: {e}")))?;

        // Sort by index to maintain input order
        result.data.sort_by_key(|d| d.index);

        Ok(result.data.into_iter().map(|d| d.embedding).collect())
    }
}

/// One indexed passage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub text: String,
    pub embedding: Vec<f32>,
}

/// Exhaustive L2 index over passage embeddings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlatIndex {
    /// Model that produced the embeddings
    #[serde(default)]
    pub model: String,
    /// Embedding dimension, 0 for an empty index
    #[serde(default)]
    pub dimension: usize,
    pub entries: Vec<IndexEntry>,
}

impl FlatIndex {
    /// Create an empty index for `model`
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            dimension: 0,
            entries: Vec::new(),
        }
    }

    /// Load an index from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, or its entries
    /// disagree on dimension
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let index: Self = serde_json::from_str(&content)?;

        if let Some(bad) = index
            .entries
            .iter()
            .find(|e| e.embedding.len() != index.dimension)
        {
            return Err(Error::Retrieval(format!(
                "index entry has dimension {}, expected {}",
                bad.embedding.len(),
                index.dimension
            )));
        }
        Ok(index)
    }

    /// Write the index as JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization or the write fails
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add a passage
    ///
    /// # Errors
    ///
    /// Returns error if the embedding dimension differs from the index
    pub fn push(&mut self, text: String, embedding: Vec<f32>) -> Result<()> {
        if self.entries.is_empty() && self.dimension == 0 {
            self.dimension = embedding.len();
        } else if embedding.len() != self.dimension {
            return Err(Error::Retrieval(format!(
                "embedding has dimension {}, index expects {}",
                embedding.len(),
                self.dimension
            )));
        }
        self.entries.push(IndexEntry { text, embedding });
        Ok(())
    }

    /// Return the `top_k` passages nearest to `query`, nearest first
    ///
    /// # Errors
    ///
    /// Returns error if the query dimension differs from the index
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<&str>> {
        if self.entries.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(Error::Retrieval(format!(
                "query has dimension {}, index expects {}",
                query.len(),
                self.dimension
            )));
        }

        let mut scored: Vec<(f32, usize)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (squared_l2(query, &e.embedding), i))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(_, i)| self.entries[i].text.as_str())
            .collect())
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Retriever backed by a [`FlatIndex`] and an [`Embedder`]
pub struct FlatIndexRetriever {
    index: FlatIndex,
    embedder: Embedder,
}

impl FlatIndexRetriever {
    #[must_use]
    pub fn new(index: FlatIndex, embedder: Embedder) -> Self {
        if !index.model.is_empty() && index.model != embedder.model() {
            tracing::warn!(
                index_model = %index.model,
                query_model = %embedder.model(),
                "index and query embedding models differ"
            );
        }
        Self { index, embedder }
    }
}

#[async_trait]
impl Retriever for FlatIndexRetriever {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<String>> {
        if query.trim().is_empty() || self.index.is_empty() {
            return Ok(Vec::new());
        }

        let embedding = self.embedder.embed(query).await?;
        let passages = self.index.search(&embedding, top_k)?;

        tracing::debug!(query_chars = query.len(), hits = passages.len(), "retrieved context");
        Ok(passages.into_iter().map(str::to_string).collect())
    }
}

/// Join retrieved passages and cap them to a token budget
///
/// Returns `None` when there is nothing to add.
#[must_use]
pub fn format_context(chunks: &[String], max_tokens: usize) -> Option<String> {
    let joined = chunks
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    if joined.is_empty() {
        return None;
    }

    let max_chars = max_tokens.saturating_mul(CHARS_PER_TOKEN);
    if joined.len() <= max_chars {
        return Some(joined);
    }

    let mut cut = max_chars;
    while !joined.is_char_boundary(cut) {
        cut -= 1;
    }
    let truncated = joined[..cut].trim_end();
    if truncated.is_empty() {
        None
    } else {
        Some(truncated.to_string())
    }
}

/// Embed newline-delimited passages into a new index, `batch_size` at a time
///
/// Blank lines are skipped.
///
/// # Errors
///
/// Returns error if any embedding batch fails
pub async fn build_index(embedder: &Embedder, text: &str, batch_size: usize) -> Result<FlatIndex> {
    let passages: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let mut index = FlatIndex::new(embedder.model());
    for (n, batch) in passages.chunks(batch_size.max(1)).enumerate() {
        let embeddings = embedder.embed_batch(batch).await?;
        if embeddings.len() != batch.len() {
            return Err(Error::Retrieval(format!(
                "embedding batch {n} returned {} vectors for {} passages",
                embeddings.len(),
                batch.len()
            )));
        }
        for (passage, embedding) in batch.iter().zip(embeddings) {
            index.push((*passage).to_string(), embedding)?;
        }
        tracing::info!(batch = n, total = index.len(), "embedded batch");
    }

    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> FlatIndex {
        let mut index = FlatIndex::new("test-model");
        index.push("breathing exercises".to_string(), vec![1.0, 0.0]).unwrap();
        index.push("sleep hygiene".to_string(), vec![0.0, 1.0]).unwrap();
        index.push("grounding".to_string(), vec![0.9, 0.2]).unwrap();
        index
    }

    #[test]
    fn search_ranks_by_l2_distance() {
        let index = sample_index();
        let hits = index.search(&[1.0, 0.1], 2).unwrap();
        assert_eq!(hits, ["breathing exercises", "grounding"]);
    }

    #[test]
    fn search_caps_at_index_size() {
        let index = sample_index();
        assert_eq!(index.search(&[0.0, 0.0], 10).unwrap().len(), 3);
        assert!(FlatIndex::default().search(&[0.0], 2).unwrap().is_empty());
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let mut index = sample_index();
        assert!(index.search(&[1.0, 0.0, 0.0], 1).is_err());
        assert!(index.push("bad".to_string(), vec![1.0]).is_err());
    }

    #[test]
    fn index_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rag").join("index.json");

        let index = sample_index();
        index.save(&path).unwrap();
        let loaded = FlatIndex::load(&path).unwrap();

        assert_eq!(loaded, index);
        assert_eq!(loaded.dimension, 2);
    }

    #[test]
    fn format_context_joins_with_blank_lines() {
        let chunks = vec!["First passage.".to_string(), " ".to_string(), "Second.".to_string()];
        assert_eq!(
            format_context(&chunks, 100).as_deref(),
            Some("First passage.\n\nSecond.")
        );
        assert!(format_context(&[], 100).is_none());
    }

    #[test]
    fn format_context_respects_budget() {
        let chunks = vec!["a".repeat(50), "b".repeat(50)];
        let context = format_context(&chunks, 10).unwrap();
        assert_eq!(context.len(), 40);

        let multibyte = vec!["é".repeat(30)];
        let context = format_context(&multibyte, 5).unwrap();
        assert!(context.len() <= 20);
    }
}
