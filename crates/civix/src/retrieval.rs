/// Similarity retrieval over ordinance chunks.
///
/// Embeds the question (one call to the embedding service), scores every
/// usable chunk with cosine similarity in-process, and keeps the top K.
/// Fails closed: a jurisdiction with no chunks, or none carrying a usable
/// embedding, yields an explicit no-data outcome instead of similarity math
/// over an empty or partial set.
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use civix_common::embedding::EmbeddingProvider;
use civix_common::error::CommonError;

use crate::cache::QueryCache;
use crate::error::AppError;
use crate::model::RetrievedChunk;
use crate::store::Store;

pub const DEFAULT_TOP_K: usize = 5;

/// Ranked chunks plus how many usable chunks were scored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedRetrieval {
    pub chunks_searched: usize,
    pub top: Vec<RetrievedChunk>,
}

/// Outcome of a retrieval attempt for a known jurisdiction.
#[derive(Debug)]
pub enum Retrieval {
    /// The jurisdiction has no ordinance chunks at all.
    NoChunks,
    /// Chunks exist but none carries a usable embedding.
    NoEmbeddedChunks,
    Ranked(RankedRetrieval),
}

/// Cosine similarity: dot product over the product of norms. Returns 0.0
/// when either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let norm_a = norm_a.sqrt();
    let norm_b = norm_b.sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Display percentage for a cosine score: rounded to the nearest integer and
/// clamped to [0, 100]. Negative similarity never surfaces as a negative
/// percentage; raw scores stay unclamped internally for ranking.
pub fn similarity_percent(similarity: f32) -> u8 {
    (similarity.clamp(0.0, 1.0) * 100.0).round() as u8
}

pub struct Retriever {
    store: Store,
    embedder: Arc<dyn EmbeddingProvider>,
    cache: Arc<QueryCache>,
}

impl Retriever {
    pub fn new(store: Store, embedder: Arc<dyn EmbeddingProvider>, cache: Arc<QueryCache>) -> Self {
        Self {
            store,
            embedder,
            cache,
        }
    }

    /// Rank a jurisdiction's chunks against a question and keep the top `k`.
    ///
    /// Chunks without an embedding, or with one that does not match the
    /// query's dimensionality, are excluded from scoring rather than scored
    /// as zero. Ranked results are cached; identical questions skip the
    /// embedding call entirely.
    pub async fn retrieve(
        &self,
        jurisdiction_id: &str,
        question: &str,
        k: usize,
    ) -> Result<Retrieval, AppError> {
        if let Some(cached) = self.cache.get_retrieval(jurisdiction_id, question, k).await {
            info!(jurisdiction_id, question, "retrieval cache hit");
            return Ok(Retrieval::Ranked(cached));
        }

        let chunks = self.store.chunks(jurisdiction_id).await?;
        if chunks.is_empty() {
            return Ok(Retrieval::NoChunks);
        }

        let embedded: Vec<_> = chunks
            .into_iter()
            .filter(|c| c.embedding.is_some())
            .collect();
        if embedded.is_empty() {
            return Ok(Retrieval::NoEmbeddedChunks);
        }

        let query_embedding = self
            .embedder
            .embed_query(question)
            .await
            .map_err(CommonError::from)?;

        let mut scored: Vec<RetrievedChunk> = Vec::with_capacity(embedded.len());
        for chunk in embedded {
            let embedding = chunk.embedding.as_deref().unwrap_or_default();
            if embedding.len() != query_embedding.len() {
                warn!(
                    chunk = %chunk.id,
                    stored = embedding.len(),
                    expected = query_embedding.len(),
                    "embedding dimensionality mismatch, chunk excluded"
                );
                continue;
            }
            let similarity = cosine_similarity(&query_embedding, embedding);
            scored.push(RetrievedChunk {
                id: chunk.id,
                chapter: chunk.chapter,
                section: chunk.section,
                title: chunk.title,
                content: chunk.content,
                source_url: chunk.source_url,
                similarity,
            });
        }

        if scored.is_empty() {
            return Ok(Retrieval::NoEmbeddedChunks);
        }

        let chunks_searched = scored.len();
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);

        let ranked = RankedRetrieval {
            chunks_searched,
            top: scored,
        };
        self.cache
            .set_retrieval(jurisdiction_id, question, k, &ranked)
            .await;

        Ok(Retrieval::Ranked(ranked))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use civix_common::embedding::{EmbeddingError, EmbeddingProvider};

    /// Embedding fake returning a fixed vector for every query.
    pub struct FixedEmbedder(pub Vec<f32>);

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        fn model(&self) -> &str {
            "fixed-test-embedder"
        }

        async fn embed_query(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(self.0.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civix_common::redis::RedisCache;

    #[test]
    fn cosine_is_symmetric_and_self_similar() {
        let a = [0.3f32, -0.7, 0.2, 0.9];
        let b = [0.1f32, 0.4, -0.2, 0.5];

        let ab = cosine_similarity(&a, &b);
        let ba = cosine_similarity(&b, &a);
        assert!((ab - ba).abs() < 1e-6);
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_and_opposite() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn zero_magnitude_vectors_score_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[0.0, 0.0]), 0.0);
    }

    #[test]
    fn percent_rounds_and_clamps() {
        assert_eq!(similarity_percent(1.0), 100);
        assert_eq!(similarity_percent(0.666), 67);
        assert_eq!(similarity_percent(0.004), 0);
        assert_eq!(similarity_percent(0.0), 0);
        // Negative cosine clamps to zero rather than surfacing as negative.
        assert_eq!(similarity_percent(-0.42), 0);
        // Anything above 1 (float noise) caps at 100.
        assert_eq!(similarity_percent(1.0000001), 100);
    }

    async fn seeded_retriever(query_vec: Vec<f32>) -> (Retriever, Store) {
        let store = Store::connect_in_memory().await.unwrap();
        store.migrate().await.unwrap();
        store
            .insert_jurisdiction("cincinnati-oh", "Cincinnati", "OH", "city")
            .await;

        let cache = Arc::new(QueryCache::new(RedisCache::new(None)));
        let retriever = Retriever::new(
            store.clone(),
            Arc::new(testing::FixedEmbedder(query_vec)),
            cache,
        );
        (retriever, store)
    }

    #[tokio::test]
    async fn no_chunks_fails_closed() {
        let (retriever, _store) = seeded_retriever(vec![1.0, 0.0]).await;
        let outcome = retriever.retrieve("cincinnati-oh", "noise?", 5).await.unwrap();
        assert!(matches!(outcome, Retrieval::NoChunks));
    }

    #[tokio::test]
    async fn chunks_without_embeddings_fail_closed() {
        let (retriever, store) = seeded_retriever(vec![1.0, 0.0]).await;
        store
            .insert_chunk("c1", "cincinnati-oh", "910", None, "Noise", "Quiet hours.", None, None)
            .await;

        let outcome = retriever.retrieve("cincinnati-oh", "noise?", 5).await.unwrap();
        assert!(matches!(outcome, Retrieval::NoEmbeddedChunks));
    }

    #[tokio::test]
    async fn orthogonal_chunks_rank_by_similarity() {
        let (retriever, store) = seeded_retriever(vec![1.0, 0.0]).await;
        store
            .insert_chunk(
                "c1", "cincinnati-oh", "701", Some("3"), "Fences", "Fence heights.",
                Some("[1.0, 0.0]"), None,
            )
            .await;
        store
            .insert_chunk(
                "c2", "cincinnati-oh", "910", None, "Noise", "Quiet hours.",
                Some("[0.0, 1.0]"), None,
            )
            .await;

        let outcome = retriever.retrieve("cincinnati-oh", "fence?", 2).await.unwrap();
        let Retrieval::Ranked(ranked) = outcome else {
            panic!("expected ranked retrieval");
        };
        assert_eq!(ranked.chunks_searched, 2);
        assert_eq!(ranked.top.len(), 2);
        assert_eq!(ranked.top[0].id, "c1");
        assert_eq!(similarity_percent(ranked.top[0].similarity), 100);
        assert_eq!(similarity_percent(ranked.top[1].similarity), 0);
        assert!(!ranked.top[1].similarity.is_nan());
    }

    #[tokio::test]
    async fn top_k_is_bounded_by_usable_chunks() {
        let (retriever, store) = seeded_retriever(vec![1.0, 0.0]).await;
        store
            .insert_chunk("c1", "cincinnati-oh", "701", None, "A", "a", Some("[1.0, 0.0]"), None)
            .await;
        store
            .insert_chunk("c2", "cincinnati-oh", "702", None, "B", "b", Some("[0.5, 0.5]"), None)
            .await;
        store
            .insert_chunk("c3", "cincinnati-oh", "703", None, "C", "c", None, None)
            .await;

        let outcome = retriever.retrieve("cincinnati-oh", "q", 10).await.unwrap();
        let Retrieval::Ranked(ranked) = outcome else {
            panic!("expected ranked retrieval");
        };
        // Only the two embedded chunks count or return.
        assert_eq!(ranked.chunks_searched, 2);
        assert_eq!(ranked.top.len(), 2);

        let outcome = retriever.retrieve("cincinnati-oh", "q2", 1).await.unwrap();
        let Retrieval::Ranked(ranked) = outcome else {
            panic!("expected ranked retrieval");
        };
        assert_eq!(ranked.top.len(), 1);
    }

    #[tokio::test]
    async fn dimension_mismatched_embeddings_are_excluded() {
        let (retriever, store) = seeded_retriever(vec![1.0, 0.0]).await;
        store
            .insert_chunk(
                "good", "cincinnati-oh", "701", None, "A", "a", Some("[0.8, 0.6]"), None,
            )
            .await;
        store
            .insert_chunk(
                "short", "cincinnati-oh", "702", None, "B", "b", Some("[1.0]"), None,
            )
            .await;

        let outcome = retriever.retrieve("cincinnati-oh", "q", 5).await.unwrap();
        let Retrieval::Ranked(ranked) = outcome else {
            panic!("expected ranked retrieval");
        };
        assert_eq!(ranked.chunks_searched, 1);
        assert_eq!(ranked.top[0].id, "good");
    }
}
