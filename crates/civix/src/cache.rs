/// Redis caching for retrieval results.
///
/// Embedding a question costs a metered upstream call, so ranked retrievals
/// are cached per jurisdiction under a digest of the question and K. All
/// operations degrade gracefully: a cold or absent Redis means every lookup
/// misses and the pipeline computes from source.
///
/// Key schema (namespaced to avoid collisions):
/// - `civix:v1:retrieval:{jurisdiction_id}:{sha256(question|k)}` holds the
///   JSON-serialized ranked retrieval (TTL: 3600s)
use sha2::{Digest, Sha256};
use tracing::warn;

use civix_common::redis::RedisCache;

use crate::retrieval::RankedRetrieval;

const KEY_PREFIX: &str = "civix:v1:";
const RETRIEVAL_TTL_SECS: u64 = 3600;

pub struct QueryCache {
    redis: RedisCache,
}

impl QueryCache {
    pub fn new(redis: RedisCache) -> Self {
        Self { redis }
    }

    pub async fn get_retrieval(
        &self,
        jurisdiction_id: &str,
        question: &str,
        k: usize,
    ) -> Option<RankedRetrieval> {
        let key = retrieval_key(jurisdiction_id, question, k);
        let json = self.redis.get(&key).await?;
        serde_json::from_str(&json)
            .inspect_err(|e| warn!(error = %e, key, "cache deserialization failed"))
            .ok()
    }

    pub async fn set_retrieval(
        &self,
        jurisdiction_id: &str,
        question: &str,
        k: usize,
        retrieval: &RankedRetrieval,
    ) {
        let key = retrieval_key(jurisdiction_id, question, k);
        if let Ok(json) = serde_json::to_string(retrieval) {
            self.redis
                .set_with_ttl(&key, &json, RETRIEVAL_TTL_SECS)
                .await;
        }
    }
}

/// Deterministic cache key for a question within a jurisdiction.
fn retrieval_key(jurisdiction_id: &str, question: &str, k: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(question.as_bytes());
    hasher.update(b"|");
    hasher.update(k.to_string().as_bytes());
    let hash = hasher.finalize();
    format!("{KEY_PREFIX}retrieval:{jurisdiction_id}:{hash:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_scoped_by_jurisdiction_question_and_k() {
        let a = retrieval_key("cincinnati-oh", "fence height", 5);
        let b = retrieval_key("covington-ky", "fence height", 5);
        let c = retrieval_key("cincinnati-oh", "noise rules", 5);
        let d = retrieval_key("cincinnati-oh", "fence height", 3);

        assert!(a.starts_with("civix:v1:retrieval:cincinnati-oh:"));
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a, retrieval_key("cincinnati-oh", "fence height", 5));
    }
}
