/// Error types shared across Civix crates.
///
/// These errors represent failures in infrastructure collaborators (Redis, the
/// embedding service, the completion service) that the core consumes but does
/// not own. Application-specific errors are defined in the server crate and
/// wrap `CommonError` via `#[from]`.
use crate::completion::CompletionError;
use crate::embedding::EmbeddingError;

#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("embedding service error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("completion service error: {0}")]
    Completion(#[from] CompletionError),
}
