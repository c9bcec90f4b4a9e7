use civix_common::error::CommonError;

/// Application errors for the Civix server.
///
/// Resolution failures (`JurisdictionNotFound`, `RulesetNotFound`,
/// `TopicNotFound`) carry the identifier that failed so the boundary can
/// render a precise user-facing message. Upstream failures arrive wrapped in
/// `CommonError` and are recovered at the tool boundary, not inside the core.
/// A jurisdiction that exists but has no usable data is not an error; the
/// query layer answers it gracefully.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("jurisdiction not found: {0}")]
    JurisdictionNotFound(String),

    #[error("no rules found for {category} in {jurisdiction}")]
    RulesetNotFound {
        jurisdiction: String,
        category: String,
    },

    #[error("topic not found: {0}")]
    TopicNotFound(String),

    #[error("config error: {0}")]
    Config(String),
}
