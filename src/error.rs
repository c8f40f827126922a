//! Error taxonomy for the voice core.
//!
//! Variants map onto the recovery policy each error kind gets: retried,
//! swallowed, or surfaced to the client. See each call site for which one
//! applies.

/// Top-level error type for the voice pipeline.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Transient provider failure (5xx, timeout). Callers retry with backoff
    /// before converting this into a `ProviderPermanent`.
    #[error("provider error (retryable): {0}")]
    ProviderRetryable(String),

    /// Non-transient provider failure: 4xx, malformed response, or retries
    /// exhausted.
    #[error("provider error: {0}")]
    ProviderPermanent(String),

    /// Audio buffer was below the minimum size to bother transcribing.
    #[error("audio too small to transcribe")]
    AudioTooSmall,

    /// The LLM's response text could not be parsed as the structured reply
    /// envelope.
    #[error("could not parse reply envelope: {0}")]
    EnvelopeParseFailure(String),

    /// The LLM named a product id that doesn't exist in the session's menu.
    #[error("recommended product {0} not found in menu")]
    RecommendationUnresolved(i64),

    /// Work was cancelled by barge-in, disconnect, or speculation loss.
    #[error("cancelled")]
    Cancelled,

    /// Send to the client failed; the connection is gone.
    #[error("client disconnected: {0}")]
    ClientGone(String),

    /// The table token did not resolve to a known menu scope.
    #[error("unknown table token")]
    ScopeNotFound,

    /// Configuration is missing or malformed.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error (opener cache read/write, etc).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error outside the envelope-parse path.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Underlying HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal channel closed unexpectedly.
    #[error("channel error: {0}")]
    Channel(String),
}

impl CoreError {
    /// Whether this error should be retried by the caller rather than
    /// surfaced or swallowed outright.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::ProviderRetryable(_))
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, CoreError>;
