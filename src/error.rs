//! Error taxonomy for the query core.
//!
//! Only two variants ever reach an API caller as failures:
//! [`RecallError::InvalidInput`] and [`RecallError::Embedding`] (plus
//! [`RecallError::Store`] for database read failures). `EmptyIndex` and
//! `Synthesis` are recovered inside the engine — the former becomes an
//! explicit "no knowledge" response, the latter degrades the request to
//! retrieval-only.
//!
//! There is deliberately no `SessionNotFound` variant:
//! [`crate::session::SessionManager::get_or_create`] always succeeds.

use thiserror::Error;

/// Errors produced by the retrieval and navigation pipeline.
#[derive(Debug, Error)]
pub enum RecallError {
    /// The question was empty or exceeded the configured size limit.
    /// Rejected before any retrieval work.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The embedding provider was unreachable or returned a malformed
    /// vector. Fatal to the request.
    #[error("embedding provider failed: {0}")]
    Embedding(#[source] anyhow::Error),

    /// The vector index contains zero fragments. Non-fatal: callers inside
    /// the engine turn this into a "no knowledge" response.
    #[error("the index contains no documents")]
    EmptyIndex,

    /// The LLM synthesis call failed (timeout, auth, rate limit).
    /// Recovered locally by degrading to retrieval-only mode.
    #[error("synthesis failed: {0}")]
    Synthesis(#[source] anyhow::Error),

    /// A read against the vector index or entity graph failed.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Convenience alias used across the query core.
pub type Result<T> = std::result::Result<T, RecallError>;
