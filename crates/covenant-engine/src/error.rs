//! Covenant Engine — startup error types.

use covenant_core::error::DomainError;
use thiserror::Error;

/// Errors raised while configuring and assembling the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An environment variable is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Database connection, pool or migration error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Handler registration or projection startup failed.
    #[error(transparent)]
    Domain(#[from] DomainError),
}
