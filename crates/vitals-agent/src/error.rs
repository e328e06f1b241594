//! Error types for the agent pipeline.

use thiserror::Error;

/// Errors that can occur while encoding or delivering a batch.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to encode batch: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("compression error: {0}")]
    Compress(#[from] std::io::Error),

    #[error("encryption error: {0}")]
    Encrypt(#[from] vitals_core::CryptoError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server rejected batch with status {0}")]
    Rejected(u16),

    #[error("delivery cancelled by shutdown")]
    Cancelled,
}
