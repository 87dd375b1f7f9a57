//! Error taxonomy for feed adapters
//!
//! Classifies fetch failures so the orchestrator can distinguish transient
//! transport problems from endpoint rejections and malformed payloads. All
//! of them are recoverable: the source is marked faulty and the cycle
//! continues on the next tick.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    /// Transport-level failure (connect, timeout, TLS)
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The endpoint answered but refused the request
    #[error("endpoint rejected request with status {status}")]
    Endpoint { status: u16 },

    /// The endpoint answered with a payload we could not interpret
    #[error("failed to decode payload: {0}")]
    Decode(String),

    /// The adapter does not serve the requested pair
    #[error("pair {0} not served by this feed")]
    UnknownPair(String),
}

impl FeedError {
    /// Transient errors are expected to clear on a later cycle without
    /// operator intervention.
    pub fn is_transient(&self) -> bool {
        match self {
            FeedError::Http(_) => true,
            FeedError::Endpoint { status } => *status >= 500 || *status == 429,
            FeedError::Decode(_) => false,
            FeedError::UnknownPair(_) => false,
        }
    }
}
