//! Error types for porthole.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("Subdomain '{0}' is not available")]
    SubdomainTaken(String),

    #[error("Subdomain '{0}' is not registered")]
    UnknownSubdomain(String),

    #[error("Duplicate request id {0}")]
    DuplicateRequestId(String),
}
