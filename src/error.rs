//! Error taxonomy for the gateway.
//!
//! Resolution errors are kept separate from the top-level [`GatewayError`]
//! because the resolution cache needs to tell recoverable outages (fall back
//! to the durable cache) from definitive answers (the name has no content).

use hyper::StatusCode;
use thiserror::Error;

/// Failure to turn a name into a content identifier.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolutionError {
    /// The name does not exist or has no resolver record
    #[error("no resolver is configured for {0}")]
    NoResolver(String),

    /// The name exists but carries no usable content hash
    #[error("{0} has no content hash")]
    NoContentHash(String),

    /// The resolution collaborator could not be reached or is still syncing
    #[error("name resolution unavailable: {0}")]
    Unavailable(String),

    /// The collaborator did not answer in time
    #[error("resolution of {0} timed out")]
    Timeout(String),

    /// The name cannot be used as a cache key
    #[error("invalid name: {0}")]
    InvalidName(String),
}

impl ResolutionError {
    /// True when the failure says nothing about the name itself
    pub fn is_upstream_unavailable(&self) -> bool {
        matches!(
            self,
            ResolutionError::Unavailable(_) | ResolutionError::Timeout(_)
        )
    }

    /// True when the name definitively has no content attached
    pub fn is_missing_content(&self) -> bool {
        matches!(
            self,
            ResolutionError::NoResolver(_) | ResolutionError::NoContentHash(_)
        )
    }
}

/// Top-level error type
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Fatal at startup: unusable crypto backend, unwritable directories, bad config
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// Certificate generation failed for one pattern; fails one handshake only
    #[error("certificate issuance failed for {pattern}: {reason}")]
    Issuance { pattern: String, reason: String },

    /// The content-store gateway was unreachable or errored
    #[error("proxy failure: {0}")]
    Proxy(String),

    /// A content-store RPC failed
    #[error("content store error: {0}")]
    ContentStore(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl GatewayError {
    pub fn issuance(pattern: impl Into<String>, reason: impl ToString) -> Self {
        GatewayError::Issuance {
            pattern: pattern.into(),
            reason: reason.to_string(),
        }
    }

    /// HTTP status used when this error reaches a client on a content route
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Resolution(_) => StatusCode::NOT_FOUND,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Configuration(_)
            | GatewayError::Issuance { .. }
            | GatewayError::Proxy(_)
            | GatewayError::ContentStore(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
