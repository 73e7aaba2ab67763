//! Remote Store Client - contract consumed by the sync core
//!
//! The backend is authoritative but may fail at any time. Every failure is a
//! [`RemoteError`] that classifies itself as transient (retry later) or
//! permanent (retrying will not change the outcome).

pub mod http;

use crate::mapper::RemoteDto;
use async_trait::async_trait;

pub use http::HttpRemoteStore;

/// Per-entity-type remote operations, keyed by entity type tag
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a record, returning the server representation
    async fn create(&self, entity_type: &str, dto: RemoteDto) -> Result<RemoteDto, RemoteError>;

    /// Update a record by id, returning the server representation
    async fn update(&self, entity_type: &str, dto: RemoteDto) -> Result<RemoteDto, RemoteError>;

    /// Delete a record by id; `false` if it did not exist remotely
    async fn delete(&self, entity_type: &str, id: &str) -> Result<bool, RemoteError>;

    async fn get_by_id(&self, entity_type: &str, id: &str) -> Result<Option<RemoteDto>, RemoteError>;

    /// All records, or only those updated at or after `since` (ms since epoch)
    async fn get_all(&self, entity_type: &str, since: Option<i64>) -> Result<Vec<RemoteDto>, RemoteError>;
}

/// Whether a failed remote call is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Unauthorized - session expired or missing")]
    Unauthorized,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Record not found")]
    NotFound,

    #[error("Record already exists: {0}")]
    Conflict(String),

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Network(_)
            | Self::Timeout
            | Self::Unauthorized
            | Self::RateLimited
            | Self::Server { .. } => FailureClass::Transient,
            Self::NotFound
            | Self::Conflict(_)
            | Self::Rejected { .. }
            | Self::InvalidResponse(_) => FailureClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout
        } else if err.is_decode() {
            RemoteError::InvalidResponse(err.to_string())
        } else {
            RemoteError::Network(err.to_string())
        }
    }
}
