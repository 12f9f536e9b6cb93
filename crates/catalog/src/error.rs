//! Catalog-local error taxonomy. Every variant here is surfaced to the
//! caller unchanged; higher layers (rule-engine, conveyor) are the ones
//! that decide whether an error is retryable.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("data identifier {scope}:{name} not found")]
    DataIdentifierNotFound { scope: String, name: String },

    #[error("RSE {0} not found")]
    RseNotFound(String),

    #[error("rule {0} not found")]
    RuleNotFound(uuid::Uuid),

    #[error("replica {rse_id}:{scope}:{name} not found")]
    ReplicaNotFound { rse_id: String, scope: String, name: String },

    #[error("request {0} not found")]
    RequestNotFound(uuid::Uuid),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("invalid object: {0}")]
    InvalidObject(String),

    #[error("unsupported status transition: {0}")]
    UnsupportedStatus(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("row lock contention on {0}, try again")]
    LockContention(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl CatalogError {
    /// Whether a caller should back off and retry rather than surface the
    /// error. Mirrors the "transient DB" class in the top-level error
    /// taxonomy.
    pub fn is_transient(&self) -> bool {
        matches!(self, CatalogError::LockContention(_))
    }
}
