//! Conveyor error taxonomy (spec.md §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConveyorError {
    #[error("request not found: {0}")]
    RequestNotFound(uuid::Uuid),

    #[error("transfer submission failed: {0}")]
    SubmissionFailed(String),

    #[error(transparent)]
    Catalog(#[from] catalog::CatalogError),
}

impl ConveyorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ConveyorError::Catalog(c) if c.is_transient())
    }
}
