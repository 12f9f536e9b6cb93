//! Error surface for the expression evaluator. A single variant: malformed
//! input is always `InvalidRSEExpression` (spec.md §4.2); anything else
//! that happens while resolving atoms against the catalog is a catalog
//! error, passed through unchanged.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RseExprError {
    #[error("invalid RSE expression: {0}")]
    InvalidRSEExpression(String),

    #[error(transparent)]
    Catalog(#[from] catalog::CatalogError),
}
