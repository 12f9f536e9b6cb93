//! c3po error taxonomy (spec.md §7). The advisor never mutates catalog
//! state itself, so there is no `Transient` variant to react to here —
//! callers simply skip a tick on `Catalog` error the same way any other
//! daemon treats an "internal" class failure.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum C3poError {
    #[error(transparent)]
    Catalog(#[from] catalog::CatalogError),
}
