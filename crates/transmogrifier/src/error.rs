//! Transmogrifier error taxonomy (spec.md §7). Catalog I/O failure on a
//! chunk fails that whole job (the supervisor's retry policy then decides
//! whether to resubmit); a single subscription's rule-template failure
//! never propagates here — it is logged and skipped in place
//! (spec.md §4.6 "`InvalidReplicationRule` is logged and skipped").

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransmogrifierError {
    #[error(transparent)]
    Catalog(#[from] catalog::CatalogError),
}
