//! Rule-engine error taxonomy (spec.md §7). Transient DB contention
//! collapses into `Defer`: the caller should requeue the rule for the
//! next tick rather than surface anything to the end user or mark the
//! rule `STUCK`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleEngineError {
    #[error("data identifier not found: {0}")]
    DataIdentifierNotFound(String),

    #[error("RSE not found: {0}")]
    RseNotFound(String),

    #[error("rule not found: {0}")]
    RuleNotFound(uuid::Uuid),

    #[error("invalid RSE expression: {0}")]
    InvalidRSEExpression(String),

    #[error("duplicate rule: {0}")]
    DuplicateRule(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("insufficient account limit: {0}")]
    InsufficientAccountLimit(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Row-lock contention on the rule: the caller should re-queue this
    /// rule for the next tick without surfacing an error (spec.md §4.4
    /// "Failure semantics").
    #[error("deferred: {0}")]
    Defer(String),

    #[error(transparent)]
    Catalog(#[from] catalog::CatalogError),
}

impl From<rse_expr::RseExprError> for RuleEngineError {
    fn from(e: rse_expr::RseExprError) -> Self {
        match e {
            rse_expr::RseExprError::InvalidRSEExpression(msg) => RuleEngineError::InvalidRSEExpression(msg),
            rse_expr::RseExprError::Catalog(c) => RuleEngineError::from(c),
        }
    }
}

impl RuleEngineError {
    /// Whether callers should defer (requeue without error) rather than
    /// surface this as user-facing or mark the rule `STUCK`.
    pub fn is_transient(&self) -> bool {
        match self {
            RuleEngineError::Defer(_) => true,
            RuleEngineError::Catalog(c) => c.is_transient(),
            _ => false,
        }
    }
}
