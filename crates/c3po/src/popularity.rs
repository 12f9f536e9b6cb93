//! Popularity signal seam. The real popularity backend (an external
//! access-frequency aggregator) is out of scope (spec.md §1 "External
//! collaborators with named interfaces only"); this trait is the
//! interface the advisor consumes.

use catalog::did::Did;

use crate::error::C3poError;

pub trait PopularitySource: Send + Sync {
    /// Accesses-per-some-window for `did`, or `0.0` if never seen.
    fn popularity(&self, did: &Did) -> Result<f64, C3poError>;
}

/// Fixed-table popularity source for tests and small deployments.
#[derive(Debug, Clone, Default)]
pub struct StaticPopularity {
    scores: std::collections::HashMap<Did, f64>,
}

impl StaticPopularity {
    pub fn new() -> Self {
        StaticPopularity::default()
    }

    pub fn set(&mut self, did: Did, score: f64) {
        self.scores.insert(did, score);
    }
}

impl PopularitySource for StaticPopularity {
    fn popularity(&self, did: &Did) -> Result<f64, C3poError> {
        Ok(self.scores.get(did).copied().unwrap_or(0.0))
    }
}
