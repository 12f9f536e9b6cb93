//! Tunables for the placement advisor (spec.md §4.7), defaults matching
//! the values named in the spec text rather than invented round numbers.

#[derive(Debug, Clone)]
pub struct Config {
    /// A candidate DID's name must start with one of these to be
    /// considered at all.
    pub name_prefixes: Vec<String>,
    /// Popularity below this value declines the placement.
    pub popularity_threshold: f64,
    /// `>=` this many existing replicas on DATADISK RSEs declines.
    pub max_existing_replicas: usize,
    /// RSE attribute value `eligible_tier` must equal, as an RSE
    /// attribute keyed `tier`.
    pub eligible_tier: i64,
    /// RSE attribute value `eligible_type` must equal, as an RSE
    /// attribute keyed `type`.
    pub eligible_type: String,
    /// Penalty applied to a winning RSE immediately after it is chosen.
    pub cooldown_penalty: f64,
    /// Amount every RSE's penalty decays by on each `tick()`.
    pub decay_step: f64,
    /// Penalty never decays below this (the un-cooled baseline).
    pub penalty_floor: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name_prefixes: vec!["data".to_string(), "mc".to_string()],
            popularity_threshold: 10.0,
            max_existing_replicas: 5,
            eligible_tier: 2,
            eligible_type: "DATADISK".to_string(),
            cooldown_penalty: 10.0,
            decay_step: 1.0,
            penalty_floor: 1.0,
        }
    }
}
