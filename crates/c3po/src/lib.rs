//! Optional placement advisor ("C3PO"): given a candidate dataset DID,
//! proposes a destination RSE from free-space and popularity signals,
//! consumed by the rule engine when a rule requests automatic placement
//! (spec.md §4.7).

pub mod advisor;
pub mod config;
pub mod error;
pub mod popularity;

pub use advisor::{Advisor, Decision};
pub use config::Config;
pub use error::C3poError;
pub use popularity::{PopularitySource, StaticPopularity};
