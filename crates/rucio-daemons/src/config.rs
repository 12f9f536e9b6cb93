//! Daemon configuration (spec.md §6): `chunksize`, `maxdids`,
//! `sleep_time`, `poll_interval`, `retry_limit`, `submit_stuck_timeout`,
//! loadable from a TOML file with environment overrides — the Rust
//! analogue of `rucio.common.config.config_get*`.
//!
//! `cache_ttl` is not a knob here: the only TTL-based cache in the
//! workspace is `naming_convention::Validator`'s compiled-regex cache,
//! and no role in this binary constructs a `Validator` (naming-
//! convention admission happens at DID-registration time, which is out
//! of scope for these daemons). `Validator::default()` carries its own
//! fixed TTL; a role that registers DIDs would take the TTL as its own
//! config knob instead of duplicating it here.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, #[source] source: std::io::Error },

    #[error("failed to parse config file {path}: {source}")]
    Parse { path: String, #[source] source: toml::de::Error },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: Option<String>,
    pub external_host: String,
    pub chunksize: usize,
    pub maxdids: usize,
    pub sleep_time_secs: u64,
    pub poll_interval_secs: u64,
    pub retry_limit: i32,
    pub submit_stuck_timeout_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: None,
            external_host: "fts.example.org".to_string(),
            chunksize: 100,
            maxdids: 1000,
            sleep_time_secs: 60,
            poll_interval_secs: 60,
            retry_limit: 3,
            submit_stuck_timeout_secs: 1800,
        }
    }
}

impl Config {
    /// Loads defaults, overlaid by `path`'s TOML contents (if given),
    /// overlaid by any `RUCIO_*` environment variables that name a field.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;
                toml::from_str(&raw).map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })?
            }
            None => Config::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RUCIO_DB_PATH") {
            self.db_path = Some(v);
        }
        if let Ok(v) = std::env::var("RUCIO_EXTERNAL_HOST") {
            self.external_host = v;
        }
        if let Some(v) = env_usize("RUCIO_CHUNKSIZE") {
            self.chunksize = v;
        }
        if let Some(v) = env_usize("RUCIO_MAXDIDS") {
            self.maxdids = v;
        }
        if let Some(v) = env_u64("RUCIO_SLEEP_TIME") {
            self.sleep_time_secs = v;
        }
        if let Some(v) = env_u64("RUCIO_POLL_INTERVAL") {
            self.poll_interval_secs = v;
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.retry_limit, 3);
        assert_eq!(config.submit_stuck_timeout_secs, 1800);
    }

    #[test]
    fn loads_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rucio.toml");
        std::fs::write(&path, "chunksize = 250\nmaxdids = 5000\nexternal_host = \"fts.cern.ch\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.chunksize, 250);
        assert_eq!(config.maxdids, 5000);
        assert_eq!(config.external_host, "fts.cern.ch");
        assert_eq!(config.sleep_time_secs, 60, "unset fields keep their default");
    }

    #[test]
    fn missing_file_surfaces_read_error() {
        let err = Config::load(Some(Path::new("/nonexistent/rucio.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
