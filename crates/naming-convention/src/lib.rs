//! Per-scope naming-convention admission check (spec.md §4.3): a regex
//! attached to `(scope, did_kind)` that a new DID's name must fully match;
//! the regex's named capture groups become the DID's default metadata.
//!
//! Conventions are registered by an operator (out of scope: who is
//! authorized to do so) and cached compiled, with a bounded TTL so a
//! convention update is eventually picked up without every admission
//! paying a fresh compile.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::Regex;

use catalog::did::{Did, DidKind};
use catalog::error::CatalogError;
use catalog::Transaction;

#[derive(Debug, thiserror::Error)]
pub enum NamingConventionError {
    #[error("invalid object: {0}")]
    InvalidObject(String),

    #[error("invalid regex pattern for {scope:?}/{kind:?}: {source}")]
    InvalidPattern { scope: String, kind: DidKind, #[source] source: regex::Error },

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

struct CacheEntry {
    regex: Arc<Regex>,
    cached_at: Instant,
}

/// Registry of per-`(scope, did_kind)` conventions plus the compiled-regex
/// cache. The registry itself is the source of truth for patterns; the
/// cache only memoizes compilation.
pub struct Validator {
    patterns: Mutex<HashMap<(String, DidKind), String>>,
    cache: Mutex<HashMap<(String, DidKind), CacheEntry>>,
    ttl: Duration,
}

impl Validator {
    pub fn new(ttl: Duration) -> Self {
        Validator { patterns: Mutex::new(HashMap::new()), cache: Mutex::new(HashMap::new()), ttl }
    }

    /// Registers (or replaces) the convention for `(scope, kind)`.
    /// Replacing a pattern invalidates the cached compiled regex.
    pub fn set_convention(&self, scope: &str, kind: DidKind, pattern: &str) -> Result<(), NamingConventionError> {
        Regex::new(pattern).map_err(|source| NamingConventionError::InvalidPattern { scope: scope.to_string(), kind, source })?;
        self.patterns.lock().insert((scope.to_string(), kind), pattern.to_string());
        self.cache.lock().remove(&(scope.to_string(), kind));
        Ok(())
    }

    fn compiled(&self, scope: &str, kind: DidKind) -> Option<Arc<Regex>> {
        let key = (scope.to_string(), kind);
        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.get(&key) {
                if entry.cached_at.elapsed() < self.ttl {
                    return Some(entry.regex.clone());
                }
            }
        }
        let pattern = self.patterns.lock().get(&key).cloned()?;
        let regex = Arc::new(Regex::new(&pattern).expect("pattern validated at set_convention time"));
        self.cache.lock().insert(key, CacheEntry { regex: regex.clone(), cached_at: Instant::now() });
        Some(regex)
    }

    /// Admission-checks `did` of kind `kind` against the registered
    /// convention for its scope, if any. On a match, persists the regex's
    /// named capture groups as default metadata via `tx`. No convention
    /// registered is not an error — admission is a no-op.
    pub fn validate(&self, did: &Did, kind: DidKind, tx: &Transaction<'_>) -> Result<(), NamingConventionError> {
        let Some(regex) = self.compiled(&did.scope, kind) else {
            return Ok(());
        };
        let Some(captures) = regex.captures(&did.name) else {
            return Err(NamingConventionError::InvalidObject(format!(
                "{} does not match the naming convention for scope {}",
                did.name, did.scope
            )));
        };
        // Fullmatch semantics: the whole name must be consumed, not just a
        // substring (spec.md §4.3 "the name must fully match").
        let whole = captures.get(0).expect("capture group 0 always exists on a match");
        if whole.start() != 0 || whole.end() != did.name.len() {
            return Err(NamingConventionError::InvalidObject(format!(
                "{} does not fully match the naming convention for scope {}",
                did.name, did.scope
            )));
        }
        for name in regex.capture_names().flatten() {
            if let Some(value) = captures.name(name) {
                tx.set_did_metadata(did, name, &serde_json::Value::String(value.as_str().to_string()))?;
            }
        }
        Ok(())
    }
}

impl Default for Validator {
    fn default() -> Self {
        Validator::new(Duration::from_secs(3600))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::did::DidRecord;
    use catalog::Store;

    #[test]
    fn matching_name_extracts_metadata() {
        let validator = Validator::new(Duration::from_secs(3600));
        validator.set_convention("data13_tev", DidKind::Dataset, r"^data13_tev\.(?P<run>\d+)\.physics\.(?P<stream>\w+)$").unwrap();

        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let did = Did::new("data13_tev", "data13_tev.00276689.physics.Main");
        tx.insert_did(&DidRecord::new_collection(did.clone(), DidKind::Dataset, false)).unwrap();

        validator.validate(&did, DidKind::Dataset, &tx).unwrap();
        let metadata = tx.get_did_metadata(&did).unwrap();
        assert_eq!(metadata.get("run").unwrap(), &serde_json::json!("00276689"));
        assert_eq!(metadata.get("stream").unwrap(), &serde_json::json!("Main"));
    }

    #[test]
    fn non_matching_name_is_rejected() {
        let validator = Validator::new(Duration::from_secs(3600));
        validator.set_convention("data13_tev", DidKind::Dataset, r"^data13_tev\.\d+\.physics\.\w+$").unwrap();

        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let did = Did::new("data13_tev", "garbage-name");
        tx.insert_did(&DidRecord::new_collection(did.clone(), DidKind::Dataset, false)).unwrap();

        let err = validator.validate(&did, DidKind::Dataset, &tx).unwrap_err();
        assert!(matches!(err, NamingConventionError::InvalidObject(_)));
    }

    #[test]
    fn partial_match_is_rejected_fullmatch_semantics() {
        let validator = Validator::new(Duration::from_secs(3600));
        validator.set_convention("s", DidKind::Dataset, r"abc").unwrap();

        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let did = Did::new("s", "xxabcxx");
        tx.insert_did(&DidRecord::new_collection(did.clone(), DidKind::Dataset, false)).unwrap();

        let err = validator.validate(&did, DidKind::Dataset, &tx).unwrap_err();
        assert!(matches!(err, NamingConventionError::InvalidObject(_)));
    }

    #[test]
    fn no_convention_registered_is_a_no_op() {
        let validator = Validator::new(Duration::from_secs(3600));
        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let did = Did::new("other_scope", "anything-goes");
        tx.insert_did(&DidRecord::new_collection(did.clone(), DidKind::Dataset, false)).unwrap();
        validator.validate(&did, DidKind::Dataset, &tx).unwrap();
    }
}
