//! Subscription filter evaluation (spec.md §4.6): `pattern` regex-matches
//! the name, `scope` is list membership, every other key is metadata list
//! membership. All keys must match.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use catalog::did::Did;

/// Whether `did` (with its fetched `metadata`) satisfies every key of
/// `filter`. A non-object filter never matches.
pub fn matches(filter: &Value, did: &Did, metadata: &HashMap<String, Value>) -> bool {
    let Some(obj) = filter.as_object() else { return false };
    obj.iter().all(|(key, value)| match key.as_str() {
        "pattern" => value.as_str().and_then(|p| Regex::new(p).ok()).map(|re| re.is_match(&did.name)).unwrap_or(false),
        "scope" => value.as_array().map(|scopes| scopes.iter().any(|s| s.as_str() == Some(did.scope.as_str()))).unwrap_or(false),
        other => value.as_array().map(|values| metadata.get(other).map(|v| values.contains(v)).unwrap_or(false)).unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pattern_matches_name() {
        let filter = json!({"pattern": "^data17_13TeV\\."});
        let did = Did::new("data17_13TeV", "data17_13TeV.00123.physics.DAOD.1");
        assert!(matches(&filter, &did, &HashMap::new()));
    }

    #[test]
    fn scope_must_be_in_list() {
        let filter = json!({"scope": ["data17_13TeV", "data18_13TeV"]});
        let in_scope = Did::new("data17_13TeV", "x");
        let out_of_scope = Did::new("mc16_13TeV", "x");
        assert!(matches(&filter, &in_scope, &HashMap::new()));
        assert!(!matches(&filter, &out_of_scope, &HashMap::new()));
    }

    #[test]
    fn other_keys_check_metadata_membership() {
        let filter = json!({"datatype": ["DAOD_PHYS"]});
        let did = Did::new("s", "n");
        let mut meta = HashMap::new();
        meta.insert("datatype".to_string(), json!("DAOD_PHYS"));
        assert!(matches(&filter, &did, &meta));

        meta.insert("datatype".to_string(), json!("AOD"));
        assert!(!matches(&filter, &did, &meta));
    }

    #[test]
    fn all_keys_must_match() {
        let filter = json!({"scope": ["data17_13TeV"], "datatype": ["DAOD_PHYS"]});
        let did = Did::new("data17_13TeV", "x");
        let mut meta = HashMap::new();
        meta.insert("datatype".to_string(), json!("AOD"));
        assert!(!matches(&filter, &did, &meta));
    }
}
