//! Resolves which source RSE actually served a multi-source transfer's
//! bytes, by matching the reported `src_url` against the replica list
//! for the transferred DID (spec.md §4.5 "Source resolution for
//! multi-source transfers").

use catalog::did::Did;
use catalog::rse::RseId;
use catalog::Transaction;

use crate::error::ConveyorError;

/// Returns the RSE whose replica `path` is a suffix of `src_url`, or
/// `None` if no replica matches (the per-request source is then left as
/// originally reported, per spec).
pub fn resolve_source_rse(tx: &Transaction<'_>, did: &Did, src_url: &str) -> Result<Option<RseId>, ConveyorError> {
    for replica in tx.list_replicas(did)? {
        if let Some(path) = &replica.path {
            if src_url.ends_with(path.as_str()) {
                return Ok(Some(replica.rse_id));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use catalog::did::DidRecord;
    use catalog::replica::{Replica, ReplicaState};
    use catalog::rse::Rse;
    use catalog::Store;
    use uuid::Uuid;

    #[test]
    fn matches_replica_whose_path_suffixes_the_src_url() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let file = Did::new("s", "file.1");
        tx.insert_did(&DidRecord::new_file(file.clone(), 10, None, None)).unwrap();
        let rse_id = catalog::rse::RseId(Uuid::new_v4());
        tx.add_rse(&Rse {
            id: rse_id,
            name: "R1".into(),
            deterministic: false,
            volatile: false,
            availability_read: true,
            availability_write: true,
            availability_delete: true,
            usage_used: 0,
            usage_total: 0,
        })
        .unwrap();
        tx.add_replica(&Replica {
            rse_id,
            did: file.clone(),
            state: ReplicaState::Available,
            bytes: 10,
            adler32: None,
            md5: None,
            path: Some("ab/cd/file.1".to_string()),
            tombstone: None,
            lock_cnt: 0,
        })
        .unwrap();

        let found = resolve_source_rse(&tx, &file, "davs://host:443/prefix/ab/cd/file.1").unwrap();
        assert_eq!(found, Some(rse_id));
    }

    #[test]
    fn no_match_returns_none() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.transaction().unwrap();
        let file = Did::new("s", "file.1");
        tx.insert_did(&DidRecord::new_file(file.clone(), 10, None, None)).unwrap();

        let found = resolve_source_rse(&tx, &file, "davs://host:443/nowhere").unwrap();
        assert_eq!(found, None);
    }
}
