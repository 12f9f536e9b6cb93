//! Data identifiers: files, datasets and containers, and the containment
//! edges that relate them into a DAG.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Did {
    pub scope: String,
    pub name: String,
}

impl Did {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Did { scope: scope.into(), name: name.into() }
    }
}

impl std::fmt::Display for Did {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.scope, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DidKind {
    File,
    Dataset,
    Container,
}

impl DidKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DidKind::File => "FILE",
            DidKind::Dataset => "DATASET",
            DidKind::Container => "CONTAINER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FILE" => Some(DidKind::File),
            "DATASET" => Some(DidKind::Dataset),
            "CONTAINER" => Some(DidKind::Container),
            _ => None,
        }
    }
}

/// A DID record. `bytes`/`adler32`/`md5` are only meaningful for `File`;
/// `is_open`/`monotonic` only for `Dataset`/`Container`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DidRecord {
    pub did: Did,
    pub kind: DidKind,
    pub bytes: Option<u64>,
    pub adler32: Option<String>,
    pub md5: Option<String>,
    pub is_open: bool,
    pub monotonic: bool,
}

impl DidRecord {
    pub fn new_file(did: Did, bytes: u64, adler32: Option<String>, md5: Option<String>) -> Self {
        DidRecord { did, kind: DidKind::File, bytes: Some(bytes), adler32, md5, is_open: false, monotonic: false }
    }

    pub fn new_collection(did: Did, kind: DidKind, monotonic: bool) -> Self {
        assert!(kind != DidKind::File, "use new_file for file DIDs");
        DidRecord { did, kind, bytes: None, adler32: None, md5: None, is_open: true, monotonic }
    }
}
