//! The transactional store of record, backed by `rusqlite`.
//!
//! Mirrors the teacher's `Bridge`: a single `Mutex<Connection>` as the
//! source of truth, with every mutation wrapped in an explicit
//! begin/commit/rollback scope that releases on every exit path (panic
//! included). Unlike `Bridge`, there is no in-memory `HashMap` read-path
//! cache here — SQLite's own secondary indexes carry that weight, since
//! the catalog's read patterns (by scope+name, by RSE, by state) are
//! exactly what a relational index is for.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use daemon::ShardSpec;

use crate::account::{AccountCounter, AccountCounterDelta, AccountLimit};
use crate::did::{Did, DidKind, DidRecord};
use crate::error::CatalogError;
use crate::lock::{DatasetLock, Lock, LockState};
use crate::locks::{RowLockGuard, RowLocks};
use crate::message::Message;
use crate::replica::{Replica, ReplicaState, ReplicaStateUpdate};
use crate::request::{Request, RequestId, RequestState, RequestType};
use crate::rse::{Protocol, Rse, RseAttribute, RseId};
use crate::rule::{Grouping, Rule, RuleId, RuleState};
use crate::subscription::{RuleTemplate, Subscription, SubscriptionState};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS dids (
    scope TEXT NOT NULL,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    bytes INTEGER,
    adler32 TEXT,
    md5 TEXT,
    is_open INTEGER NOT NULL DEFAULT 1,
    monotonic INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (scope, name)
);
CREATE TABLE IF NOT EXISTS containment_edges (
    parent_scope TEXT NOT NULL,
    parent_name TEXT NOT NULL,
    child_scope TEXT NOT NULL,
    child_name TEXT NOT NULL,
    PRIMARY KEY (parent_scope, parent_name, child_scope, child_name)
);
CREATE INDEX IF NOT EXISTS idx_edges_child ON containment_edges(child_scope, child_name);
CREATE TABLE IF NOT EXISTS did_metadata (
    scope TEXT NOT NULL,
    name TEXT NOT NULL,
    key TEXT NOT NULL,
    value_json TEXT NOT NULL,
    PRIMARY KEY (scope, name, key)
);
CREATE TABLE IF NOT EXISTS pending_dids (
    scope TEXT NOT NULL,
    name TEXT NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (scope, name)
);
CREATE INDEX IF NOT EXISTS idx_pending_dids_processed ON pending_dids(processed);
CREATE TABLE IF NOT EXISTS rses (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    deterministic INTEGER NOT NULL,
    volatile INTEGER NOT NULL,
    availability_read INTEGER NOT NULL,
    availability_write INTEGER NOT NULL,
    availability_delete INTEGER NOT NULL,
    usage_used INTEGER NOT NULL DEFAULT 0,
    usage_total INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS rse_attributes (
    rse_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value_json TEXT NOT NULL,
    PRIMARY KEY (rse_id, key)
);
CREATE TABLE IF NOT EXISTS protocols (
    rse_id TEXT NOT NULL,
    scheme TEXT NOT NULL,
    hostname TEXT NOT NULL,
    port INTEGER NOT NULL,
    prefix TEXT NOT NULL,
    impl TEXT NOT NULL,
    priority_read INTEGER NOT NULL,
    priority_write INTEGER NOT NULL,
    priority_delete INTEGER NOT NULL,
    extended_json TEXT,
    PRIMARY KEY (rse_id, scheme, hostname, port)
);
CREATE TABLE IF NOT EXISTS replicas (
    rse_id TEXT NOT NULL,
    scope TEXT NOT NULL,
    name TEXT NOT NULL,
    state TEXT NOT NULL,
    bytes INTEGER NOT NULL,
    adler32 TEXT,
    md5 TEXT,
    path TEXT,
    tombstone TEXT,
    lock_cnt INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (rse_id, scope, name)
);
CREATE INDEX IF NOT EXISTS idx_replicas_did ON replicas(scope, name);
CREATE TABLE IF NOT EXISTS locks (
    rule_id TEXT NOT NULL,
    rse_id TEXT NOT NULL,
    scope TEXT NOT NULL,
    name TEXT NOT NULL,
    state TEXT NOT NULL,
    PRIMARY KEY (rule_id, rse_id, scope, name)
);
CREATE INDEX IF NOT EXISTS idx_locks_rule ON locks(rule_id);
CREATE INDEX IF NOT EXISTS idx_locks_replica ON locks(rse_id, scope, name);
CREATE TABLE IF NOT EXISTS dataset_locks (
    rule_id TEXT NOT NULL,
    rse_id TEXT NOT NULL,
    scope TEXT NOT NULL,
    name TEXT NOT NULL,
    state TEXT NOT NULL,
    PRIMARY KEY (rule_id, rse_id, scope, name)
);
CREATE TABLE IF NOT EXISTS rules (
    id TEXT PRIMARY KEY,
    account TEXT NOT NULL,
    dids_json TEXT NOT NULL,
    copies INTEGER NOT NULL,
    rse_expression TEXT NOT NULL,
    grouping TEXT NOT NULL,
    weight_attr TEXT,
    lifetime_seconds INTEGER,
    locked INTEGER NOT NULL,
    subscription_id TEXT,
    state TEXT NOT NULL,
    locks_ok_cnt INTEGER NOT NULL DEFAULT 0,
    locks_replicating_cnt INTEGER NOT NULL DEFAULT 0,
    locks_stuck_cnt INTEGER NOT NULL DEFAULT 0,
    expires_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_rules_state ON rules(state);
CREATE INDEX IF NOT EXISTS idx_rules_subscription ON rules(subscription_id);
CREATE TABLE IF NOT EXISTS requests (
    id TEXT PRIMARY KEY,
    request_type TEXT NOT NULL,
    scope TEXT NOT NULL,
    name TEXT NOT NULL,
    dest_rse_id TEXT NOT NULL,
    src_rse_id TEXT,
    rule_id TEXT NOT NULL,
    attempt_id INTEGER NOT NULL,
    state TEXT NOT NULL,
    external_host TEXT,
    external_id TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    dest_url TEXT NOT NULL,
    src_url TEXT,
    previous_attempt_id TEXT,
    activity TEXT NOT NULL,
    bytes INTEGER NOT NULL,
    adler32 TEXT,
    md5 TEXT,
    job_m_replica INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_requests_state ON requests(state, updated_at);
CREATE INDEX IF NOT EXISTS idx_requests_transfer ON requests(external_host, external_id);
CREATE INDEX IF NOT EXISTS idx_requests_rule ON requests(rule_id, scope, name, dest_rse_id);
CREATE TABLE IF NOT EXISTS requests_archive (
    id TEXT PRIMARY KEY,
    request_type TEXT NOT NULL,
    scope TEXT NOT NULL,
    name TEXT NOT NULL,
    dest_rse_id TEXT NOT NULL,
    src_rse_id TEXT,
    rule_id TEXT NOT NULL,
    attempt_id INTEGER NOT NULL,
    state TEXT NOT NULL,
    external_host TEXT,
    external_id TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    dest_url TEXT NOT NULL,
    src_url TEXT,
    previous_attempt_id TEXT,
    activity TEXT NOT NULL,
    bytes INTEGER NOT NULL,
    adler32 TEXT,
    md5 TEXT,
    job_m_replica INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS account_counters (
    account TEXT NOT NULL,
    rse_id TEXT NOT NULL,
    bytes INTEGER NOT NULL DEFAULT 0,
    files INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (account, rse_id)
);
CREATE TABLE IF NOT EXISTS account_limits (
    account TEXT NOT NULL,
    rse_id TEXT NOT NULL,
    bytes_limit INTEGER NOT NULL,
    PRIMARY KEY (account, rse_id)
);
CREATE TABLE IF NOT EXISTS account_counter_deltas (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account TEXT NOT NULL,
    rse_id TEXT NOT NULL,
    bytes_delta INTEGER NOT NULL,
    files_delta INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS subscriptions (
    id TEXT PRIMARY KEY,
    account TEXT NOT NULL,
    filter_json TEXT NOT NULL,
    rules_json TEXT NOT NULL,
    state TEXT NOT NULL,
    last_processed TEXT
);
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

/// Owns the connection and the advisory row-lock registry; cheap to
/// clone, every clone shares the same underlying state.
#[derive(Clone)]
pub struct Store {
    conn: std::sync::Arc<Mutex<Connection>>,
    row_locks: RowLocks,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, CatalogError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, CatalogError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Store { conn: std::sync::Arc::new(Mutex::new(conn)), row_locks: RowLocks::new() })
    }

    /// Opens a scoped write transaction. Released (committed or rolled
    /// back) on every path, including an early return or a panic that
    /// unwinds through it.
    pub fn transaction(&self) -> Result<Transaction<'_>, CatalogError> {
        let guard = self.conn.lock();
        guard.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Transaction { guard, row_locks: self.row_locks.clone(), held: Vec::new(), finished: false })
    }
}

pub struct Transaction<'s> {
    guard: parking_lot::MutexGuard<'s, Connection>,
    row_locks: RowLocks,
    held: Vec<RowLockGuard>,
    finished: bool,
}

impl<'s> Transaction<'s> {
    pub fn commit(mut self) -> Result<(), CatalogError> {
        self.guard.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    pub fn rollback(mut self) -> Result<(), CatalogError> {
        self.guard.execute_batch("ROLLBACK")?;
        self.finished = true;
        Ok(())
    }

    fn conn(&self) -> &Connection {
        &self.guard
    }

    /// Acquires (and holds until this transaction ends) the advisory row
    /// lock for `key`. Reentrant within a single transaction: a key this
    /// transaction already holds is a no-op rather than a second
    /// registry acquisition, since the same transaction would otherwise
    /// contend with itself (e.g. an explicit `lock_rule` followed by
    /// `update_rule`'s internal lock on the same rule).
    fn lock_row(&mut self, key: impl Into<String>, nowait: bool) -> Result<(), CatalogError> {
        let key = key.into();
        if self.held.iter().any(|g| g.key() == key) {
            return Ok(());
        }
        let guard = self.row_locks.acquire(key, nowait)?;
        self.held.push(guard);
        Ok(())
    }

    /// Acquires the advisory row lock for `rule_id` and holds it for the
    /// rest of this transaction. The rule engine calls this once at the
    /// start of any operation that reads-then-writes a rule's counters,
    /// so two concurrent re-evaluations of the same rule never interleave
    /// (spec.md §5 "lock-state transitions are serialized by a row-level
    /// lock on the rule").
    pub fn lock_rule(&mut self, id: RuleId, nowait: bool) -> Result<(), CatalogError> {
        self.lock_row(format!("rule:{}", id), nowait)
    }

    // ---------------------------------------------------------------
    // DIDs
    // ---------------------------------------------------------------

    pub fn insert_did(&self, record: &DidRecord) -> Result<(), CatalogError> {
        let existing: Option<String> = self
            .conn()
            .query_row(
                "SELECT scope FROM dids WHERE scope = ?1 AND name = ?2",
                params![record.did.scope, record.did.name],
                |r| r.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(CatalogError::Duplicate(format!("DID {} already exists", record.did)));
        }
        self.conn().execute(
            "INSERT INTO dids (scope, name, kind, bytes, adler32, md5, is_open, monotonic)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.did.scope,
                record.did.name,
                record.kind.as_str(),
                record.bytes.map(|b| b as i64),
                record.adler32,
                record.md5,
                record.is_open as i64,
                record.monotonic as i64,
            ],
        )?;
        self.conn().execute(
            "INSERT INTO pending_dids (scope, name, processed) VALUES (?1, ?2, 0)",
            params![record.did.scope, record.did.name],
        )?;
        Ok(())
    }

    /// Sets (or overwrites) a single metadata key on a DID. Used by the
    /// naming-convention validator to record a matched convention's
    /// extracted named groups as default metadata.
    pub fn set_did_metadata(&self, did: &Did, key: &str, value: &serde_json::Value) -> Result<(), CatalogError> {
        self.conn().execute(
            "INSERT INTO did_metadata (scope, name, key, value_json) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(scope, name, key) DO UPDATE SET value_json = excluded.value_json",
            params![did.scope, did.name, key, value.to_string()],
        )?;
        Ok(())
    }

    /// All metadata key/value pairs for `did`, used by the transmogrifier
    /// to evaluate subscription filters against arbitrary metadata keys.
    pub fn get_did_metadata(&self, did: &Did) -> Result<std::collections::HashMap<String, serde_json::Value>, CatalogError> {
        let mut stmt = self.conn().prepare("SELECT key, value_json FROM did_metadata WHERE scope = ?1 AND name = ?2")?;
        let rows = stmt.query_map(params![did.scope, did.name], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        let mut out = std::collections::HashMap::new();
        for row in rows {
            let (key, raw) = row?;
            out.insert(key, serde_json::from_str(&raw)?);
        }
        Ok(out)
    }

    /// Newly registered DIDs not yet seen by the transmogrifier, oldest
    /// first, capped at `limit` (spec.md §4.6 "bounded chunks").
    pub fn list_pending_dids(&self, limit: usize) -> Result<Vec<Did>, CatalogError> {
        let mut stmt = self
            .conn()
            .prepare("SELECT scope, name FROM pending_dids WHERE processed = 0 ORDER BY rowid LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |r| Ok(Did::new(r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Marks a DID as seen so it is not re-dispatched on the next
    /// supervisor tick (spec.md §4.6 "the DID is marked 'processed'").
    pub fn mark_did_processed(&self, did: &Did) -> Result<(), CatalogError> {
        self.conn().execute(
            "UPDATE pending_dids SET processed = 1 WHERE scope = ?1 AND name = ?2",
            params![did.scope, did.name],
        )?;
        Ok(())
    }

    pub fn get_did(&self, did: &Did) -> Result<DidRecord, CatalogError> {
        self.conn()
            .query_row(
                "SELECT kind, bytes, adler32, md5, is_open, monotonic FROM dids WHERE scope = ?1 AND name = ?2",
                params![did.scope, did.name],
                |r| {
                    let kind: String = r.get(0)?;
                    Ok(DidRecord {
                        did: did.clone(),
                        kind: DidKind::parse(&kind).expect("kind stored by insert_did is always valid"),
                        bytes: r.get::<_, Option<i64>>(1)?.map(|b| b as u64),
                        adler32: r.get(2)?,
                        md5: r.get(3)?,
                        is_open: r.get::<_, i64>(4)? != 0,
                        monotonic: r.get::<_, i64>(5)? != 0,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| CatalogError::DataIdentifierNotFound { scope: did.scope.clone(), name: did.name.clone() })
    }

    /// Attaches `children` under `parent`. Rejects a child already
    /// attached (idempotent-rejecting, per `test_did.py`) and rejects any
    /// attach that would create a cycle (checked via an ancestor-set walk
    /// from `parent` upward: `child` must not already be an ancestor).
    pub fn attach_children(&self, parent: &Did, children: &[Did]) -> Result<(), CatalogError> {
        let parent_record = self.get_did(parent)?;
        if parent_record.kind == DidKind::File {
            return Err(CatalogError::UnsupportedOperation("cannot attach children to a file".into()));
        }
        if !parent_record.is_open {
            return Err(CatalogError::UnsupportedStatus(format!("{} is closed", parent)));
        }

        let ancestors = self.ancestor_set(parent)?;

        for child in children {
            let child_record = self.get_did(child)?;
            if parent_record.kind == DidKind::Dataset && child_record.kind != DidKind::File {
                return Err(CatalogError::UnsupportedOperation("datasets may only contain files".into()));
            }
            if ancestors.contains(child) || child == parent {
                return Err(CatalogError::UnsupportedOperation(format!(
                    "attaching {} under {} would create a cycle",
                    child, parent
                )));
            }
            let already: Option<String> = self
                .conn()
                .query_row(
                    "SELECT parent_scope FROM containment_edges
                     WHERE parent_scope = ?1 AND parent_name = ?2 AND child_scope = ?3 AND child_name = ?4",
                    params![parent.scope, parent.name, child.scope, child.name],
                    |r| r.get(0),
                )
                .optional()?;
            if already.is_some() {
                return Err(CatalogError::Duplicate(format!("{} already attached to {}", child, parent)));
            }
            self.conn().execute(
                "INSERT INTO containment_edges (parent_scope, parent_name, child_scope, child_name)
                 VALUES (?1, ?2, ?3, ?4)",
                params![parent.scope, parent.name, child.scope, child.name],
            )?;
        }
        Ok(())
    }

    pub fn detach_children(&self, parent: &Did, children: &[Did]) -> Result<(), CatalogError> {
        for child in children {
            let n = self.conn().execute(
                "DELETE FROM containment_edges
                 WHERE parent_scope = ?1 AND parent_name = ?2 AND child_scope = ?3 AND child_name = ?4",
                params![parent.scope, parent.name, child.scope, child.name],
            )?;
            if n == 0 {
                return Err(CatalogError::DataIdentifierNotFound { scope: child.scope.clone(), name: child.name.clone() });
            }
        }
        Ok(())
    }

    pub fn list_children(&self, parent: &Did) -> Result<Vec<Did>, CatalogError> {
        let mut stmt = self
            .conn()
            .prepare("SELECT child_scope, child_name FROM containment_edges WHERE parent_scope = ?1 AND parent_name = ?2")?;
        let rows = stmt.query_map(params![parent.scope, parent.name], |r| Ok(Did::new(r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// All ancestors of `did` (parents, grandparents, ...), used to reject
    /// re-parenting that would close a cycle.
    fn ancestor_set(&self, did: &Did) -> Result<std::collections::HashSet<Did>, CatalogError> {
        let mut seen = std::collections::HashSet::new();
        let mut frontier = vec![did.clone()];
        while let Some(current) = frontier.pop() {
            let mut stmt = self
                .conn()
                .prepare("SELECT parent_scope, parent_name FROM containment_edges WHERE child_scope = ?1 AND child_name = ?2")?;
            let parents = stmt.query_map(params![current.scope, current.name], |r| {
                Ok(Did::new(r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?;
            for parent in parents {
                let parent = parent?;
                if seen.insert(parent.clone()) {
                    frontier.push(parent);
                }
            }
        }
        Ok(seen)
    }

    pub fn set_did_open(&self, did: &Did, is_open: bool) -> Result<(), CatalogError> {
        let record = self.get_did(did)?;
        if record.monotonic && is_open && !record.is_open {
            return Err(CatalogError::UnsupportedStatus(format!("{} is monotonic and cannot be reopened", did)));
        }
        let n = self.conn().execute(
            "UPDATE dids SET is_open = ?1 WHERE scope = ?2 AND name = ?3",
            params![is_open as i64, did.scope, did.name],
        )?;
        if n == 0 {
            return Err(CatalogError::DataIdentifierNotFound { scope: did.scope.clone(), name: did.name.clone() });
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // RSEs
    // ---------------------------------------------------------------

    pub fn add_rse(&self, rse: &Rse) -> Result<(), CatalogError> {
        let result = self.conn().execute(
            "INSERT INTO rses (id, name, deterministic, volatile, availability_read, availability_write, availability_delete, usage_used, usage_total)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                rse.id.0.to_string(),
                rse.name,
                rse.deterministic as i64,
                rse.volatile as i64,
                rse.availability_read as i64,
                rse.availability_write as i64,
                rse.availability_delete as i64,
                rse.usage_used as i64,
                rse.usage_total as i64,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
                Err(CatalogError::Duplicate(format!("RSE {} already exists", rse.name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn row_to_rse(name: String, r: &rusqlite::Row) -> rusqlite::Result<Rse> {
        let id: String = r.get(0)?;
        Ok(Rse {
            id: RseId(Uuid::parse_str(&id).expect("rse id stored by add_rse is always a valid uuid")),
            name,
            deterministic: r.get::<_, i64>(1)? != 0,
            volatile: r.get::<_, i64>(2)? != 0,
            availability_read: r.get::<_, i64>(3)? != 0,
            availability_write: r.get::<_, i64>(4)? != 0,
            availability_delete: r.get::<_, i64>(5)? != 0,
            usage_used: r.get::<_, i64>(6)? as u64,
            usage_total: r.get::<_, i64>(7)? as u64,
        })
    }

    pub fn get_rse_by_name(&self, name: &str) -> Result<Rse, CatalogError> {
        self.conn()
            .query_row(
                "SELECT id, deterministic, volatile, availability_read, availability_write, availability_delete, usage_used, usage_total
                 FROM rses WHERE name = ?1",
                params![name],
                |r| Self::row_to_rse(name.to_string(), r),
            )
            .optional()?
            .ok_or_else(|| CatalogError::RseNotFound(name.to_string()))
    }

    pub fn get_rse(&self, id: RseId) -> Result<Rse, CatalogError> {
        self.conn()
            .query_row(
                "SELECT id, deterministic, volatile, availability_read, availability_write, availability_delete, usage_used, usage_total, name
                 FROM rses WHERE id = ?1",
                params![id.0.to_string()],
                |r| {
                    let name: String = r.get(8)?;
                    Self::row_to_rse(name, r)
                },
            )
            .optional()?
            .ok_or_else(|| CatalogError::RseNotFound(id.to_string()))
    }

    pub fn set_rse_usage(&self, id: RseId, usage_used: u64, usage_total: u64) -> Result<(), CatalogError> {
        let n = self.conn().execute(
            "UPDATE rses SET usage_used = ?1, usage_total = ?2 WHERE id = ?3",
            params![usage_used as i64, usage_total as i64, id.0.to_string()],
        )?;
        if n == 0 {
            return Err(CatalogError::RseNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Every registered RSE, used by the placement advisor's eligibility
    /// scan and the rule engine's free-space tiebreak.
    pub fn list_rses(&self) -> Result<Vec<Rse>, CatalogError> {
        let mut stmt = self.conn().prepare(
            "SELECT id, deterministic, volatile, availability_read, availability_write, availability_delete, usage_used, usage_total, name FROM rses",
        )?;
        let rows = stmt.query_map([], |r| {
            let name: String = r.get(8)?;
            Self::row_to_rse(name, r)
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Rucio's `add_rse_attribute` rolls back unconditionally in a
    /// `finally`, whether or not a uniqueness violation actually fired
    /// (see DESIGN.md). We don't reproduce that: a uniqueness violation
    /// is reported as `Duplicate` and nothing else is swallowed.
    pub fn add_rse_attribute(&self, rse_id: RseId, key: &str, value: &serde_json::Value) -> Result<(), CatalogError> {
        let result = self.conn().execute(
            "INSERT INTO rse_attributes (rse_id, key, value_json) VALUES (?1, ?2, ?3)",
            params![rse_id.0.to_string(), key, value.to_string()],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation => {
                Err(CatalogError::Duplicate(format!("attribute {} already set on RSE {}", key, rse_id)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn del_rse_attribute(&self, rse_id: RseId, key: &str) -> Result<(), CatalogError> {
        let n = self
            .conn()
            .execute("DELETE FROM rse_attributes WHERE rse_id = ?1 AND key = ?2", params![rse_id.0.to_string(), key])?;
        if n == 0 {
            return Err(CatalogError::RseNotFound(format!("{} (attribute {})", rse_id, key)));
        }
        Ok(())
    }

    pub fn list_rse_attributes(&self, rse_id: RseId) -> Result<Vec<RseAttribute>, CatalogError> {
        let mut stmt = self.conn().prepare("SELECT key, value_json FROM rse_attributes WHERE rse_id = ?1")?;
        let rows = stmt.query_map(params![rse_id.0.to_string()], |r| {
            let key: String = r.get(0)?;
            let raw: String = r.get(1)?;
            Ok((key, raw))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (key, raw) = row?;
            let value = serde_json::from_str(&raw)?;
            out.push(RseAttribute { rse_id, key, value });
        }
        Ok(out)
    }

    /// All RSE ids carrying `key` with any value, used by the rse-expr
    /// evaluator's atom resolution.
    pub fn rse_ids_with_attribute_key(&self, key: &str) -> Result<Vec<RseId>, CatalogError> {
        let mut stmt = self.conn().prepare("SELECT DISTINCT rse_id FROM rse_attributes WHERE key = ?1")?;
        let rows = stmt.query_map(params![key], |r| r.get::<_, String>(0))?;
        Ok(rows
            .map(|r| r.map(|s| RseId(Uuid::parse_str(&s).expect("rse id always a valid uuid"))))
            .collect::<Result<Vec<_>, _>>()?)
    }

    pub fn rse_attribute_value(&self, rse_id: RseId, key: &str) -> Result<Option<serde_json::Value>, CatalogError> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT value_json FROM rse_attributes WHERE rse_id = ?1 AND key = ?2",
                params![rse_id.0.to_string(), key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    pub fn add_protocol(&self, protocol: &Protocol) -> Result<(), CatalogError> {
        self.conn().execute(
            "INSERT INTO protocols (rse_id, scheme, hostname, port, prefix, impl, priority_read, priority_write, priority_delete, extended_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                protocol.rse_id.0.to_string(),
                protocol.scheme,
                protocol.hostname,
                protocol.port,
                protocol.prefix,
                protocol.impl_,
                protocol.priority_read,
                protocol.priority_write,
                protocol.priority_delete,
                protocol.extended_attributes.as_ref().map(|v| v.to_string()),
            ],
        )?;
        Ok(())
    }

    /// Every write/read protocol registered for `rse_id`, for
    /// [`Protocol::select_best`] and for deriving a non-deterministic
    /// RSE's replica path from a reported PFN (spec.md §4.5
    /// "Non-deterministic RSEs").
    pub fn list_protocols(&self, rse_id: RseId) -> Result<Vec<Protocol>, CatalogError> {
        let mut stmt = self.conn().prepare(
            "SELECT scheme, hostname, port, prefix, impl, priority_read, priority_write, priority_delete, extended_json
             FROM protocols WHERE rse_id = ?1",
        )?;
        let rows = stmt.query_map(params![rse_id.0.to_string()], |r| {
            let extended_json: Option<String> = r.get(8)?;
            Ok(Protocol {
                rse_id,
                scheme: r.get(0)?,
                hostname: r.get(1)?,
                port: r.get::<_, i64>(2)? as u16,
                prefix: r.get(3)?,
                impl_: r.get(4)?,
                priority_read: r.get(5)?,
                priority_write: r.get(6)?,
                priority_delete: r.get(7)?,
                extended_attributes: extended_json.map(|s| serde_json::from_str(&s).expect("extended_json stored by add_protocol always valid")),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ---------------------------------------------------------------
    // Replicas
    // ---------------------------------------------------------------

    pub fn add_replica(&self, replica: &Replica) -> Result<(), CatalogError> {
        self.conn().execute(
            "INSERT INTO replicas (rse_id, scope, name, state, bytes, adler32, md5, path, tombstone, lock_cnt)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                replica.rse_id.0.to_string(),
                replica.did.scope,
                replica.did.name,
                replica.state.as_str(),
                replica.bytes as i64,
                replica.adler32,
                replica.md5,
                replica.path,
                replica.tombstone.map(|t| t.to_rfc3339()),
                replica.lock_cnt,
            ],
        )?;
        Ok(())
    }

    pub fn get_replica(&self, rse_id: RseId, did: &Did) -> Result<Replica, CatalogError> {
        self.conn()
            .query_row(
                "SELECT state, bytes, adler32, md5, path, tombstone, lock_cnt FROM replicas
                 WHERE rse_id = ?1 AND scope = ?2 AND name = ?3",
                params![rse_id.0.to_string(), did.scope, did.name],
                |r| {
                    let state: String = r.get(0)?;
                    let tombstone: Option<String> = r.get(5)?;
                    Ok(Replica {
                        rse_id,
                        did: did.clone(),
                        state: ReplicaState::parse(&state).expect("state stored by add_replica is always valid"),
                        bytes: r.get::<_, i64>(1)? as u64,
                        adler32: r.get(2)?,
                        md5: r.get(3)?,
                        path: r.get(4)?,
                        tombstone: tombstone.map(|t| DateTime::parse_from_rfc3339(&t).expect("stored tombstone always rfc3339").with_timezone(&Utc)),
                        lock_cnt: r.get(6)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| CatalogError::ReplicaNotFound { rse_id: rse_id.to_string(), scope: did.scope.clone(), name: did.name.clone() })
    }

    /// Atomically transitions every replica in `updates`; if any is
    /// missing, the whole batch fails and the caller falls back to
    /// one-by-one (conveyor finisher, spec.md §4.5).
    pub fn update_replicas_states(&mut self, updates: &[ReplicaStateUpdate], nowait: bool) -> Result<(), CatalogError> {
        for update in updates {
            let key = format!("replica:{}:{}:{}", update.rse_id, update.did.scope, update.did.name);
            self.lock_row(key, nowait)?;
        }
        for update in updates {
            let n = self.conn().execute(
                "UPDATE replicas SET state = ?1 WHERE rse_id = ?2 AND scope = ?3 AND name = ?4",
                params![update.new_state.as_str(), update.rse_id.0.to_string(), update.did.scope, update.did.name],
            )?;
            if n == 0 {
                return Err(CatalogError::ReplicaNotFound {
                    rse_id: update.rse_id.to_string(),
                    scope: update.did.scope.clone(),
                    name: update.did.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Stamps a non-deterministic destination's replica path once the
    /// finisher has derived it from the transfer tool's reported PFN
    /// (spec.md §4.5 "Non-deterministic RSEs": "the replica's `path` is
    /// set from the transfer tool's reported PFN").
    pub fn set_replica_path(&self, rse_id: RseId, did: &Did, path: &str) -> Result<(), CatalogError> {
        let n = self.conn().execute(
            "UPDATE replicas SET path = ?1 WHERE rse_id = ?2 AND scope = ?3 AND name = ?4",
            params![path, rse_id.0.to_string(), did.scope, did.name],
        )?;
        if n == 0 {
            return Err(CatalogError::ReplicaNotFound { rse_id: rse_id.to_string(), scope: did.scope.clone(), name: did.name.clone() });
        }
        Ok(())
    }

    pub fn list_replicas(&self, did: &Did) -> Result<Vec<Replica>, CatalogError> {
        let mut stmt = self.conn().prepare(
            "SELECT rse_id, state, bytes, adler32, md5, path, tombstone, lock_cnt FROM replicas WHERE scope = ?1 AND name = ?2",
        )?;
        let rows = stmt.query_map(params![did.scope, did.name], |r| {
            let rse_id: String = r.get(0)?;
            let state: String = r.get(1)?;
            let tombstone: Option<String> = r.get(6)?;
            Ok(Replica {
                rse_id: RseId(Uuid::parse_str(&rse_id).expect("rse id always a valid uuid")),
                did: did.clone(),
                state: ReplicaState::parse(&state).expect("state stored by add_replica is always valid"),
                bytes: r.get::<_, i64>(2)? as u64,
                adler32: r.get(3)?,
                md5: r.get(4)?,
                path: r.get(5)?,
                tombstone: tombstone.map(|t| DateTime::parse_from_rfc3339(&t).expect("stored tombstone always rfc3339").with_timezone(&Utc)),
                lock_cnt: r.get(7)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn adjust_lock_cnt(&self, rse_id: RseId, did: &Did, delta: i64) -> Result<(), CatalogError> {
        let n = self.conn().execute(
            "UPDATE replicas SET lock_cnt = lock_cnt + ?1 WHERE rse_id = ?2 AND scope = ?3 AND name = ?4",
            params![delta, rse_id.0.to_string(), did.scope, did.name],
        )?;
        if n == 0 {
            return Err(CatalogError::ReplicaNotFound { rse_id: rse_id.to_string(), scope: did.scope.clone(), name: did.name.clone() });
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Rules and locks
    // ---------------------------------------------------------------

    pub fn add_rule(&self, rule: &Rule) -> Result<(), CatalogError> {
        self.conn().execute(
            "INSERT INTO rules (id, account, dids_json, copies, rse_expression, grouping, weight_attr, lifetime_seconds,
                                 locked, subscription_id, state, locks_ok_cnt, locks_replicating_cnt, locks_stuck_cnt, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                rule.id.0.to_string(),
                rule.account,
                serde_json::to_string(&rule.dids)?,
                rule.copies,
                rule.rse_expression,
                rule.grouping.as_str(),
                rule.weight_attr,
                rule.lifetime_seconds,
                rule.locked as i64,
                rule.subscription_id.map(|s| s.to_string()),
                rule.state.as_str(),
                rule.locks_ok_cnt,
                rule.locks_replicating_cnt,
                rule.locks_stuck_cnt,
                rule.expires_at.map(|e| e.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_rule(&self, id: RuleId) -> Result<Option<Rule>, CatalogError> {
        self.row_to_rule(id)
    }

    fn row_to_rule(&self, id: RuleId) -> Result<Option<Rule>, CatalogError> {
        #[allow(clippy::type_complexity)]
        let row: Option<(String, String, u32, String, String, Option<String>, Option<i64>, i64, Option<String>, String, i64, i64, i64, Option<String>)> = self
            .conn()
            .query_row(
                "SELECT account, dids_json, copies, rse_expression, grouping, weight_attr, lifetime_seconds,
                        locked, subscription_id, state, locks_ok_cnt, locks_replicating_cnt, locks_stuck_cnt, expires_at
                 FROM rules WHERE id = ?1",
                params![id.0.to_string()],
                |r| {
                    Ok((
                        r.get(0)?,
                        r.get(1)?,
                        r.get(2)?,
                        r.get(3)?,
                        r.get(4)?,
                        r.get(5)?,
                        r.get(6)?,
                        r.get(7)?,
                        r.get(8)?,
                        r.get(9)?,
                        r.get(10)?,
                        r.get(11)?,
                        r.get(12)?,
                        r.get(13)?,
                    ))
                },
            )
            .optional()?;

        row.map(
            |(account, dids_json, copies, rse_expression, grouping, weight_attr, lifetime_seconds, locked, subscription_id, state, locks_ok_cnt, locks_replicating_cnt, locks_stuck_cnt, expires_at)| {
                Ok(Rule {
                    id,
                    account,
                    dids: serde_json::from_str(&dids_json)?,
                    copies,
                    rse_expression,
                    grouping: Grouping::parse(&grouping).expect("grouping stored by add_rule is always valid"),
                    weight_attr,
                    lifetime_seconds,
                    locked: locked != 0,
                    subscription_id: subscription_id.map(|s| Uuid::parse_str(&s).expect("subscription id always a valid uuid")),
                    state: RuleState::parse(&state).expect("state stored by add_rule is always valid"),
                    locks_ok_cnt,
                    locks_replicating_cnt,
                    locks_stuck_cnt,
                    expires_at: expires_at.map(|e| DateTime::parse_from_rfc3339(&e).expect("stored expires_at always rfc3339").with_timezone(&Utc)),
                })
            },
        )
        .transpose()
    }

    /// Persists a rule's mutable fields (counters, state, locked flag).
    /// Acquires the rule's advisory row lock first, so two concurrent
    /// re-evaluations of the same rule never interleave their writes.
    pub fn update_rule(&mut self, rule: &Rule, nowait: bool) -> Result<(), CatalogError> {
        self.lock_row(format!("rule:{}", rule.id), nowait)?;
        let n = self.conn().execute(
            "UPDATE rules SET state = ?1, locks_ok_cnt = ?2, locks_replicating_cnt = ?3, locks_stuck_cnt = ?4, locked = ?5
             WHERE id = ?6",
            params![
                rule.state.as_str(),
                rule.locks_ok_cnt,
                rule.locks_replicating_cnt,
                rule.locks_stuck_cnt,
                rule.locked as i64,
                rule.id.0.to_string(),
            ],
        )?;
        if n == 0 {
            return Err(CatalogError::RuleNotFound(rule.id.0));
        }
        Ok(())
    }

    /// Deletes a rule and its locks. A locked rule may not be deleted
    /// except via explicit unlock then delete (spec.md §3 "Rule").
    pub fn delete_rule(&self, id: RuleId) -> Result<(), CatalogError> {
        let rule = self.get_rule(id)?.ok_or(CatalogError::RuleNotFound(id.0))?;
        if rule.locked {
            return Err(CatalogError::UnsupportedOperation(format!("rule {} is locked", id)));
        }
        let locked_replicas: Vec<(RseId, Did)> = {
            let mut stmt = self.conn().prepare("SELECT rse_id, scope, name FROM locks WHERE rule_id = ?1")?;
            let rows = stmt.query_map(params![id.0.to_string()], |r| {
                let rse_id: String = r.get(0)?;
                Ok((RseId(Uuid::parse_str(&rse_id).expect("rse id always a valid uuid")), Did::new(r.get::<_, String>(1)?, r.get::<_, String>(2)?)))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        for (rse_id, did) in &locked_replicas {
            self.adjust_lock_cnt(*rse_id, did, -1)?;
        }
        self.conn().execute("DELETE FROM locks WHERE rule_id = ?1", params![id.0.to_string()])?;
        self.conn().execute("DELETE FROM dataset_locks WHERE rule_id = ?1", params![id.0.to_string()])?;
        self.conn().execute("DELETE FROM rules WHERE id = ?1", params![id.0.to_string()])?;
        Ok(())
    }

    pub fn add_lock(&self, lock: &Lock) -> Result<(), CatalogError> {
        self.conn().execute(
            "INSERT INTO locks (rule_id, rse_id, scope, name, state) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![lock.rule_id.to_string(), lock.rse_id.0.to_string(), lock.did.scope, lock.did.name, lock.state.as_str()],
        )?;
        self.adjust_lock_cnt(lock.rse_id, &lock.did, 1)?;
        Ok(())
    }

    pub fn list_locks_for_rule(&self, rule_id: RuleId) -> Result<Vec<Lock>, CatalogError> {
        let mut stmt = self.conn().prepare("SELECT rse_id, scope, name, state FROM locks WHERE rule_id = ?1")?;
        let rows = stmt.query_map(params![rule_id.0.to_string()], |r| {
            let rse_id: String = r.get(0)?;
            let state: String = r.get(3)?;
            Ok(Lock {
                rule_id: rule_id.0,
                rse_id: RseId(Uuid::parse_str(&rse_id).expect("rse id always a valid uuid")),
                did: Did::new(r.get::<_, String>(1)?, r.get::<_, String>(2)?),
                state: LockState::parse(&state).expect("lock state always valid"),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn set_lock_state(&self, rule_id: RuleId, rse_id: RseId, did: &Did, state: LockState) -> Result<(), CatalogError> {
        let n = self.conn().execute(
            "UPDATE locks SET state = ?1 WHERE rule_id = ?2 AND rse_id = ?3 AND scope = ?4 AND name = ?5",
            params![state.as_str(), rule_id.0.to_string(), rse_id.0.to_string(), did.scope, did.name],
        )?;
        if n == 0 {
            return Err(CatalogError::RuleNotFound(rule_id.0));
        }
        Ok(())
    }

    /// Recomputes a rule's lock counters and derived state from the
    /// `locks` table and persists them. Callers that flip a single
    /// lock's state directly (the conveyor finisher, which has no reason
    /// to pull in `rule-engine`'s re-evaluation machinery just to keep a
    /// rule's counters honest) use this instead of re-deriving the delta
    /// `rule-engine::reevaluate::re_evaluate_rule` computes for admission.
    pub fn recompute_rule_counters(&mut self, rule_id: RuleId, nowait: bool) -> Result<Rule, CatalogError> {
        let locks = self.list_locks_for_rule(rule_id)?;
        let mut rule = self.get_rule(rule_id)?.ok_or(CatalogError::RuleNotFound(rule_id.0))?;
        rule.locks_ok_cnt = locks.iter().filter(|l| l.state == LockState::Ok).count() as i64;
        rule.locks_replicating_cnt = locks.iter().filter(|l| l.state == LockState::Replicating).count() as i64;
        rule.locks_stuck_cnt = locks.iter().filter(|l| l.state == LockState::Stuck).count() as i64;
        rule.state = rule.derive_state();
        self.update_rule(&rule, nowait)?;
        Ok(rule)
    }

    /// Every rule owned by `account`, used by admission's duplicate-rule
    /// check (spec.md §4.4 "rejects duplicates").
    pub fn list_rules_by_account(&self, account: &str) -> Result<Vec<Rule>, CatalogError> {
        let ids: Vec<String> = {
            let mut stmt = self.conn().prepare("SELECT id FROM rules WHERE account = ?1")?;
            let rows = stmt.query_map(params![account], |r| r.get::<_, String>(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        ids.into_iter()
            .map(|id| {
                let id = RuleId(Uuid::parse_str(&id).expect("rule id always a valid uuid"));
                self.get_rule(id)?.ok_or(CatalogError::RuleNotFound(id.0))
            })
            .collect()
    }

    /// Rules still short of their target copies, for the re-evaluation
    /// sweep (spec.md §4.4 "Re-evaluation"): `REPLICATING` rules may have
    /// newly eligible destinations; `STUCK` rules may have recovered.
    pub fn list_rules_needing_reevaluation(&self) -> Result<Vec<RuleId>, CatalogError> {
        let mut stmt = self.conn().prepare("SELECT id FROM rules WHERE state IN ('REPLICATING', 'STUCK')")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        Ok(rows
            .map(|r| r.map(|s| RuleId(Uuid::parse_str(&s).expect("rule id always a valid uuid"))))
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// Unlocked rules whose `expires_at` has passed, for the expiration
    /// sweep (spec.md §4.4 "Expiration").
    pub fn list_expired_rules(&self, now: DateTime<Utc>) -> Result<Vec<RuleId>, CatalogError> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id FROM rules WHERE locked = 0 AND expires_at IS NOT NULL AND expires_at <= ?1")?;
        let rows = stmt.query_map(params![now.to_rfc3339()], |r| r.get::<_, String>(0))?;
        Ok(rows
            .map(|r| r.map(|s| RuleId(Uuid::parse_str(&s).expect("rule id always a valid uuid"))))
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// Whether `lock_cnt` has reached zero with no tombstone set yet; if
    /// so, stamps `tombstone = now()`, making the replica reaper-eligible
    /// (spec.md §3 "Replica": `lock_cnt = 0 ⇔ tombstone may be set`).
    pub fn maybe_tombstone(&self, rse_id: RseId, did: &Did) -> Result<(), CatalogError> {
        let replica = self.get_replica(rse_id, did)?;
        if replica.lock_cnt == 0 && replica.tombstone.is_none() {
            self.conn().execute(
                "UPDATE replicas SET tombstone = ?1 WHERE rse_id = ?2 AND scope = ?3 AND name = ?4",
                params![Utc::now().to_rfc3339(), rse_id.0.to_string(), did.scope, did.name],
            )?;
        }
        Ok(())
    }

    pub fn add_dataset_lock(&self, lock: &DatasetLock) -> Result<(), CatalogError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO dataset_locks (rule_id, rse_id, scope, name, state) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![lock.rule_id.to_string(), lock.rse_id.0.to_string(), lock.dataset.scope, lock.dataset.name, lock.state.as_str()],
        )?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Requests
    // ---------------------------------------------------------------

    pub fn insert_request(&self, request: &Request) -> Result<(), CatalogError> {
        let existing: Option<String> = self
            .conn()
            .query_row(
                "SELECT id FROM requests WHERE rule_id = ?1 AND scope = ?2 AND name = ?3 AND dest_rse_id = ?4
                 AND state NOT IN ('DONE', 'FAILED', 'LOST')",
                params![request.rule_id.to_string(), request.scope, request.name, request.dest_rse_id.0.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Err(CatalogError::Duplicate(format!(
                "non-terminal request already exists for rule {} / {}:{} / dest {}",
                request.rule_id, request.scope, request.name, request.dest_rse_id
            )));
        }
        self.conn().execute(
            "INSERT INTO requests (id, request_type, scope, name, dest_rse_id, src_rse_id, rule_id, attempt_id, state,
                                    external_host, external_id, retry_count, dest_url, src_url, previous_attempt_id,
                                    activity, bytes, adler32, md5, job_m_replica, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
            params![
                request.id.0.to_string(),
                request.request_type.as_str(),
                request.scope,
                request.name,
                request.dest_rse_id.0.to_string(),
                request.src_rse_id.map(|r| r.0.to_string()),
                request.rule_id.to_string(),
                request.attempt_id,
                request.state.as_str(),
                request.external_host,
                request.external_id,
                request.retry_count,
                request.dest_url,
                request.src_url,
                request.previous_attempt_id.map(|p| p.to_string()),
                request.activity,
                request.bytes as i64,
                request.adler32,
                request.md5,
                request.job_m_replica as i64,
                request.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_request(&self, id: RequestId) -> Result<Request, CatalogError> {
        self.row_to_request(id)?.ok_or(CatalogError::RequestNotFound(id.0))
    }

    fn row_to_request(&self, id: RequestId) -> Result<Option<Request>, CatalogError> {
        self.conn()
            .query_row(
                "SELECT request_type, scope, name, dest_rse_id, src_rse_id, rule_id, attempt_id, state, external_host,
                        external_id, retry_count, dest_url, src_url, previous_attempt_id, activity, bytes, adler32, md5,
                        job_m_replica, updated_at
                 FROM requests WHERE id = ?1",
                params![id.0.to_string()],
                Self::map_request_row,
            )
            .optional()?
            .map(|mut req| {
                req.id = id;
                Ok(req)
            })
            .transpose()
    }

    fn map_request_row(r: &rusqlite::Row) -> rusqlite::Result<Request> {
        let request_type: String = r.get(0)?;
        let dest_rse_id: String = r.get(3)?;
        let src_rse_id: Option<String> = r.get(4)?;
        let state: String = r.get(7)?;
        let previous_attempt_id: Option<String> = r.get(13)?;
        let updated_at: String = r.get(19)?;
        Ok(Request {
            id: RequestId(Uuid::nil()),
            request_type: RequestType::parse(&request_type).expect("request type always valid"),
            scope: r.get(1)?,
            name: r.get(2)?,
            dest_rse_id: RseId(Uuid::parse_str(&dest_rse_id).expect("rse id always a valid uuid")),
            src_rse_id: src_rse_id.map(|s| RseId(Uuid::parse_str(&s).expect("rse id always a valid uuid"))),
            rule_id: Uuid::parse_str(&r.get::<_, String>(5)?).expect("rule id always a valid uuid"),
            attempt_id: r.get(6)?,
            state: RequestState::parse(&state).expect("request state always valid"),
            external_host: r.get(8)?,
            external_id: r.get(9)?,
            retry_count: r.get(10)?,
            dest_url: r.get(11)?,
            src_url: r.get(12)?,
            previous_attempt_id: previous_attempt_id.map(|p| Uuid::parse_str(&p).expect("uuid always valid")),
            activity: r.get(14)?,
            bytes: r.get::<_, i64>(15)? as u64,
            adler32: r.get(16)?,
            md5: r.get(17)?,
            job_m_replica: r.get::<_, i64>(18)? != 0,
            updated_at: DateTime::parse_from_rfc3339(&updated_at).expect("stored updated_at always rfc3339").with_timezone(&Utc),
        })
    }

    pub fn set_request_state(&self, id: RequestId, state: RequestState) -> Result<(), CatalogError> {
        let n = self.conn().execute(
            "UPDATE requests SET state = ?1, updated_at = ?2 WHERE id = ?3",
            params![state.as_str(), Utc::now().to_rfc3339(), id.0.to_string()],
        )?;
        if n == 0 {
            return Err(CatalogError::RequestNotFound(id.0));
        }
        Ok(())
    }

    /// Records a successful submission: stamps `external_host`/
    /// `external_id` and transitions to `SUBMITTED` in one write
    /// (spec.md §4.5 "Submitter": "stores `external_host`, `external_id`,
    /// transitions to `SUBMITTED`").
    pub fn set_request_submitted(&self, id: RequestId, external_host: &str, external_id: &str) -> Result<(), CatalogError> {
        let n = self.conn().execute(
            "UPDATE requests SET external_host = ?1, external_id = ?2, state = ?3, updated_at = ?4 WHERE id = ?5",
            params![external_host, external_id, RequestState::Submitted.as_str(), Utc::now().to_rfc3339(), id.0.to_string()],
        )?;
        if n == 0 {
            return Err(CatalogError::RequestNotFound(id.0));
        }
        Ok(())
    }

    /// Records the source/destination URLs and `job_m_replica` flag a
    /// poll response reported for a request, so the finisher can later
    /// resolve the actual serving source and derive a non-deterministic
    /// destination's replica path without re-querying the transfer tool
    /// (spec.md §4.5 "Source resolution for multi-source transfers",
    /// "Non-deterministic RSEs").
    pub fn set_request_transfer_info(
        &self,
        id: RequestId,
        src_url: Option<&str>,
        dest_url: Option<&str>,
        job_m_replica: bool,
    ) -> Result<(), CatalogError> {
        let n = self.conn().execute(
            "UPDATE requests SET src_url = COALESCE(?1, src_url), dest_url = COALESCE(?2, dest_url), job_m_replica = ?3 WHERE id = ?4",
            params![src_url, dest_url, job_m_replica as i64, id.0.to_string()],
        )?;
        if n == 0 {
            return Err(CatalogError::RequestNotFound(id.0));
        }
        Ok(())
    }

    pub fn touch_request(&self, id: RequestId) -> Result<(), CatalogError> {
        let n = self
            .conn()
            .execute("UPDATE requests SET updated_at = ?1 WHERE id = ?2", params![Utc::now().to_rfc3339(), id.0.to_string()])?;
        if n == 0 {
            return Err(CatalogError::RequestNotFound(id.0));
        }
        Ok(())
    }

    /// Moves a terminal request into `requests_archive` and removes it
    /// from the live table, matching `conveyor/common.py`'s archival step.
    pub fn archive_request(&self, id: RequestId) -> Result<(), CatalogError> {
        let request = self.get_request(id)?;
        if !request.state.is_terminal() {
            return Err(CatalogError::UnsupportedStatus(format!("request {} is not terminal", id)));
        }
        self.conn().execute(
            "INSERT INTO requests_archive SELECT * FROM requests WHERE id = ?1",
            params![id.0.to_string()],
        )?;
        self.conn().execute("DELETE FROM requests WHERE id = ?1", params![id.0.to_string()])?;
        Ok(())
    }

    /// Archives the current request and inserts a fresh retry row with an
    /// incremented `attempt_id` / `previous_attempt_id` pointing back,
    /// matching `conveyor/common.py`'s retry path.
    pub fn requeue_and_archive(&self, id: RequestId) -> Result<RequestId, CatalogError> {
        let mut request = self.get_request(id)?;
        self.archive_request(id)?;
        let new_id = RequestId::new();
        request.id = new_id;
        request.previous_attempt_id = Some(id.0);
        request.attempt_id += 1;
        request.state = RequestState::Queued;
        request.retry_count += 1;
        request.updated_at = Utc::now();
        self.insert_request(&request)?;
        Ok(new_id)
    }

    /// Bulk-marks every request sharing `(external_host, external_id)` as
    /// `Lost`, matching `conveyor/common.py`'s `set_transfer_state`.
    pub fn touch_transfer(&self, external_host: &str, external_id: &str, state: RequestState) -> Result<Vec<RequestId>, CatalogError> {
        let ids = self.get_requests_by_transfer(external_host, external_id)?;
        for id in &ids {
            self.set_request_state(*id, state)?;
        }
        Ok(ids)
    }

    /// Every live (non-archived) request attributed to `rule_id`, used by
    /// rule deletion to cancel in-flight transfers it solely owns
    /// (spec.md §4.4 "Deletion").
    pub fn list_requests_for_rule(&self, rule_id: Uuid) -> Result<Vec<Request>, CatalogError> {
        let mut stmt = self.conn().prepare(
            "SELECT id, request_type, scope, name, dest_rse_id, src_rse_id, rule_id, attempt_id, state, external_host,
                    external_id, retry_count, dest_url, src_url, previous_attempt_id, activity, bytes, adler32, md5,
                    job_m_replica, updated_at
             FROM requests WHERE rule_id = ?1",
        )?;
        let rows = stmt.query_map(params![rule_id.to_string()], |r| {
            let id: String = r.get(0)?;
            let mut req = Self::map_request_row_full(r)?;
            req.id = RequestId(Uuid::parse_str(&id).expect("request id always a valid uuid"));
            Ok(req)
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Distinct `external_id`s this shard owns among `SUBMITTING`/
    /// `SUBMITTED` requests for `external_host`, for the poller's bulk
    /// query (spec.md §4.5 "Poller": "for each external host, bulk-queries
    /// status of outstanding `external_id`s").
    pub fn list_outstanding_external_ids(&self, external_host: &str, shard: ShardSpec) -> Result<Vec<String>, CatalogError> {
        let mut stmt = self.conn().prepare(
            "SELECT DISTINCT external_id FROM requests
             WHERE external_host = ?1 AND external_id IS NOT NULL AND state IN ('SUBMITTING', 'SUBMITTED')",
        )?;
        let rows = stmt.query_map(params![external_host], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            let id = row?;
            if shard.owns(&id) {
                out.push(id);
            }
        }
        Ok(out)
    }

    pub fn get_requests_by_transfer(&self, external_host: &str, external_id: &str) -> Result<Vec<RequestId>, CatalogError> {
        let mut stmt = self.conn().prepare("SELECT id FROM requests WHERE external_host = ?1 AND external_id = ?2")?;
        let rows = stmt.query_map(params![external_host, external_id], |r| r.get::<_, String>(0))?;
        Ok(rows
            .map(|r| r.map(|s| RequestId(Uuid::parse_str(&s).expect("request id always a valid uuid"))))
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// Sharded consumption: returns requests of `request_types` in
    /// `state`, last touched before `older_than`, whose stable hash falls
    /// in this worker's shard (spec.md §4.1 "`get_next`").
    pub fn get_next(
        &self,
        request_types: &[RequestType],
        state: RequestState,
        older_than: DateTime<Utc>,
        shard: ShardSpec,
    ) -> Result<Vec<Request>, CatalogError> {
        let type_list: Vec<&str> = request_types.iter().map(|t| t.as_str()).collect();
        let placeholders = type_list.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id, request_type, scope, name, dest_rse_id, src_rse_id, rule_id, attempt_id, state, external_host,
                    external_id, retry_count, dest_url, src_url, previous_attempt_id, activity, bytes, adler32, md5,
                    job_m_replica, updated_at
             FROM requests WHERE state = ? AND updated_at < ? AND request_type IN ({placeholders})"
        );
        let mut stmt = self.conn().prepare(&sql)?;
        let state_str = state.as_str().to_string();
        let older_than_str = older_than.to_rfc3339();
        let mut bound_params: Vec<&dyn rusqlite::ToSql> = vec![&state_str, &older_than_str];
        for t in &type_list {
            bound_params.push(t);
        }
        let rows = stmt.query_map(bound_params.as_slice(), |r| {
            let id: String = r.get(0)?;
            let mut req = Self::map_request_row_full(r)?;
            req.id = RequestId(Uuid::parse_str(&id).expect("request id always a valid uuid"));
            Ok(req)
        })?;
        let mut out = Vec::new();
        for row in rows {
            let req = row?;
            if shard.owns(&req.id.to_string()) {
                out.push(req);
            }
        }
        Ok(out)
    }

    fn map_request_row_full(r: &rusqlite::Row) -> rusqlite::Result<Request> {
        let request_type: String = r.get(1)?;
        let dest_rse_id: String = r.get(4)?;
        let src_rse_id: Option<String> = r.get(5)?;
        let state: String = r.get(8)?;
        let previous_attempt_id: Option<String> = r.get(14)?;
        let updated_at: String = r.get(20)?;
        Ok(Request {
            id: RequestId(Uuid::nil()),
            request_type: RequestType::parse(&request_type).expect("request type always valid"),
            scope: r.get(2)?,
            name: r.get(3)?,
            dest_rse_id: RseId(Uuid::parse_str(&dest_rse_id).expect("rse id always a valid uuid")),
            src_rse_id: src_rse_id.map(|s| RseId(Uuid::parse_str(&s).expect("rse id always a valid uuid"))),
            rule_id: Uuid::parse_str(&r.get::<_, String>(6)?).expect("rule id always a valid uuid"),
            attempt_id: r.get(7)?,
            state: RequestState::parse(&state).expect("request state always valid"),
            external_host: r.get(9)?,
            external_id: r.get(10)?,
            retry_count: r.get(11)?,
            dest_url: r.get(12)?,
            src_url: r.get(13)?,
            previous_attempt_id: previous_attempt_id.map(|p| Uuid::parse_str(&p).expect("uuid always valid")),
            activity: r.get(15)?,
            bytes: r.get::<_, i64>(16)? as u64,
            adler32: r.get(17)?,
            md5: r.get(18)?,
            job_m_replica: r.get::<_, i64>(19)? != 0,
            updated_at: DateTime::parse_from_rfc3339(&updated_at).expect("stored updated_at always rfc3339").with_timezone(&Utc),
        })
    }

    // ---------------------------------------------------------------
    // Accounts
    // ---------------------------------------------------------------

    pub fn queue_counter_delta(&self, delta: &AccountCounterDelta) -> Result<(), CatalogError> {
        self.conn().execute(
            "INSERT INTO account_counter_deltas (account, rse_id, bytes_delta, files_delta) VALUES (?1, ?2, ?3, ?4)",
            params![delta.account, delta.rse_id.0.to_string(), delta.bytes_delta, delta.files_delta],
        )?;
        Ok(())
    }

    /// Drains every queued delta, sums per `(account, rse_id)`, and folds
    /// the sum into the aggregate counter in one pass.
    pub fn apply_counter_deltas(&self) -> Result<usize, CatalogError> {
        let deltas: Vec<(i64, AccountCounterDelta)> = {
            let mut stmt = self.conn().prepare("SELECT id, account, rse_id, bytes_delta, files_delta FROM account_counter_deltas")?;
            let rows = stmt.query_map([], |r| {
                let rse_id: String = r.get(2)?;
                Ok((
                    r.get::<_, i64>(0)?,
                    AccountCounterDelta {
                        account: r.get(1)?,
                        rse_id: RseId(Uuid::parse_str(&rse_id).expect("rse id always a valid uuid")),
                        bytes_delta: r.get(3)?,
                        files_delta: r.get(4)?,
                    },
                ))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut summed: std::collections::HashMap<(String, RseId), (i64, i64)> = std::collections::HashMap::new();
        for (_, delta) in &deltas {
            let entry = summed.entry((delta.account.clone(), delta.rse_id)).or_insert((0, 0));
            entry.0 += delta.bytes_delta;
            entry.1 += delta.files_delta;
        }

        for ((account, rse_id), (bytes_delta, files_delta)) in &summed {
            self.conn().execute(
                "INSERT INTO account_counters (account, rse_id, bytes, files) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(account, rse_id) DO UPDATE SET bytes = bytes + excluded.bytes, files = files + excluded.files",
                params![account, rse_id.0.to_string(), bytes_delta, files_delta],
            )?;
        }

        let applied = deltas.len();
        self.conn().execute("DELETE FROM account_counter_deltas", [])?;
        Ok(applied)
    }

    pub fn get_account_counter(&self, account: &str, rse_id: RseId) -> Result<AccountCounter, CatalogError> {
        self.conn()
            .query_row(
                "SELECT bytes, files FROM account_counters WHERE account = ?1 AND rse_id = ?2",
                params![account, rse_id.0.to_string()],
                |r| Ok(AccountCounter { account: account.to_string(), rse_id, bytes: r.get(0)?, files: r.get(1)? }),
            )
            .optional()?
            .map(Ok)
            .unwrap_or(Ok(AccountCounter { account: account.to_string(), rse_id, bytes: 0, files: 0 }))
    }

    pub fn set_account_limit(&self, limit: &AccountLimit) -> Result<(), CatalogError> {
        self.conn().execute(
            "INSERT INTO account_limits (account, rse_id, bytes_limit) VALUES (?1, ?2, ?3)
             ON CONFLICT(account, rse_id) DO UPDATE SET bytes_limit = excluded.bytes_limit",
            params![limit.account, limit.rse_id.0.to_string(), limit.bytes_limit],
        )?;
        Ok(())
    }

    pub fn get_account_limit(&self, account: &str, rse_id: RseId) -> Result<Option<i64>, CatalogError> {
        Ok(self
            .conn()
            .query_row(
                "SELECT bytes_limit FROM account_limits WHERE account = ?1 AND rse_id = ?2",
                params![account, rse_id.0.to_string()],
                |r| r.get(0),
            )
            .optional()?)
    }

    // ---------------------------------------------------------------
    // Subscriptions and messages
    // ---------------------------------------------------------------

    pub fn add_subscription(&self, subscription: &Subscription) -> Result<(), CatalogError> {
        self.conn().execute(
            "INSERT INTO subscriptions (id, account, filter_json, rules_json, state, last_processed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                subscription.id.to_string(),
                subscription.account,
                subscription.filter.to_string(),
                serde_json::to_string(&subscription.replication_rules)?,
                subscription.state.as_str(),
                subscription.last_processed.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn list_active_subscriptions(&self) -> Result<Vec<Subscription>, CatalogError> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id, account, filter_json, rules_json, last_processed FROM subscriptions WHERE state = 'ACTIVE'")?;
        let rows = stmt.query_map([], |r| {
            let id: String = r.get(0)?;
            let filter_json: String = r.get(2)?;
            let rules_json: String = r.get(3)?;
            let last_processed: Option<String> = r.get(4)?;
            Ok((id, r.get::<_, String>(1)?, filter_json, rules_json, last_processed))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, account, filter_json, rules_json, last_processed) = row?;
            out.push(Subscription {
                id: Uuid::parse_str(&id).expect("subscription id always a valid uuid"),
                account,
                filter: serde_json::from_str(&filter_json)?,
                replication_rules: serde_json::from_str::<Vec<RuleTemplate>>(&rules_json)?,
                state: SubscriptionState::Active,
                last_processed: last_processed.map(|t| DateTime::parse_from_rfc3339(&t).expect("stored last_processed always rfc3339").with_timezone(&Utc)),
            });
        }
        Ok(out)
    }

    pub fn touch_subscription(&self, id: Uuid) -> Result<(), CatalogError> {
        self.conn().execute(
            "UPDATE subscriptions SET last_processed = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(())
    }

    pub fn add_message(&self, message: &Message) -> Result<(), CatalogError> {
        self.conn().execute(
            "INSERT INTO messages (id, event_type, payload_json, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![message.id.to_string(), message.event_type, message.payload.to_string(), message.created_at.to_rfc3339()],
        )?;
        Ok(())
    }
}

impl<'s> Drop for Transaction<'s> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.guard.execute_batch("ROLLBACK");
        }
    }
}
