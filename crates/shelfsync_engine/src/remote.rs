//! Remote store seam and a scripted in-memory remote for testing.

use crate::clock::Clock;
use crate::error::{EngineResult, SyncError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shelfsync_model::{EntityKind, Fields, RemoteSnapshot};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

/// The remote record store.
///
/// This trait abstracts the network API, allowing for different
/// implementations (HTTP, in-memory mock for testing, etc.). Errors are
/// typed: `RateLimited` and `TransientRemote` are retried by the caller,
/// `NotFound` and `FatalRemote` are not.
pub trait RemoteStore: Send + Sync {
    /// Records of `kind` modified strictly after `since`, oldest first.
    /// Returns every record when `since` is `None`. Archived records are
    /// included and flagged.
    fn query_changed_since(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
    ) -> EngineResult<Vec<RemoteSnapshot>>;

    /// Fetches one record, or `None` if it does not exist.
    fn get(&self, kind: EntityKind, remote_id: &str) -> EngineResult<Option<RemoteSnapshot>>;

    /// Creates a record and returns its remote ID.
    fn create(&self, kind: EntityKind, fields: &Fields) -> EngineResult<String>;

    /// Replaces a record's fields.
    fn update(&self, kind: EntityKind, remote_id: &str, fields: &Fields) -> EngineResult<()>;

    /// Archives (soft-deletes) a record.
    fn archive(&self, kind: EntityKind, remote_id: &str) -> EngineResult<()>;
}

/// Remote store operations, for scripting failures and counting calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    /// `query_changed_since`.
    Query,
    /// `get`.
    Get,
    /// `create`.
    Create,
    /// `update`.
    Update,
    /// `archive`.
    Archive,
}

#[derive(Default)]
struct MockState {
    records: BTreeMap<(EntityKind, String), RemoteSnapshot>,
    failures: HashMap<RemoteOp, VecDeque<SyncError>>,
    calls: HashMap<RemoteOp, usize>,
    next_id: u64,
}

/// An in-memory remote store for testing.
///
/// Records are timestamped with the injected clock. Failures can be
/// scripted per operation; each scripted error is returned once, in order,
/// before the operation behaves normally again.
pub struct MockRemoteStore {
    clock: Arc<dyn Clock>,
    state: Mutex<MockState>,
}

impl MockRemoteStore {
    /// Creates an empty remote.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Makes the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: RemoteOp, error: SyncError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Number of calls made to `op`, failed ones included.
    pub fn calls(&self, op: RemoteOp) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Total number of calls made.
    pub fn total_calls(&self) -> usize {
        self.state.lock().calls.values().sum()
    }

    /// Resets all call counters.
    pub fn reset_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Seeds or overwrites a record as if edited on the remote side.
    pub fn put(&self, snapshot: RemoteSnapshot) {
        self.state
            .lock()
            .records
            .insert((snapshot.kind, snapshot.remote_id.clone()), snapshot);
    }

    /// Edits a record's fields on the remote side, stamping it with the
    /// current time. Returns false if the record does not exist.
    pub fn edit(&self, kind: EntityKind, remote_id: &str, fields: Fields) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        match state.records.get_mut(&(kind, remote_id.to_string())) {
            Some(record) => {
                record.fields = fields;
                record.remote_modified_at = now;
                true
            }
            None => false,
        }
    }

    /// Removes a record outright, as a hard delete on the remote side.
    pub fn remove(&self, kind: EntityKind, remote_id: &str) {
        self.state.lock().records.remove(&(kind, remote_id.to_string()));
    }

    /// Returns a record without counting a call.
    pub fn snapshot(&self, kind: EntityKind, remote_id: &str) -> Option<RemoteSnapshot> {
        self.state
            .lock()
            .records
            .get(&(kind, remote_id.to_string()))
            .cloned()
    }

    /// All records of a kind without counting a call.
    pub fn records(&self, kind: EntityKind) -> Vec<RemoteSnapshot> {
        self.state
            .lock()
            .records
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    fn begin(&self, op: RemoteOp) -> EngineResult<parking_lot::MutexGuard<'_, MockState>> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        if let Some(err) = state.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(state)
    }
}

impl RemoteStore for MockRemoteStore {
    fn query_changed_since(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
    ) -> EngineResult<Vec<RemoteSnapshot>> {
        let state = self.begin(RemoteOp::Query)?;
        let mut changed: Vec<RemoteSnapshot> = state
            .records
            .values()
            .filter(|r| r.kind == kind)
            .filter(|r| match since {
                Some(since) => r.remote_modified_at > since,
                None => true,
            })
            .cloned()
            .collect();
        changed.sort_by(|a, b| a.remote_modified_at.cmp(&b.remote_modified_at));
        Ok(changed)
    }

    fn get(&self, kind: EntityKind, remote_id: &str) -> EngineResult<Option<RemoteSnapshot>> {
        let state = self.begin(RemoteOp::Get)?;
        Ok(state.records.get(&(kind, remote_id.to_string())).cloned())
    }

    fn create(&self, kind: EntityKind, fields: &Fields) -> EngineResult<String> {
        let now = self.clock.now();
        let mut state = self.begin(RemoteOp::Create)?;
        state.next_id += 1;
        let remote_id = format!("{}-{}", kind.as_str().replace('_', "-"), state.next_id);
        state.records.insert(
            (kind, remote_id.clone()),
            RemoteSnapshot::new(kind, remote_id.clone(), fields.clone(), now),
        );
        Ok(remote_id)
    }

    fn update(&self, kind: EntityKind, remote_id: &str, fields: &Fields) -> EngineResult<()> {
        let now = self.clock.now();
        let mut state = self.begin(RemoteOp::Update)?;
        match state.records.get_mut(&(kind, remote_id.to_string())) {
            Some(record) if !record.archived => {
                record.fields = fields.clone();
                record.remote_modified_at = now;
                Ok(())
            }
            _ => Err(SyncError::NotFound(remote_id.to_string())),
        }
    }

    fn archive(&self, kind: EntityKind, remote_id: &str) -> EngineResult<()> {
        let now = self.clock.now();
        let mut state = self.begin(RemoteOp::Archive)?;
        match state.records.get_mut(&(kind, remote_id.to_string())) {
            Some(record) => {
                record.archived = true;
                record.remote_modified_at = now;
                Ok(())
            }
            None => Err(SyncError::NotFound(remote_id.to_string())),
        }
    }
}
