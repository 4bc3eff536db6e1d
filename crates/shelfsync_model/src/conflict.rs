//! Conflict detection.

use crate::entity::{Entity, RemoteSnapshot};
use chrono::{DateTime, Utc};
use std::fmt;

/// Classification of a divergence between local and remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictType {
    /// Exists locally, never created remotely.
    NewLocal,
    /// Exists remotely, unknown locally.
    NewRemote,
    /// Both sides changed since the last sync.
    BothModified,
    /// Linked locally, but gone or archived remotely.
    RemoteDeleted,
}

impl ConflictType {
    /// Returns the canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::NewLocal => "new_local",
            ConflictType::NewRemote => "new_remote",
            ConflictType::BothModified => "both_modified",
            ConflictType::RemoteDeleted => "remote_deleted",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected divergence. Transient; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConflict {
    /// Classification.
    pub conflict_type: ConflictType,
    /// Local side, if present.
    pub local: Option<Entity>,
    /// Remote side, if present.
    pub remote: Option<RemoteSnapshot>,
    /// Local modification time.
    pub local_modified_at: Option<DateTime<Utc>>,
    /// Remote modification time.
    pub remote_modified_at: Option<DateTime<Utc>>,
    /// Reference point used for the change test.
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl SyncConflict {
    fn new(
        conflict_type: ConflictType,
        local: Option<&Entity>,
        remote: Option<&RemoteSnapshot>,
        last_sync_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            conflict_type,
            local_modified_at: local.map(|l| l.local_modified_at),
            remote_modified_at: remote.map(|r| r.remote_modified_at),
            local: local.cloned(),
            remote: remote.cloned(),
            last_sync_time,
        }
    }

    /// Label of whichever side is present, local first.
    #[must_use]
    pub fn label(&self) -> String {
        match (&self.local, &self.remote) {
            (Some(local), _) => local.label(),
            (None, Some(remote)) => remote.label(),
            (None, None) => self.conflict_type.to_string(),
        }
    }
}

/// Classifies the relationship between a local entity and a remote record.
///
/// An archived remote snapshot counts as absent. A missing `last_sync` is
/// treated as the beginning of time, so both sides count as changed.
///
/// Returns `None` when there is nothing to reconcile, including the case
/// where only one side changed since `last_sync`.
#[must_use]
pub fn detect(
    local: Option<&Entity>,
    remote: Option<&RemoteSnapshot>,
    last_sync: Option<DateTime<Utc>>,
) -> Option<SyncConflict> {
    let live_remote = remote.filter(|r| !r.archived);

    let conflict_type = match (local, live_remote) {
        (None, None) => return None,
        (None, Some(_)) => ConflictType::NewRemote,
        (Some(l), None) if l.remote_id.is_none() => ConflictType::NewLocal,
        (Some(_), None) => ConflictType::RemoteDeleted,
        (Some(l), Some(r)) => {
            let changed = |at: DateTime<Utc>| match last_sync {
                Some(since) => at > since,
                None => true,
            };
            if changed(l.local_modified_at) && changed(r.remote_modified_at) {
                ConflictType::BothModified
            } else {
                return None;
            }
        }
    };

    Some(SyncConflict::new(conflict_type, local, remote, last_sync))
}
