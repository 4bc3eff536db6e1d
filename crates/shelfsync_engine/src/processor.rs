//! Sync processor state machine.

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::{EngineResult, SyncError};
use crate::journal::SyncJournal;
use crate::local::LocalStore;
use crate::remote::RemoteStore;
use crate::retry::with_retry;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use shelfsync_model::{
    detect, ConflictType, Entity, EntityKind, Operation, QueueItem, QueueStatus, RemoteSnapshot,
    Resolution, ResolutionPolicy,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The current state of the sync processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not syncing.
    Idle,
    /// Draining the pending queue.
    Pushing,
    /// Applying remote changes.
    Pulling,
    /// The last run completed.
    Synced,
    /// The last run aborted.
    Error,
}

impl SyncState {
    /// Returns true if a run is in progress.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Pushing | SyncState::Pulling)
    }

    /// Returns true if a new run may start.
    pub fn can_start_sync(&self) -> bool {
        !self.is_active()
    }
}

/// Cumulative statistics across runs.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Runs that completed without aborting.
    pub runs_completed: u64,
    /// Local changes written to the remote.
    pub pushed: u64,
    /// Remote changes applied locally.
    pub pulled: u64,
    /// Conflicts handed to a resolution policy.
    pub conflicts: u64,
    /// Remote calls repeated by the retry wrapper.
    pub retries: u64,
    /// When the last run completed.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Message of the last run-aborting error.
    pub last_error: Option<String>,
}

/// Report of one push, pull or full sync run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncResult {
    /// Local changes written to the remote.
    pub pushed: u64,
    /// Remote changes applied locally.
    pub pulled: u64,
    /// Conflicts handed to the resolution policy.
    pub conflicts: u64,
    /// Conflicts the policy chose to skip.
    pub skipped: u64,
    /// Per-item failures as `(entity label, message)`.
    pub errors: Vec<(String, String)>,
}

impl SyncResult {
    /// Returns true if no item failed.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn absorb(&mut self, other: SyncResult) {
        self.pushed += other.pushed;
        self.pulled += other.pulled;
        self.conflicts += other.conflicts;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }
}

/// How a queue item left the push step.
enum PushOutcome {
    /// A remote write happened.
    Pushed,
    /// Nothing left to push; the item is done.
    Settled,
    /// The local entity was overwritten by the remote version.
    TookRemote,
    /// The policy chose to skip; the item stays pending.
    Skipped,
}

/// Orchestrates push and pull runs between a local and a remote store.
///
/// Runs are strictly sequential: one queue item or pulled record is fully
/// handled, including its local commit, before the next starts. Per-item
/// failures are collected into [`SyncResult::errors`]; only errors for which
/// [`SyncError::aborts_run`] is true end the run early.
pub struct SyncProcessor<L: LocalStore, R: RemoteStore> {
    config: SyncConfig,
    local: Arc<L>,
    remote: Arc<R>,
    journal: Arc<SyncJournal>,
    clock: Arc<dyn Clock>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    cancelled: AtomicBool,
}

impl<L: LocalStore, R: RemoteStore> SyncProcessor<L, R> {
    /// Creates a new sync processor.
    pub fn new(
        config: SyncConfig,
        local: Arc<L>,
        remote: Arc<R>,
        journal: Arc<SyncJournal>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            local,
            remote,
            journal,
            clock,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the cumulative stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Kinds this processor synchronizes, in pull order.
    pub fn kinds(&self) -> &[EntityKind] {
        &self.config.kinds
    }

    /// Gets the journal holding the queue and cursors.
    pub fn journal(&self) -> &Arc<SyncJournal> {
        &self.journal
    }

    /// Requests cancellation. The current run stops before its next item
    /// and returns `SyncError::Cancelled`; if no run is active, the next
    /// one does.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Clears a pending cancellation request.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Runs a full sync: push, then pull from each collection's cursor.
    ///
    /// # Errors
    ///
    /// Returns an error only if the run had to stop: local storage failure,
    /// bad configuration, cancellation, or a run already in progress.
    pub fn sync(&self, policy: &dyn ResolutionPolicy) -> EngineResult<SyncResult> {
        self.run("sync", |result| {
            result.absorb(self.push_all(policy)?);
            result.absorb(self.pull_all(None, policy)?);
            Ok(())
        })
    }

    /// Pushes every pending queue item.
    ///
    /// # Errors
    ///
    /// See [`SyncProcessor::sync`].
    pub fn push_pending(&self, policy: &dyn ResolutionPolicy) -> EngineResult<SyncResult> {
        self.run("push", |result| {
            result.absorb(self.push_all(policy)?);
            Ok(())
        })
    }

    /// Pulls remote changes. With `since`, every collection is queried from
    /// that point instead of its cursor.
    ///
    /// # Errors
    ///
    /// See [`SyncProcessor::sync`].
    pub fn pull_changes(
        &self,
        since: Option<DateTime<Utc>>,
        policy: &dyn ResolutionPolicy,
    ) -> EngineResult<SyncResult> {
        self.run("pull", |result| {
            result.absorb(self.pull_all(since, policy)?);
            Ok(())
        })
    }

    fn run(
        &self,
        name: &str,
        body: impl FnOnce(&mut SyncResult) -> EngineResult<()>,
    ) -> EngineResult<SyncResult> {
        {
            let mut state = self.state.write();
            if !state.can_start_sync() {
                return Err(SyncError::InvalidStateTransition {
                    from: format!("{:?}", *state),
                    to: name.to_string(),
                });
            }
            *state = SyncState::Pushing;
        }

        let mut result = SyncResult::default();
        match self.check_cancelled().and_then(|()| body(&mut result)) {
            Ok(()) => {
                self.set_state(SyncState::Synced);
                let mut stats = self.stats.write();
                stats.runs_completed += 1;
                stats.pushed += result.pushed;
                stats.pulled += result.pulled;
                stats.conflicts += result.conflicts;
                stats.last_sync_time = Some(self.clock.now());
                stats.last_error = None;
                drop(stats);

                info!(
                    run = name,
                    pushed = result.pushed,
                    pulled = result.pulled,
                    conflicts = result.conflicts,
                    skipped = result.skipped,
                    errors = result.errors.len(),
                    "sync run finished"
                );
                Ok(result)
            }
            Err(e) => {
                self.handle_error(&e);
                Err(e)
            }
        }
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    fn handle_error(&self, error: &SyncError) {
        warn!(error = %error, "sync run aborted");
        self.set_state(SyncState::Error);
        self.stats.write().last_error = Some(error.to_string());
    }

    fn check_cancelled(&self) -> EngineResult<()> {
        if self.cancelled.swap(false, Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs one remote call under the retry wrapper and counts retries.
    fn remote_call<T>(
        &self,
        what: &str,
        mut call: impl FnMut(&R) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut attempts = 0u64;
        let result = with_retry(&self.config.retry, self.clock.as_ref(), what, || {
            attempts += 1;
            call(self.remote.as_ref())
        });
        if attempts > 1 {
            self.stats.write().retries += attempts - 1;
        }
        result
    }

    // ---- push ----

    fn push_all(&self, policy: &dyn ResolutionPolicy) -> EngineResult<SyncResult> {
        self.set_state(SyncState::Pushing);
        let mut result = SyncResult::default();

        for item in self.journal.list_pending() {
            self.check_cancelled()?;

            // An earlier item in this run may have settled this one.
            if self.journal.get(item.id).is_some_and(|i| !i.is_pending()) {
                continue;
            }

            let entity = self.local.get_entity(item.entity_type, &item.entity_id)?;
            let label = entity
                .as_ref()
                .map(Entity::label)
                .unwrap_or_else(|| format!("{}/{}", item.entity_type, item.entity_id));
            debug!(item = %item.id, %label, operation = %item.operation, "pushing");

            match self.push_item(&item, entity, policy, &mut result) {
                Ok(PushOutcome::Pushed) => {
                    self.journal.mark_completed(item.id, self.clock.now())?;
                    result.pushed += 1;
                }
                Ok(PushOutcome::TookRemote) => {
                    self.journal.mark_completed(item.id, self.clock.now())?;
                    result.pulled += 1;
                }
                Ok(PushOutcome::Settled) => {
                    self.journal.mark_completed(item.id, self.clock.now())?;
                }
                Ok(PushOutcome::Skipped) => {
                    result.skipped += 1;
                }
                Err(e) if e.aborts_run() => return Err(e),
                Err(e) => {
                    let message = e.to_string();
                    let status = self.journal.record_failure(
                        item.id,
                        &message,
                        self.config.max_item_retries,
                        self.clock.now(),
                    )?;
                    if status == QueueStatus::Abandoned {
                        warn!(item = %item.id, %label, error = %message, "queue item abandoned");
                    } else {
                        debug!(item = %item.id, %label, error = %message, "push failed");
                    }
                    result.errors.push((label, message));
                }
            }
        }

        Ok(result)
    }

    fn push_item(
        &self,
        item: &QueueItem,
        entity: Option<Entity>,
        policy: &dyn ResolutionPolicy,
        result: &mut SyncResult,
    ) -> EngineResult<PushOutcome> {
        let Some(entity) = entity else {
            return Ok(PushOutcome::Settled);
        };

        match item.operation {
            Operation::Delete if entity.is_deleted() => self.push_delete(&entity),
            // Queued ahead of a local delete that never committed.
            Operation::Delete => Ok(PushOutcome::Settled),
            // A live delete item owns the tombstone.
            _ if entity.is_deleted() => Ok(PushOutcome::Settled),
            _ => match entity.remote_id.clone() {
                None => self.push_create(&entity),
                Some(remote_id) => self.push_update(&entity, &remote_id, policy, result),
            },
        }
    }

    fn push_create(&self, entity: &Entity) -> EngineResult<PushOutcome> {
        let remote_id = self.remote_call("create", |r| r.create(entity.kind, &entity.fields))?;
        self.local
            .mark_synced(entity.kind, &entity.id, &remote_id, self.clock.now())?;
        debug!(kind = %entity.kind, id = %entity.id, %remote_id, "created remotely");
        Ok(PushOutcome::Pushed)
    }

    fn push_update(
        &self,
        entity: &Entity,
        remote_id: &str,
        policy: &dyn ResolutionPolicy,
        result: &mut SyncResult,
    ) -> EngineResult<PushOutcome> {
        let remote = self.remote_call("get", |r| r.get(entity.kind, remote_id))?;

        let Some(conflict) = detect(Some(entity), remote.as_ref(), entity.remote_modified_at) else {
            return self.write_update(entity, remote_id);
        };

        match conflict.conflict_type {
            ConflictType::BothModified => {
                result.conflicts += 1;
                match policy.resolve(&conflict) {
                    Resolution::KeepLocal => self.write_update(entity, remote_id),
                    Resolution::KeepRemote => match &remote {
                        Some(snapshot) => {
                            self.local.apply_remote_snapshot(entity, snapshot)?;
                            Ok(PushOutcome::TookRemote)
                        }
                        None => Ok(PushOutcome::Settled),
                    },
                    Resolution::Skip => Ok(PushOutcome::Skipped),
                }
            }
            ConflictType::RemoteDeleted => {
                result.conflicts += 1;
                match policy.resolve(&conflict) {
                    Resolution::KeepLocal => self.push_create(entity),
                    Resolution::KeepRemote => {
                        self.local.purge(entity.kind, &entity.id)?;
                        Ok(PushOutcome::TookRemote)
                    }
                    Resolution::Skip => Ok(PushOutcome::Skipped),
                }
            }
            ConflictType::NewLocal | ConflictType::NewRemote => self.write_update(entity, remote_id),
        }
    }

    fn write_update(&self, entity: &Entity, remote_id: &str) -> EngineResult<PushOutcome> {
        self.remote_call("update", |r| r.update(entity.kind, remote_id, &entity.fields))?;
        self.local
            .mark_synced(entity.kind, &entity.id, remote_id, self.clock.now())?;
        Ok(PushOutcome::Pushed)
    }

    fn push_delete(&self, entity: &Entity) -> EngineResult<PushOutcome> {
        let mut outcome = PushOutcome::Settled;
        if let Some(remote_id) = &entity.remote_id {
            match self.remote_call("archive", |r| r.archive(entity.kind, remote_id)) {
                Ok(()) => outcome = PushOutcome::Pushed,
                Err(SyncError::NotFound(_)) => {
                    debug!(kind = %entity.kind, %remote_id, "already gone remotely");
                }
                Err(e) => return Err(e),
            }
        }
        self.local.purge(entity.kind, &entity.id)?;
        Ok(outcome)
    }

    // ---- pull ----

    fn pull_all(
        &self,
        since: Option<DateTime<Utc>>,
        policy: &dyn ResolutionPolicy,
    ) -> EngineResult<SyncResult> {
        self.set_state(SyncState::Pulling);
        let mut result = SyncResult::default();

        for &kind in &self.config.kinds {
            self.check_cancelled()?;
            let from = since.or_else(|| self.journal.cursor(kind));

            let snapshots =
                match self.remote_call("query", |r| r.query_changed_since(kind, from)) {
                    Ok(snapshots) => snapshots,
                    Err(e) if e.aborts_run() => return Err(e),
                    Err(e) => {
                        warn!(%kind, error = %e, "remote query failed");
                        result.errors.push((kind.to_string(), e.to_string()));
                        continue;
                    }
                };
            debug!(%kind, since = ?from, count = snapshots.len(), "pulling");

            let mut batch_clean = true;
            let mut newest: Option<DateTime<Utc>> = None;
            for snapshot in &snapshots {
                self.check_cancelled()?;
                newest = newest.max(Some(snapshot.remote_modified_at));

                match self.pull_record(snapshot, policy, &mut result) {
                    Ok(()) => {}
                    Err(e) if e.aborts_run() => return Err(e),
                    Err(e) => {
                        batch_clean = false;
                        warn!(%kind, remote_id = %snapshot.remote_id, error = %e, "pull failed");
                        result.errors.push((snapshot.label(), e.to_string()));
                    }
                }
            }

            match newest {
                Some(cursor) if batch_clean => {
                    self.journal.advance_cursor(kind, cursor)?;
                }
                Some(_) => {
                    info!(%kind, "cursor held back by failed records");
                }
                None => {}
            }
        }

        Ok(result)
    }

    fn find_local(&self, snapshot: &RemoteSnapshot) -> EngineResult<Option<Entity>> {
        if let Some(entity) = self.local.find_by_remote_id(snapshot.kind, &snapshot.remote_id)? {
            return Ok(Some(entity));
        }
        if let Some((field, value)) = snapshot.natural_key(&self.config.natural_key_fields) {
            let matched = self.local.find_by_field(snapshot.kind, field, value)?;
            return Ok(matched.filter(|e| !e.is_linked()));
        }
        Ok(None)
    }

    fn pull_record(
        &self,
        snapshot: &RemoteSnapshot,
        policy: &dyn ResolutionPolicy,
        result: &mut SyncResult,
    ) -> EngineResult<()> {
        let local = self.find_local(snapshot)?;

        // A local delete wins until it has been pushed.
        if local.as_ref().is_some_and(Entity::is_deleted) {
            return Ok(());
        }

        let last_sync = local.as_ref().and_then(|e| e.remote_modified_at);
        let Some(conflict) = detect(local.as_ref(), Some(snapshot), last_sync) else {
            if let Some(entity) = local {
                let remote_changed = match last_sync {
                    Some(t) => snapshot.remote_modified_at > t,
                    None => true,
                };
                if remote_changed && !snapshot.archived {
                    self.take_remote(&entity, snapshot)?;
                    result.pulled += 1;
                }
            }
            return Ok(());
        };

        match (conflict.conflict_type, local) {
            (ConflictType::NewRemote, _) => {
                let created = self.local.create_from_remote(snapshot)?;
                self.journal
                    .cancel_pending_for(created.kind, &created.id, self.clock.now())?;
                result.pulled += 1;
            }
            (ConflictType::BothModified, Some(entity)) => {
                result.conflicts += 1;
                match policy.resolve(&conflict) {
                    Resolution::KeepRemote => {
                        self.take_remote(&entity, snapshot)?;
                        result.pulled += 1;
                    }
                    Resolution::KeepLocal => {
                        self.write_update(&entity, &snapshot.remote_id)?;
                        self.journal
                            .cancel_pending_for(entity.kind, &entity.id, self.clock.now())?;
                        result.pushed += 1;
                    }
                    Resolution::Skip => result.skipped += 1,
                }
            }
            (ConflictType::RemoteDeleted, Some(entity)) => {
                result.conflicts += 1;
                match policy.resolve(&conflict) {
                    Resolution::KeepRemote => {
                        self.local.purge(entity.kind, &entity.id)?;
                        self.journal
                            .cancel_pending_for(entity.kind, &entity.id, self.clock.now())?;
                        result.pulled += 1;
                    }
                    Resolution::KeepLocal => {
                        self.push_create(&entity)?;
                        self.journal
                            .cancel_pending_for(entity.kind, &entity.id, self.clock.now())?;
                        result.pushed += 1;
                    }
                    Resolution::Skip => result.skipped += 1,
                }
            }
            // Unlinked local matched to an archived record: nothing to pull.
            _ => {}
        }

        Ok(())
    }

    fn take_remote(&self, entity: &Entity, snapshot: &RemoteSnapshot) -> EngineResult<()> {
        self.local.apply_remote_snapshot(entity, snapshot)?;
        self.journal
            .cancel_pending_for(entity.kind, &entity.id, self.clock.now())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::local::JsonLocalStore;
    use crate::remote::{MockRemoteStore, RemoteOp};
    use crate::RetryConfig;
    use chrono::TimeZone;
    use serde_json::json;
    use shelfsync_model::{ConflictPolicy, Fields};
    use std::time::Duration;

    struct Harness {
        clock: Arc<ManualClock>,
        local: Arc<JsonLocalStore>,
        remote: Arc<MockRemoteStore>,
        processor: SyncProcessor<JsonLocalStore, MockRemoteStore>,
    }

    fn harness(config: SyncConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
        ));
        let journal = Arc::new(SyncJournal::in_memory());
        let local = Arc::new(JsonLocalStore::in_memory(journal.clone(), clock.clone()));
        let remote = Arc::new(MockRemoteStore::new(clock.clone()));
        let processor =
            SyncProcessor::new(config, local.clone(), remote.clone(), journal, clock.clone());
        Harness {
            clock,
            local,
            remote,
            processor,
        }
    }

    fn title(t: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("title".into(), json!(t));
        fields
    }

    #[test]
    fn sync_state_checks() {
        assert!(SyncState::Idle.can_start_sync());
        assert!(SyncState::Synced.can_start_sync());
        assert!(SyncState::Error.can_start_sync());
        assert!(!SyncState::Pulling.can_start_sync());
        assert!(!SyncState::Pushing.can_start_sync());
        assert!(SyncState::Pushing.is_active());
    }

    #[test]
    fn push_creates_and_links() {
        let h = harness(SyncConfig::new());
        h.local.insert(EntityKind::Book, "b1", title("Dune")).unwrap();

        let result = h.processor.push_pending(&ConflictPolicy::RemoteWins).unwrap();
        assert_eq!(result.pushed, 1);
        assert!(result.is_clean());

        let entity = h.local.get_entity(EntityKind::Book, "b1").unwrap().unwrap();
        let remote_id = entity.remote_id.unwrap();
        assert_eq!(entity.remote_modified_at, Some(h.clock.now()));
        assert_eq!(
            h.remote.snapshot(EntityKind::Book, &remote_id).unwrap().fields,
            title("Dune")
        );
        assert_eq!(h.processor.state(), SyncState::Synced);
        assert_eq!(h.processor.journal().count_pending(), 0);
    }

    #[test]
    fn push_skips_missing_local_entity() {
        let h = harness(SyncConfig::new());
        h.local
            .enqueue_mutation(EntityKind::Book, "ghost", Operation::Update)
            .unwrap();

        let result = h.processor.push_pending(&ConflictPolicy::RemoteWins).unwrap();
        assert_eq!(result, SyncResult::default());
        assert_eq!(h.remote.total_calls(), 0);
        assert_eq!(h.processor.journal().count_pending(), 0);
    }

    #[test]
    fn delete_archives_and_purges_tombstone() {
        let h = harness(SyncConfig::new());
        h.local.insert(EntityKind::Book, "b1", title("Dune")).unwrap();
        h.processor.push_pending(&ConflictPolicy::RemoteWins).unwrap();
        let remote_id = h
            .local
            .get_entity(EntityKind::Book, "b1")
            .unwrap()
            .unwrap()
            .remote_id
            .unwrap();

        h.local.delete(EntityKind::Book, "b1").unwrap();
        let result = h.processor.push_pending(&ConflictPolicy::RemoteWins).unwrap();

        assert_eq!(result.pushed, 1);
        assert!(h.remote.snapshot(EntityKind::Book, &remote_id).unwrap().archived);
        assert!(h.local.get_entity(EntityKind::Book, "b1").unwrap().is_none());
    }

    #[test]
    fn delete_of_vanished_remote_still_completes() {
        let h = harness(SyncConfig::new());
        h.local.insert(EntityKind::Book, "b1", title("Dune")).unwrap();
        h.processor.push_pending(&ConflictPolicy::RemoteWins).unwrap();
        let remote_id = h.remote.records(EntityKind::Book)[0].remote_id.clone();
        h.remote.remove(EntityKind::Book, &remote_id);

        h.local.delete(EntityKind::Book, "b1").unwrap();
        let result = h.processor.push_pending(&ConflictPolicy::RemoteWins).unwrap();

        assert!(result.is_clean());
        assert_eq!(h.processor.journal().count_pending(), 0);
    }

    #[test]
    fn delete_of_never_pushed_entity_makes_no_remote_call() {
        let h = harness(SyncConfig::new());
        h.local.insert(EntityKind::Book, "b1", title("Dune")).unwrap();
        h.local.delete(EntityKind::Book, "b1").unwrap();

        h.processor.push_pending(&ConflictPolicy::RemoteWins).unwrap();
        assert_eq!(h.remote.total_calls(), 0);
        assert!(h.local.get_entity(EntityKind::Book, "b1").unwrap().is_none());
    }

    #[test]
    fn delete_item_for_live_entity_is_settled_without_archiving() {
        let h = harness(SyncConfig::new());
        h.local.insert(EntityKind::Book, "b1", title("Dune")).unwrap();
        h.processor.push_pending(&ConflictPolicy::RemoteWins).unwrap();
        let remote_id = h.remote.records(EntityKind::Book)[0].remote_id.clone();
        h.processor
            .journal()
            .enqueue(EntityKind::Book, "b1", Operation::Delete, h.clock.now())
            .unwrap();

        h.remote.reset_calls();
        let result = h.processor.push_pending(&ConflictPolicy::RemoteWins).unwrap();

        assert!(result.is_clean());
        assert_eq!(result.pushed, 0);
        assert_eq!(h.remote.total_calls(), 0);
        assert!(!h.remote.snapshot(EntityKind::Book, &remote_id).unwrap().archived);
        assert!(h.local.get_entity(EntityKind::Book, "b1").unwrap().is_some());
        assert_eq!(h.processor.journal().count_pending(), 0);
    }

    #[test]
    fn both_modified_push_follows_policy() {
        for (policy, expect_title, expect_pending) in [
            (ConflictPolicy::RemoteWins, "Remote title", 0),
            (ConflictPolicy::LocalWins, "Local title", 0),
            (ConflictPolicy::Skip, "Local title", 1),
        ] {
            let h = harness(SyncConfig::new());
            h.local.insert(EntityKind::Book, "b1", title("Original")).unwrap();
            h.processor.push_pending(&policy).unwrap();
            let remote_id = h.remote.records(EntityKind::Book)[0].remote_id.clone();

            h.clock.advance(Duration::from_secs(60));
            h.remote.edit(EntityKind::Book, &remote_id, title("Remote title"));
            h.clock.advance(Duration::from_secs(60));
            h.local
                .update_fields(EntityKind::Book, "b1", title("Local title"))
                .unwrap();

            let result = h.processor.push_pending(&policy).unwrap();
            assert_eq!(result.conflicts, 1, "{policy}");

            let entity = h.local.get_entity(EntityKind::Book, "b1").unwrap().unwrap();
            let expected_local = if policy == ConflictPolicy::RemoteWins {
                "Remote title"
            } else {
                "Local title"
            };
            assert_eq!(entity.field_str("title"), Some(expected_local), "{policy}");
            assert_eq!(
                h.remote.snapshot(EntityKind::Book, &remote_id).unwrap().fields["title"],
                json!(if policy == ConflictPolicy::LocalWins {
                    expect_title
                } else {
                    "Remote title"
                }),
                "{policy}"
            );
            assert_eq!(h.processor.journal().count_pending(), expect_pending, "{policy}");
            if policy == ConflictPolicy::Skip {
                assert_eq!(result.skipped, 1);
            }
        }
    }

    #[test]
    fn remote_deleted_keep_local_recreates() {
        let h = harness(SyncConfig::new());
        h.local.insert(EntityKind::Book, "b1", title("Dune")).unwrap();
        h.processor.push_pending(&ConflictPolicy::LocalWins).unwrap();
        let old_id = h.remote.records(EntityKind::Book)[0].remote_id.clone();
        h.remote.remove(EntityKind::Book, &old_id);

        h.clock.advance(Duration::from_secs(5));
        h.local
            .update_fields(EntityKind::Book, "b1", title("Dune Messiah"))
            .unwrap();
        let result = h.processor.push_pending(&ConflictPolicy::LocalWins).unwrap();

        assert_eq!(result.conflicts, 1);
        let entity = h.local.get_entity(EntityKind::Book, "b1").unwrap().unwrap();
        let new_id = entity.remote_id.unwrap();
        assert_ne!(new_id, old_id);
        assert!(h.remote.snapshot(EntityKind::Book, &new_id).is_some());
    }

    #[test]
    fn fatal_error_is_recorded_not_raised() {
        let h = harness(SyncConfig::new().with_retry(RetryConfig::no_retry()));
        h.local.insert(EntityKind::Book, "b1", title("Dune")).unwrap();
        h.remote
            .fail_next(RemoteOp::Create, SyncError::FatalRemote("HTTP 400: bad".into()));

        let result = h.processor.push_pending(&ConflictPolicy::RemoteWins).unwrap();
        assert_eq!(result.pushed, 0);
        assert_eq!(
            result.errors,
            vec![("Dune".to_string(), "remote error: HTTP 400: bad".to_string())]
        );

        let item = &h.processor.journal().list_pending()[0];
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.last_error.as_deref(), Some("remote error: HTTP 400: bad"));
    }

    #[test]
    fn retries_are_counted() {
        let h = harness(SyncConfig::new());
        h.local.insert(EntityKind::Book, "b1", title("Dune")).unwrap();
        h.remote
            .fail_next(RemoteOp::Create, SyncError::TransientRemote("502".into()));
        h.remote
            .fail_next(RemoteOp::Create, SyncError::TransientRemote("502".into()));

        let result = h.processor.push_pending(&ConflictPolicy::RemoteWins).unwrap();
        assert_eq!(result.pushed, 1);
        assert_eq!(h.processor.stats().retries, 2);
        assert_eq!(
            h.clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[test]
    fn pull_creates_new_remote_records_and_advances_cursor() {
        let h = harness(SyncConfig::new());
        let snapshot = RemoteSnapshot::new(EntityKind::Book, "page-1", title("Emma"), h.clock.now());
        h.remote.put(snapshot.clone());

        let result = h.processor.pull_changes(None, &ConflictPolicy::RemoteWins).unwrap();
        assert_eq!(result.pulled, 1);
        assert_eq!(h.local.list(EntityKind::Book)[0].remote_id.as_deref(), Some("page-1"));
        assert_eq!(
            h.processor.journal().cursor(EntityKind::Book),
            Some(snapshot.remote_modified_at)
        );
        assert_eq!(h.processor.journal().cursor(EntityKind::ReadingLog), None);
    }

    #[test]
    fn pull_links_by_natural_key() {
        let h = harness(SyncConfig::new());
        let mut fields = title("Dune");
        fields.insert("isbn".into(), json!("0441013597"));
        h.local.insert(EntityKind::Book, "b1", fields.clone()).unwrap();

        h.clock.advance(Duration::from_secs(10));
        fields.insert("rating".into(), json!(5));
        h.remote.put(RemoteSnapshot::new(
            EntityKind::Book,
            "page-7",
            fields,
            h.clock.now(),
        ));

        let result = h.processor.pull_changes(None, &ConflictPolicy::RemoteWins).unwrap();
        assert_eq!(result.conflicts, 1);
        assert_eq!(h.local.list(EntityKind::Book).len(), 1);
        let entity = h.local.get_entity(EntityKind::Book, "b1").unwrap().unwrap();
        assert_eq!(entity.remote_id.as_deref(), Some("page-7"));
        assert_eq!(entity.fields["rating"], json!(5));
        assert_eq!(h.processor.journal().count_pending(), 0);
    }

    #[test]
    fn pull_error_holds_cursor_back() {
        let h = harness(SyncConfig::new());
        h.remote.put(RemoteSnapshot::new(
            EntityKind::Book,
            "page-1",
            title("Emma"),
            h.clock.now(),
        ));
        h.remote
            .fail_next(RemoteOp::Query, SyncError::FatalRemote("HTTP 401".into()));

        let result = h.processor.pull_changes(None, &ConflictPolicy::RemoteWins).unwrap();
        assert_eq!(result.errors.len(), 1);
        assert_eq!(h.processor.journal().cursor(EntityKind::Book), None);
        assert!(h.local.list(EntityKind::Book).is_empty());
    }

    #[test]
    fn pull_archived_remote_removes_local_under_remote_wins() {
        let h = harness(SyncConfig::new());
        h.local.insert(EntityKind::Book, "b1", title("Dune")).unwrap();
        h.processor.push_pending(&ConflictPolicy::RemoteWins).unwrap();
        let remote_id = h.remote.records(EntityKind::Book)[0].remote_id.clone();

        h.clock.advance(Duration::from_secs(30));
        h.remote.archive(EntityKind::Book, &remote_id).unwrap();

        let result = h.processor.pull_changes(None, &ConflictPolicy::RemoteWins).unwrap();
        assert_eq!(result.conflicts, 1);
        assert!(h.local.get_entity(EntityKind::Book, "b1").unwrap().is_none());
    }

    #[test]
    fn archived_remote_without_local_is_ignored() {
        let h = harness(SyncConfig::new());
        let mut snapshot = RemoteSnapshot::new(EntityKind::Book, "page-1", title("Gone"), h.clock.now());
        snapshot.archived = true;
        h.remote.put(snapshot);

        let result = h.processor.pull_changes(None, &ConflictPolicy::RemoteWins).unwrap();
        assert_eq!(result, SyncResult::default());
        assert!(h.local.list(EntityKind::Book).is_empty());
        assert!(h.processor.journal().cursor(EntityKind::Book).is_some());
    }

    #[test]
    fn cancellation_stops_run() {
        let h = harness(SyncConfig::new());
        h.local.insert(EntityKind::Book, "b1", title("Dune")).unwrap();

        h.processor.cancel();
        let err = h.processor.sync(&ConflictPolicy::RemoteWins).unwrap_err();
        assert_eq!(err, SyncError::Cancelled);
        assert_eq!(h.processor.state(), SyncState::Error);
        assert_eq!(h.remote.total_calls(), 0);
        assert_eq!(h.processor.stats().last_error.as_deref(), Some("sync cancelled"));

        // The request is consumed; the next run proceeds.
        let result = h.processor.sync(&ConflictPolicy::RemoteWins).unwrap();
        assert_eq!(result.pushed, 1);
        assert_eq!(h.processor.stats().runs_completed, 1);
    }

    #[test]
    fn sync_counts_stats() {
        let h = harness(SyncConfig::new());
        h.local.insert(EntityKind::Book, "b1", title("Dune")).unwrap();
        h.remote.put(RemoteSnapshot::new(
            EntityKind::ReadingLog,
            "log-1",
            Fields::new(),
            h.clock.now(),
        ));

        h.processor.sync(&ConflictPolicy::RemoteWins).unwrap();
        let stats = h.processor.stats();
        assert_eq!(stats.runs_completed, 1);
        assert_eq!(stats.pushed, 1);
        assert_eq!(stats.pulled, 1);
        assert_eq!(stats.last_sync_time, Some(h.clock.now()));
    }
}
