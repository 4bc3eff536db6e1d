//! Local store seam and the file-backed reference store.

use crate::clock::Clock;
use crate::error::{EngineResult, SyncError};
use crate::journal::SyncJournal;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shelfsync_model::{Entity, EntityKind, Fields, Operation, RemoteSnapshot};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// The authoritative local record store, as seen by the sync processor.
///
/// Implementations call [`LocalStore::enqueue_mutation`] themselves on every
/// user-facing write. The sync-facing writes below never enqueue.
pub trait LocalStore: Send + Sync {
    /// Returns an entity by local ID, tombstones included.
    fn get_entity(&self, kind: EntityKind, id: &str) -> EngineResult<Option<Entity>>;

    /// Returns the entity linked to a remote record, tombstones included.
    fn find_by_remote_id(&self, kind: EntityKind, remote_id: &str) -> EngineResult<Option<Entity>>;

    /// Returns a live entity whose string field `field` equals `value`.
    fn find_by_field(&self, kind: EntityKind, field: &str, value: &str)
        -> EngineResult<Option<Entity>>;

    /// Live entities modified after `since` (all of them when `None`).
    fn list_entities_modified_since(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
    ) -> EngineResult<Vec<Entity>>;

    /// Overwrites an entity with a remote snapshot and links it.
    fn apply_remote_snapshot(&self, entity: &Entity, snapshot: &RemoteSnapshot)
        -> EngineResult<Entity>;

    /// Creates a new local entity from a remote snapshot.
    fn create_from_remote(&self, snapshot: &RemoteSnapshot) -> EngineResult<Entity>;

    /// Records that an entity now matches remote record `remote_id` as of
    /// `remote_modified_at`.
    fn mark_synced(
        &self,
        kind: EntityKind,
        id: &str,
        remote_id: &str,
        remote_modified_at: DateTime<Utc>,
    ) -> EngineResult<()>;

    /// Removes an entity or tombstone for good.
    fn purge(&self, kind: EntityKind, id: &str) -> EngineResult<()>;

    /// Records a local mutation in the sync queue.
    fn enqueue_mutation(&self, kind: EntityKind, id: &str, operation: Operation) -> EngineResult<()>;
}

type Key = (EntityKind, String);

#[derive(Serialize, Deserialize, Default)]
struct StoreFile {
    entities: Vec<Entity>,
}

/// A local store kept in memory and committed to a JSON file.
///
/// Every mutation rewrites the file through a temporary sibling and an
/// atomic rename, so a crash leaves either the old or the new state.
/// Deleting a linked entity leaves a tombstone until the delete has been
/// pushed.
pub struct JsonLocalStore {
    path: Option<PathBuf>,
    entities: RwLock<BTreeMap<Key, Entity>>,
    journal: Arc<SyncJournal>,
    clock: Arc<dyn Clock>,
}

impl JsonLocalStore {
    /// Opens a store file, creating an empty store if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::LocalStorage` if the file exists but cannot be
    /// read or parsed.
    pub fn open(path: &Path, journal: Arc<SyncJournal>, clock: Arc<dyn Clock>) -> EngineResult<Self> {
        let entities = if path.exists() {
            let bytes = fs::read(path)?;
            let file: StoreFile = serde_json::from_slice(&bytes)
                .map_err(|e| SyncError::local(format!("{}: {e}", path.display())))?;
            file.entities
                .into_iter()
                .map(|e| ((e.kind, e.id.clone()), e))
                .collect()
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            entities: RwLock::new(entities),
            journal,
            clock,
        })
    }

    /// Creates a store that is never written to disk.
    pub fn in_memory(journal: Arc<SyncJournal>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: None,
            entities: RwLock::new(BTreeMap::new()),
            journal,
            clock,
        }
    }

    /// The journal this store enqueues into.
    pub fn journal(&self) -> &Arc<SyncJournal> {
        &self.journal
    }

    /// Creates an entity with a generated ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the change cannot be queued or committed.
    pub fn create(&self, kind: EntityKind, fields: Fields) -> EngineResult<Entity> {
        let id = Uuid::new_v4().simple().to_string();
        self.insert(kind, &id, fields)
    }

    /// Creates an entity with the given ID.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::AlreadyExists` if the ID is taken, or
    /// `SyncError::LocalStorage` if the change cannot be queued or committed.
    pub fn insert(&self, kind: EntityKind, id: &str, fields: Fields) -> EngineResult<Entity> {
        let entity = Entity::new(kind, id, fields, self.clock.now());
        self.commit_user(kind, id, Operation::Create, |entities| {
            let key = (kind, id.to_string());
            if entities.contains_key(&key) {
                return Err(SyncError::AlreadyExists(format!("{kind}/{id}")));
            }
            entities.insert(key, entity.clone());
            Ok(())
        })?;
        Ok(entity)
    }

    /// Merges `changes` into a live entity. `null` values remove fields.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NotFound` if there is no live entity with this ID.
    pub fn update_fields(&self, kind: EntityKind, id: &str, changes: Fields) -> EngineResult<Entity> {
        let now = self.clock.now();
        self.commit_user(kind, id, Operation::Update, |entities| {
            let entity = live_mut(entities, kind, id)?;
            for (name, value) in changes {
                if value.is_null() {
                    entity.fields.remove(&name);
                } else {
                    entity.fields.insert(name, value);
                }
            }
            entity.local_modified_at = now;
            Ok(entity.clone())
        })
    }

    /// Deletes a live entity, leaving a tombstone for the sync processor.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::NotFound` if there is no live entity with this ID.
    pub fn delete(&self, kind: EntityKind, id: &str) -> EngineResult<()> {
        let now = self.clock.now();
        self.commit_user(kind, id, Operation::Delete, |entities| {
            let entity = live_mut(entities, kind, id)?;
            entity.deleted_at = Some(now);
            entity.local_modified_at = now;
            Ok(())
        })
    }

    /// Live entities of a kind.
    pub fn list(&self, kind: EntityKind) -> Vec<Entity> {
        self.entities
            .read()
            .values()
            .filter(|e| e.kind == kind && !e.is_deleted())
            .cloned()
            .collect()
    }

    fn commit<T>(
        &self,
        change: impl FnOnce(&mut BTreeMap<Key, Entity>) -> EngineResult<T>,
    ) -> EngineResult<T> {
        self.commit_then(change, || Ok(()))
    }

    /// Commits a user write. The queue item is persisted before the entity:
    /// a crash in between leaves an item whose change never landed, which
    /// the processor settles without a remote call.
    fn commit_user<T>(
        &self,
        kind: EntityKind,
        id: &str,
        operation: Operation,
        change: impl FnOnce(&mut BTreeMap<Key, Entity>) -> EngineResult<T>,
    ) -> EngineResult<T> {
        self.commit_then(change, || self.enqueue_mutation(kind, id, operation))
    }

    fn commit_then<T>(
        &self,
        change: impl FnOnce(&mut BTreeMap<Key, Entity>) -> EngineResult<T>,
        before_write: impl FnOnce() -> EngineResult<()>,
    ) -> EngineResult<T> {
        let mut entities = self.entities.write();
        let mut staged = entities.clone();
        let value = change(&mut staged)?;
        before_write()?;
        if let Some(path) = &self.path {
            write_atomically(path, &staged)?;
        }
        *entities = staged;
        Ok(value)
    }

    fn find(&self, predicate: impl Fn(&Entity) -> bool) -> Option<Entity> {
        self.entities.read().values().find(|e| predicate(e)).cloned()
    }
}

impl LocalStore for JsonLocalStore {
    fn get_entity(&self, kind: EntityKind, id: &str) -> EngineResult<Option<Entity>> {
        Ok(self.entities.read().get(&(kind, id.to_string())).cloned())
    }

    fn find_by_remote_id(&self, kind: EntityKind, remote_id: &str) -> EngineResult<Option<Entity>> {
        Ok(self.find(|e| e.kind == kind && e.remote_id.as_deref() == Some(remote_id)))
    }

    fn find_by_field(
        &self,
        kind: EntityKind,
        field: &str,
        value: &str,
    ) -> EngineResult<Option<Entity>> {
        Ok(self.find(|e| e.kind == kind && !e.is_deleted() && e.field_str(field) == Some(value)))
    }

    fn list_entities_modified_since(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
    ) -> EngineResult<Vec<Entity>> {
        Ok(self
            .list(kind)
            .into_iter()
            .filter(|e| match since {
                Some(s) => e.local_modified_at > s,
                None => true,
            })
            .collect())
    }

    fn apply_remote_snapshot(
        &self,
        entity: &Entity,
        snapshot: &RemoteSnapshot,
    ) -> EngineResult<Entity> {
        let applied = self.commit(|entities| {
            let current = entities
                .get_mut(&(entity.kind, entity.id.clone()))
                .ok_or_else(|| SyncError::NotFound(format!("{}/{}", entity.kind, entity.id)))?;
            current.fields = snapshot.fields.clone();
            current.remote_id = Some(snapshot.remote_id.clone());
            current.remote_modified_at = Some(snapshot.remote_modified_at);
            current.local_modified_at = snapshot.remote_modified_at;
            current.deleted_at = None;
            Ok(current.clone())
        })?;
        debug!(kind = %entity.kind, id = %entity.id, remote_id = %snapshot.remote_id, "applied remote snapshot");
        Ok(applied)
    }

    fn create_from_remote(&self, snapshot: &RemoteSnapshot) -> EngineResult<Entity> {
        let id = Uuid::new_v4().simple().to_string();
        let entity = Entity::new(
            snapshot.kind,
            id.clone(),
            snapshot.fields.clone(),
            snapshot.remote_modified_at,
        )
        .with_remote(snapshot.remote_id.clone(), snapshot.remote_modified_at);

        self.commit(|entities| {
            entities.insert((snapshot.kind, id), entity.clone());
            Ok(())
        })?;
        debug!(kind = %snapshot.kind, id = %entity.id, remote_id = %snapshot.remote_id, "created from remote");
        Ok(entity)
    }

    fn mark_synced(
        &self,
        kind: EntityKind,
        id: &str,
        remote_id: &str,
        remote_modified_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        self.commit(|entities| {
            let entity = entities
                .get_mut(&(kind, id.to_string()))
                .ok_or_else(|| SyncError::NotFound(format!("{kind}/{id}")))?;
            entity.remote_id = Some(remote_id.to_string());
            entity.remote_modified_at = Some(remote_modified_at);
            Ok(())
        })
    }

    fn purge(&self, kind: EntityKind, id: &str) -> EngineResult<()> {
        self.commit(|entities| {
            entities.remove(&(kind, id.to_string()));
            Ok(())
        })
    }

    fn enqueue_mutation(&self, kind: EntityKind, id: &str, operation: Operation) -> EngineResult<()> {
        self.journal.enqueue(kind, id, operation, self.clock.now())?;
        Ok(())
    }
}

fn live_mut<'a>(
    entities: &'a mut BTreeMap<Key, Entity>,
    kind: EntityKind,
    id: &str,
) -> EngineResult<&'a mut Entity> {
    entities
        .get_mut(&(kind, id.to_string()))
        .filter(|e| !e.is_deleted())
        .ok_or_else(|| SyncError::NotFound(format!("{kind}/{id}")))
}

fn write_atomically(path: &Path, entities: &BTreeMap<Key, Entity>) -> EngineResult<()> {
    let file = StoreFile {
        entities: entities.values().cloned().collect(),
    };
    let bytes = serde_json::to_vec_pretty(&file).map_err(SyncError::local)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    {
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(&bytes)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use serde_json::json;
    use shelfsync_model::QueueStatus;
    use std::time::Duration;
    use tempfile::tempdir;

    fn setup() -> (JsonLocalStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 2, 10, 0, 0, 0).unwrap(),
        ));
        let store = JsonLocalStore::in_memory(Arc::new(SyncJournal::in_memory()), clock.clone());
        (store, clock)
    }

    fn title(t: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("title".into(), json!(t));
        fields
    }

    #[test]
    fn insert_enqueues_create() {
        let (store, _) = setup();
        store.insert(EntityKind::Book, "b1", title("Dune")).unwrap();

        let pending = store.journal().list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, Operation::Create);
        assert_eq!(pending[0].entity_id, "b1");

        let err = store.insert(EntityKind::Book, "b1", title("Dune")).unwrap_err();
        assert!(matches!(err, SyncError::AlreadyExists(_)));
        assert!(!err.aborts_run());
        assert_eq!(store.journal().items().len(), 1);
    }

    #[test]
    fn update_bumps_local_timestamp_and_collapses() {
        let (store, clock) = setup();
        let created = store.insert(EntityKind::Book, "b1", title("Dune")).unwrap();
        clock.advance(Duration::from_secs(60));

        let mut changes = Fields::new();
        changes.insert("rating".into(), json!(5));
        let updated = store.update_fields(EntityKind::Book, "b1", changes).unwrap();

        assert!(updated.local_modified_at > created.local_modified_at);
        assert_eq!(updated.fields["rating"], json!(5));
        assert_eq!(store.journal().count_pending(), 1);
        assert_eq!(store.journal().list_pending()[0].operation, Operation::Create);
    }

    #[test]
    fn delete_leaves_tombstone_and_escalates() {
        let (store, _) = setup();
        store.insert(EntityKind::Book, "b1", title("Dune")).unwrap();
        store.delete(EntityKind::Book, "b1").unwrap();

        assert!(store.list(EntityKind::Book).is_empty());
        let tombstone = store.get_entity(EntityKind::Book, "b1").unwrap().unwrap();
        assert!(tombstone.is_deleted());
        assert_eq!(store.journal().list_pending()[0].operation, Operation::Delete);

        assert!(matches!(
            store.update_fields(EntityKind::Book, "b1", Fields::new()),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn sync_writes_do_not_enqueue() {
        let (store, clock) = setup();
        let snapshot = RemoteSnapshot::new(EntityKind::Book, "page-9", title("Emma"), clock.now());

        let created = store.create_from_remote(&snapshot).unwrap();
        assert_eq!(created.remote_id.as_deref(), Some("page-9"));
        assert_eq!(created.local_modified_at, snapshot.remote_modified_at);

        store
            .mark_synced(EntityKind::Book, &created.id, "page-9", clock.now())
            .unwrap();
        let applied = store.apply_remote_snapshot(&created, &snapshot).unwrap();
        assert_eq!(applied.fields, snapshot.fields);

        assert!(store.journal().items().is_empty());
    }

    #[test]
    fn lookups() {
        let (store, clock) = setup();
        let mut fields = title("Dune");
        fields.insert("isbn".into(), json!("0441013597"));
        store.insert(EntityKind::Book, "b1", fields).unwrap();
        store
            .mark_synced(EntityKind::Book, "b1", "page-1", clock.now())
            .unwrap();

        let by_remote = store.find_by_remote_id(EntityKind::Book, "page-1").unwrap();
        assert_eq!(by_remote.unwrap().id, "b1");
        let by_isbn = store
            .find_by_field(EntityKind::Book, "isbn", "0441013597")
            .unwrap();
        assert_eq!(by_isbn.unwrap().id, "b1");
        assert!(store
            .find_by_remote_id(EntityKind::ReadingLog, "page-1")
            .unwrap()
            .is_none());

        let before = clock.now();
        clock.advance(Duration::from_secs(5));
        store.insert(EntityKind::Book, "b2", title("Emma")).unwrap();
        let recent = store
            .list_entities_modified_since(EntityKind::Book, Some(before))
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, "b2");
        assert_eq!(
            store.list_entities_modified_since(EntityKind::Book, None).unwrap().len(),
            2
        );
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("library.json");
        let journal = Arc::new(SyncJournal::in_memory());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 2, 10, 0, 0, 0).unwrap(),
        ));

        {
            let store = JsonLocalStore::open(&path, journal.clone(), clock.clone()).unwrap();
            store.insert(EntityKind::Book, "b1", title("Dune")).unwrap();
            store.insert(EntityKind::ReadingLog, "r1", Fields::new()).unwrap();
            store.delete(EntityKind::ReadingLog, "r1").unwrap();
        }

        let store = JsonLocalStore::open(&path, journal.clone(), clock).unwrap();
        assert_eq!(store.list(EntityKind::Book)[0].label(), "Dune");
        assert!(store
            .get_entity(EntityKind::ReadingLog, "r1")
            .unwrap()
            .unwrap()
            .is_deleted());
        assert!(!dir.path().join("library.json.tmp").exists());

        store.purge(EntityKind::ReadingLog, "r1").unwrap();
        assert!(store.get_entity(EntityKind::ReadingLog, "r1").unwrap().is_none());
        assert_eq!(journal.items()[0].status, QueueStatus::Pending);
    }
}
