//! Durable sync queue and cursors.
//!
//! The journal is an append-only record log of CBOR-encoded state changes.
//! Opening a journal replays the log into an in-memory [`SyncQueue`] and
//! cursor map; every mutation appends one record before returning.

use crate::error::{EngineResult, SyncError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shelfsync_model::{EnqueueOutcome, EntityKind, Operation, QueueItem, QueueStatus, SyncQueue};
use shelfsync_storage::{FileRecordLog, MemoryRecordLog, RecordLog};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

/// One persisted state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum JournalRecord {
    /// A new pending item.
    Enqueued(QueueItem),
    /// New state of an existing item.
    Updated(QueueItem),
    /// A collection's cursor moved forward.
    CursorAdvanced {
        kind: EntityKind,
        cursor: DateTime<Utc>,
    },
    /// Full state written by compaction.
    Snapshot {
        items: Vec<QueueItem>,
        cursors: BTreeMap<EntityKind, DateTime<Utc>>,
    },
}

struct JournalState {
    log: Box<dyn RecordLog>,
    queue: SyncQueue,
    cursors: BTreeMap<EntityKind, DateTime<Utc>>,
}

impl JournalState {
    fn append(&mut self, record: &JournalRecord) -> EngineResult<()> {
        let bytes = encode(record)?;
        self.log.append(&bytes)?;
        Ok(())
    }

    /// Applies `change` to a copy of the queue, appends the record it
    /// returns, and only then swaps the copy in. A failed append leaves the
    /// queue untouched.
    fn stage<T>(
        &mut self,
        change: impl FnOnce(&mut SyncQueue) -> EngineResult<(T, Option<JournalRecord>)>,
    ) -> EngineResult<T> {
        let mut staged = self.queue.clone();
        let (value, record) = change(&mut staged)?;
        if let Some(record) = record {
            self.append(&record)?;
        }
        self.queue = staged;
        Ok(value)
    }
}

fn item_record(queue: &SyncQueue, id: Uuid, inserted: bool) -> EngineResult<JournalRecord> {
    let item = queue
        .get(id)
        .cloned()
        .ok_or(shelfsync_model::ModelError::ItemNotFound(id))?;
    Ok(if inserted {
        JournalRecord::Enqueued(item)
    } else {
        JournalRecord::Updated(item)
    })
}

/// The durable home of the sync queue and the per-collection sync cursors.
///
/// Shared between the local store (which enqueues on every write) and the
/// sync processor.
pub struct SyncJournal {
    state: Mutex<JournalState>,
}

impl SyncJournal {
    /// Opens or creates a journal file, replaying its contents.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::LocalStorage` if the file cannot be opened or a
    /// record cannot be decoded.
    pub fn open(path: &Path) -> EngineResult<Self> {
        let log = FileRecordLog::open_with_create_dirs(path)?.with_sync_on_append(true);
        if log.recovered_bytes() > 0 {
            info!(path = %path.display(), bytes = log.recovered_bytes(), "discarded torn journal tail");
        }
        Self::with_log(Box::new(log))
    }

    /// Creates an empty, non-persistent journal.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(JournalState {
                log: Box::new(MemoryRecordLog::new()),
                queue: SyncQueue::new(),
                cursors: BTreeMap::new(),
            }),
        }
    }

    /// Builds a journal over an arbitrary record log, replaying it.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::LocalStorage` if a record cannot be read or
    /// decoded.
    pub fn with_log(log: Box<dyn RecordLog>) -> EngineResult<Self> {
        let mut queue = SyncQueue::new();
        let mut cursors = BTreeMap::new();

        let records = log.read_all()?;
        let replayed = records.len();
        for bytes in records {
            match decode(&bytes)? {
                JournalRecord::Enqueued(item) | JournalRecord::Updated(item) => {
                    queue.restore(item);
                }
                JournalRecord::CursorAdvanced { kind, cursor } => {
                    cursors.insert(kind, cursor);
                }
                JournalRecord::Snapshot {
                    items,
                    cursors: snapshot,
                } => {
                    queue = SyncQueue::from_items(items);
                    cursors = snapshot;
                }
            }
        }
        debug!(records = replayed, pending = queue.count_pending(), "journal replayed");

        Ok(Self {
            state: Mutex::new(JournalState {
                log,
                queue,
                cursors,
            }),
        })
    }

    /// Records a local mutation, collapsing into any pending item.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::LocalStorage` if the change cannot be persisted.
    pub fn enqueue(
        &self,
        kind: EntityKind,
        entity_id: &str,
        operation: Operation,
        now: DateTime<Utc>,
    ) -> EngineResult<EnqueueOutcome> {
        let outcome = self.state.lock().stage(|queue| {
            let outcome = queue.enqueue(kind, entity_id, operation, now);
            let record = match outcome {
                EnqueueOutcome::Inserted(id) => Some(item_record(queue, id, true)?),
                EnqueueOutcome::Escalated(id) => Some(item_record(queue, id, false)?),
                EnqueueOutcome::Collapsed(_) => None,
            };
            Ok((outcome, record))
        })?;
        debug!(%kind, entity_id, %operation, ?outcome, "enqueued");
        Ok(outcome)
    }

    /// Pending items, oldest first.
    pub fn list_pending(&self) -> Vec<QueueItem> {
        self.state
            .lock()
            .queue
            .list_pending()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Every item, in insertion order.
    pub fn items(&self) -> Vec<QueueItem> {
        self.state.lock().queue.items().to_vec()
    }

    /// Returns an item by ID.
    pub fn get(&self, id: Uuid) -> Option<QueueItem> {
        self.state.lock().queue.get(id).cloned()
    }

    /// Returns the pending item for an entity.
    pub fn pending_for(&self, kind: EntityKind, entity_id: &str) -> Option<QueueItem> {
        self.state.lock().queue.pending_for(kind, entity_id).cloned()
    }

    /// Number of pending items.
    pub fn count_pending(&self) -> usize {
        self.state.lock().queue.count_pending()
    }

    /// Marks an item as pushed.
    ///
    /// # Errors
    ///
    /// Returns an error if the item is not pending or cannot be persisted.
    pub fn mark_completed(&self, id: Uuid, now: DateTime<Utc>) -> EngineResult<()> {
        self.state.lock().stage(|queue| {
            queue.mark_completed(id, now)?;
            Ok(((), Some(item_record(queue, id, false)?)))
        })
    }

    /// Marks an item as abandoned.
    ///
    /// # Errors
    ///
    /// Returns an error if the item is not pending or cannot be persisted.
    pub fn mark_abandoned(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> EngineResult<()> {
        self.state.lock().stage(|queue| {
            queue.mark_abandoned(id, error, now)?;
            Ok(((), Some(item_record(queue, id, false)?)))
        })
    }

    /// Records a failed push and returns the item's resulting status.
    ///
    /// # Errors
    ///
    /// Returns an error if the item is not pending or cannot be persisted.
    pub fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> EngineResult<QueueStatus> {
        self.state.lock().stage(|queue| {
            let status = queue.record_failure(id, error, max_retries, now)?.status;
            Ok((status, Some(item_record(queue, id, false)?)))
        })
    }

    /// Completes the pending item for an entity, if any.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::LocalStorage` if the change cannot be persisted.
    pub fn cancel_pending_for(
        &self,
        kind: EntityKind,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<Uuid>> {
        let cancelled = self.state.lock().stage(|queue| {
            let cancelled = queue.cancel_pending_for(kind, entity_id, now);
            let record = match cancelled {
                Some(id) => Some(item_record(queue, id, false)?),
                None => None,
            };
            Ok((cancelled, record))
        })?;
        if let Some(id) = cancelled {
            debug!(%kind, entity_id, %id, "pending change superseded");
        }
        Ok(cancelled)
    }

    /// The sync cursor of a collection.
    pub fn cursor(&self, kind: EntityKind) -> Option<DateTime<Utc>> {
        self.state.lock().cursors.get(&kind).copied()
    }

    /// All sync cursors.
    pub fn cursors(&self) -> BTreeMap<EntityKind, DateTime<Utc>> {
        self.state.lock().cursors.clone()
    }

    /// Moves a collection's cursor forward. Never moves it backwards.
    ///
    /// Returns true if the cursor changed.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::LocalStorage` if the change cannot be persisted.
    pub fn advance_cursor(&self, kind: EntityKind, cursor: DateTime<Utc>) -> EngineResult<bool> {
        let mut state = self.state.lock();
        if state.cursors.get(&kind).is_some_and(|current| *current >= cursor) {
            return Ok(false);
        }
        state.append(&JournalRecord::CursorAdvanced { kind, cursor })?;
        state.cursors.insert(kind, cursor);
        debug!(%kind, %cursor, "cursor advanced");
        Ok(true)
    }

    /// Rewrites the log as a single snapshot of the current state.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::LocalStorage` if the log cannot be rewritten.
    pub fn compact(&self) -> EngineResult<()> {
        let mut state = self.state.lock();
        let before = state.log.size()?;
        let snapshot = JournalRecord::Snapshot {
            items: state.queue.items().to_vec(),
            cursors: state.cursors.clone(),
        };
        state.log.replace_all(&[encode(&snapshot)?])?;
        info!(before, after = state.log.size()?, "journal compacted");
        Ok(())
    }

    /// Flushes the log to stable storage.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::LocalStorage` on I/O failure.
    pub fn sync(&self) -> EngineResult<()> {
        self.state.lock().log.sync()?;
        Ok(())
    }
}

fn encode(record: &JournalRecord) -> EngineResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(record, &mut bytes)
        .map_err(|e| SyncError::local(format!("journal encode: {e}")))?;
    Ok(bytes)
}

fn decode(bytes: &[u8]) -> EngineResult<JournalRecord> {
    ciborium::from_reader(bytes).map_err(|e| SyncError::local(format!("journal decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use shelfsync_storage::{StorageError, StorageResult};
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Memory log shared with the test, whose appends fail on demand.
    #[derive(Clone, Default)]
    struct FullDisk {
        inner: Arc<Mutex<MemoryRecordLog>>,
        full: Arc<AtomicBool>,
    }

    impl FullDisk {
        fn fill(&self) {
            self.full.store(true, Ordering::SeqCst);
        }

        fn replay(&self) -> SyncJournal {
            let data = self.inner.lock().data();
            let log = MemoryRecordLog::with_data(data).unwrap();
            SyncJournal::with_log(Box::new(log)).unwrap()
        }
    }

    impl RecordLog for FullDisk {
        fn append(&mut self, payload: &[u8]) -> StorageResult<u64> {
            if self.full.load(Ordering::SeqCst) {
                return Err(StorageError::Io(io::Error::other("disk full")));
            }
            self.inner.lock().append(payload)
        }

        fn read_all(&self) -> StorageResult<Vec<Vec<u8>>> {
            self.inner.lock().read_all()
        }

        fn replace_all(&mut self, records: &[Vec<u8>]) -> StorageResult<()> {
            self.inner.lock().replace_all(records)
        }

        fn sync(&mut self) -> StorageResult<()> {
            Ok(())
        }

        fn size(&self) -> StorageResult<u64> {
            self.inner.lock().size()
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn queue_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");

        let (done, pending) = {
            let journal = SyncJournal::open(&path).unwrap();
            let done = journal
                .enqueue(EntityKind::Book, "b1", Operation::Create, t0())
                .unwrap()
                .item_id();
            let pending = journal
                .enqueue(EntityKind::Book, "b2", Operation::Update, t0())
                .unwrap()
                .item_id();
            journal.enqueue(EntityKind::Book, "b2", Operation::Delete, t0()).unwrap();
            journal.mark_completed(done, t0()).unwrap();
            (done, pending)
        };

        let journal = SyncJournal::open(&path).unwrap();
        assert_eq!(journal.items().len(), 2);
        assert_eq!(journal.get(done).unwrap().status, QueueStatus::Completed);

        let list = journal.list_pending();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, pending);
        assert_eq!(list[0].operation, Operation::Delete);
    }

    #[test]
    fn collapsed_enqueue_writes_nothing() {
        let journal = SyncJournal::in_memory();
        journal.enqueue(EntityKind::Book, "b1", Operation::Create, t0()).unwrap();
        let size = journal.state.lock().log.size().unwrap();

        let outcome = journal
            .enqueue(EntityKind::Book, "b1", Operation::Update, t0())
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Collapsed(_)));
        assert_eq!(journal.state.lock().log.size().unwrap(), size);
    }

    #[test]
    fn failure_count_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");

        let id = {
            let journal = SyncJournal::open(&path).unwrap();
            let id = journal
                .enqueue(EntityKind::ReadingLog, "r1", Operation::Update, t0())
                .unwrap()
                .item_id();
            assert_eq!(
                journal.record_failure(id, "400 bad request", 1, t0()).unwrap(),
                QueueStatus::Pending
            );
            id
        };

        let journal = SyncJournal::open(&path).unwrap();
        assert_eq!(journal.get(id).unwrap().retry_count, 1);
        assert_eq!(
            journal.record_failure(id, "400 bad request", 1, t0()).unwrap(),
            QueueStatus::Abandoned
        );
        assert_eq!(journal.count_pending(), 0);
    }

    #[test]
    fn cursor_only_moves_forward() {
        let journal = SyncJournal::in_memory();
        assert_eq!(journal.cursor(EntityKind::Book), None);

        assert!(journal.advance_cursor(EntityKind::Book, t0()).unwrap());
        assert!(!journal
            .advance_cursor(EntityKind::Book, t0() - Duration::hours(1))
            .unwrap());
        assert!(!journal.advance_cursor(EntityKind::Book, t0()).unwrap());
        assert_eq!(journal.cursor(EntityKind::Book), Some(t0()));
        assert_eq!(journal.cursor(EntityKind::ReadingLog), None);
    }

    #[test]
    fn compact_preserves_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");

        {
            let journal = SyncJournal::open(&path).unwrap();
            for i in 0..20 {
                let id = journal
                    .enqueue(EntityKind::Book, &format!("b{i}"), Operation::Create, t0())
                    .unwrap()
                    .item_id();
                if i % 2 == 0 {
                    journal.mark_completed(id, t0()).unwrap();
                }
            }
            journal.advance_cursor(EntityKind::Book, t0()).unwrap();

            let before = journal.state.lock().log.size().unwrap();
            journal.compact().unwrap();
            assert!(journal.state.lock().log.size().unwrap() < before);

            // Appends after compaction land after the snapshot.
            journal
                .advance_cursor(EntityKind::ReadingLog, t0() + Duration::days(1))
                .unwrap();
        }

        let journal = SyncJournal::open(&path).unwrap();
        assert_eq!(journal.items().len(), 20);
        assert_eq!(journal.count_pending(), 10);
        assert_eq!(journal.cursor(EntityKind::Book), Some(t0()));
        assert_eq!(
            journal.cursor(EntityKind::ReadingLog),
            Some(t0() + Duration::days(1))
        );
    }

    #[test]
    fn cancel_pending_for_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");

        {
            let journal = SyncJournal::open(&path).unwrap();
            journal.enqueue(EntityKind::Book, "b1", Operation::Update, t0()).unwrap();
            assert!(journal
                .cancel_pending_for(EntityKind::Book, "b1", t0())
                .unwrap()
                .is_some());
            assert!(journal
                .cancel_pending_for(EntityKind::Book, "b1", t0())
                .unwrap()
                .is_none());
        }

        let journal = SyncJournal::open(&path).unwrap();
        assert!(journal.pending_for(EntityKind::Book, "b1").is_none());
        assert_eq!(journal.items()[0].status, QueueStatus::Completed);
    }

    #[test]
    fn abandoned_item_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");

        let id = {
            let journal = SyncJournal::open(&path).unwrap();
            let id = journal
                .enqueue(EntityKind::Book, "b1", Operation::Update, t0())
                .unwrap()
                .item_id();
            journal.mark_abandoned(id, "rejected by remote", t0()).unwrap();
            assert!(journal.mark_abandoned(id, "again", t0()).is_err());
            id
        };

        let journal = SyncJournal::open(&path).unwrap();
        let item = journal.get(id).unwrap();
        assert_eq!(item.status, QueueStatus::Abandoned);
        assert_eq!(item.last_error.as_deref(), Some("rejected by remote"));
        assert_eq!(journal.count_pending(), 0);

        // A new change to the same entity starts a fresh item.
        let fresh = journal
            .enqueue(EntityKind::Book, "b1", Operation::Update, t0())
            .unwrap();
        assert!(matches!(fresh, EnqueueOutcome::Inserted(_)));
        assert_ne!(fresh.item_id(), id);
    }

    #[test]
    fn failed_append_leaves_queue_untouched() {
        let disk = FullDisk::default();
        let journal = SyncJournal::with_log(Box::new(disk.clone())).unwrap();
        let id = journal
            .enqueue(EntityKind::Book, "b1", Operation::Update, t0())
            .unwrap()
            .item_id();
        disk.fill();

        let err = journal
            .enqueue(EntityKind::Book, "b2", Operation::Create, t0())
            .unwrap_err();
        assert!(matches!(err, SyncError::LocalStorage(_)));
        assert!(journal
            .enqueue(EntityKind::Book, "b1", Operation::Delete, t0())
            .is_err());
        assert!(journal.mark_completed(id, t0()).is_err());
        assert!(journal.mark_abandoned(id, "gone", t0()).is_err());
        assert!(journal.record_failure(id, "502", 3, t0()).is_err());
        assert!(journal.cancel_pending_for(EntityKind::Book, "b1", t0()).is_err());

        let item = journal.get(id).unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.operation, Operation::Update);
        assert_eq!(item.retry_count, 0);
        assert!(journal.pending_for(EntityKind::Book, "b2").is_none());

        let replayed = disk.replay();
        assert_eq!(journal.count_pending(), replayed.count_pending());
        assert_eq!(journal.items(), replayed.items());
    }
}
