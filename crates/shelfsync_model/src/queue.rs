//! Pending-change queue model.
//!
//! The queue is an ordered log of local mutations waiting to be pushed. It
//! holds at most one pending item per `(entity_type, entity_id)`: a second
//! mutation collapses into the existing item, and a delete always escalates
//! it. Items are never removed, only moved out of the pending state.

use crate::entity::EntityKind;
use crate::error::{ModelError, ModelResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Entity was created locally.
    Create,
    /// Entity was modified locally.
    Update,
    /// Entity was deleted locally.
    Delete,
}

impl Operation {
    /// Returns the canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Operation a pending item should carry after `incoming` collapses
    /// into it, or `None` if the pending item stays as is.
    #[must_use]
    pub fn collapse(self, incoming: Operation) -> Option<Operation> {
        match (self, incoming) {
            (Operation::Delete, _) => None,
            (_, Operation::Delete) => Some(Operation::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ModelError;

    fn from_str(s: &str) -> ModelResult<Self> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(ModelError::UnknownOperation(other.to_string())),
        }
    }
}

/// Lifecycle state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting to be pushed.
    Pending,
    /// Pushed, or made moot by a pull.
    Completed,
    /// Gave up after exhausting the retry budget.
    Abandoned,
}

impl QueueStatus {
    /// Returns the canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Completed => "completed",
            QueueStatus::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique item ID.
    pub id: Uuid,
    /// Insertion sequence number; breaks `created_at` ties.
    pub seq: u64,
    /// Kind of the mutated entity.
    pub entity_type: EntityKind,
    /// Local ID of the mutated entity.
    pub entity_id: String,
    /// Mutation to propagate.
    pub operation: Operation,
    /// Current status.
    pub status: QueueStatus,
    /// Failed push attempts across runs.
    pub retry_count: u32,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// When the item was enqueued.
    pub created_at: DateTime<Utc>,
    /// When the item last changed.
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    /// Returns true if the item is still waiting to be pushed.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == QueueStatus::Pending
    }
}

/// What `SyncQueue::enqueue` did with a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new pending item was created.
    Inserted(Uuid),
    /// The mutation was absorbed by an existing pending item.
    Collapsed(Uuid),
    /// An existing pending item was upgraded to `Delete`.
    Escalated(Uuid),
}

impl EnqueueOutcome {
    /// ID of the pending item that now represents the mutation.
    #[must_use]
    pub fn item_id(&self) -> Uuid {
        match self {
            EnqueueOutcome::Inserted(id)
            | EnqueueOutcome::Collapsed(id)
            | EnqueueOutcome::Escalated(id) => *id,
        }
    }

    /// Returns true if the queue state changed.
    #[must_use]
    pub fn changed(&self) -> bool {
        !matches!(self, EnqueueOutcome::Collapsed(_))
    }
}

type EntityKey = (EntityKind, String);

/// In-memory sync queue.
///
/// Durability is layered on top by replaying item snapshots through
/// [`SyncQueue::restore`].
#[derive(Debug, Clone, Default)]
pub struct SyncQueue {
    items: Vec<QueueItem>,
    by_id: HashMap<Uuid, usize>,
    pending: HashMap<EntityKey, Uuid>,
    next_seq: u64,
}

impl SyncQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a queue from item snapshots, later snapshots winning.
    #[must_use]
    pub fn from_items(items: impl IntoIterator<Item = QueueItem>) -> Self {
        let mut queue = Self::new();
        for item in items {
            queue.restore(item);
        }
        queue
    }

    /// Inserts or replaces an item by ID, keeping indexes consistent.
    pub fn restore(&mut self, item: QueueItem) {
        let key = (item.entity_type, item.entity_id.clone());
        self.next_seq = self.next_seq.max(item.seq + 1);

        if let Some(&idx) = self.by_id.get(&item.id) {
            let pending_here = self.pending.get(&key) == Some(&item.id);
            if pending_here && !item.is_pending() {
                self.pending.remove(&key);
            }
            if item.is_pending() {
                self.pending.insert(key, item.id);
            }
            self.items[idx] = item;
        } else {
            if item.is_pending() {
                self.pending.insert(key, item.id);
            }
            self.by_id.insert(item.id, self.items.len());
            self.items.push(item);
        }
    }

    /// Records a local mutation.
    pub fn enqueue(
        &mut self,
        entity_type: EntityKind,
        entity_id: &str,
        operation: Operation,
        now: DateTime<Utc>,
    ) -> EnqueueOutcome {
        let key = (entity_type, entity_id.to_string());

        if let Some(&existing) = self.pending.get(&key) {
            if let Some(&idx) = self.by_id.get(&existing) {
                let item = &mut self.items[idx];
                return match item.operation.collapse(operation) {
                    Some(upgraded) => {
                        item.operation = upgraded;
                        item.updated_at = now;
                        EnqueueOutcome::Escalated(existing)
                    }
                    None => EnqueueOutcome::Collapsed(existing),
                };
            }
        }

        let id = Uuid::new_v4();
        let seq = self.next_seq;
        self.restore(QueueItem {
            id,
            seq,
            entity_type,
            entity_id: entity_id.to_string(),
            operation,
            status: QueueStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        });
        EnqueueOutcome::Inserted(id)
    }

    /// Returns an item by ID.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<&QueueItem> {
        self.by_id.get(&id).map(|&idx| &self.items[idx])
    }

    /// Returns the pending item for an entity, if any.
    #[must_use]
    pub fn pending_for(&self, entity_type: EntityKind, entity_id: &str) -> Option<&QueueItem> {
        self.pending
            .get(&(entity_type, entity_id.to_string()))
            .and_then(|id| self.get(*id))
    }

    /// All pending items, oldest first.
    #[must_use]
    pub fn list_pending(&self) -> Vec<&QueueItem> {
        let mut pending: Vec<&QueueItem> = self.items.iter().filter(|i| i.is_pending()).collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));
        pending
    }

    /// Number of pending items.
    #[must_use]
    pub fn count_pending(&self) -> usize {
        self.pending.len()
    }

    /// Every item ever enqueued, in insertion order.
    #[must_use]
    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    /// Total number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if nothing was ever enqueued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Marks a pending item as successfully propagated.
    ///
    /// # Errors
    ///
    /// Returns an error if the item does not exist or is not pending.
    pub fn mark_completed(&mut self, id: Uuid, now: DateTime<Utc>) -> ModelResult<&QueueItem> {
        self.transition(id, now, |item| item.status = QueueStatus::Completed)
    }

    /// Marks a pending item as abandoned.
    ///
    /// # Errors
    ///
    /// Returns an error if the item does not exist or is not pending.
    pub fn mark_abandoned(
        &mut self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> ModelResult<&QueueItem> {
        self.transition(id, now, |item| {
            item.status = QueueStatus::Abandoned;
            item.last_error = Some(error.to_string());
        })
    }

    /// Records a failed push attempt.
    ///
    /// The item stays pending until `retry_count` exceeds `max_retries`, at
    /// which point it is abandoned.
    ///
    /// # Errors
    ///
    /// Returns an error if the item does not exist or is not pending.
    pub fn record_failure(
        &mut self,
        id: Uuid,
        error: &str,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> ModelResult<&QueueItem> {
        self.transition(id, now, |item| {
            item.retry_count = item.retry_count.saturating_add(1);
            item.last_error = Some(error.to_string());
            if item.retry_count > max_retries {
                item.status = QueueStatus::Abandoned;
            }
        })
    }

    /// Completes the pending item for an entity whose change was superseded
    /// by a pull. Returns the item ID if one was pending.
    pub fn cancel_pending_for(
        &mut self,
        entity_type: EntityKind,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> Option<Uuid> {
        let id = *self.pending.get(&(entity_type, entity_id.to_string()))?;
        self.mark_completed(id, now).ok().map(|item| item.id)
    }

    fn transition(
        &mut self,
        id: Uuid,
        now: DateTime<Utc>,
        apply: impl FnOnce(&mut QueueItem),
    ) -> ModelResult<&QueueItem> {
        let idx = *self.by_id.get(&id).ok_or(ModelError::ItemNotFound(id))?;
        let item = &mut self.items[idx];
        if !item.is_pending() {
            return Err(ModelError::NotPending {
                id,
                status: item.status,
            });
        }

        apply(item);
        item.updated_at = now;
        if !item.is_pending() {
            self.pending.remove(&(item.entity_type, item.entity_id.clone()));
        }

        Ok(&self.items[idx])
    }
}
