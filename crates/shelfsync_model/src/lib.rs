//! # Shelfsync Model
//!
//! Data model for synchronizing a local book library with a remote
//! record collection.
//!
//! This crate provides:
//! - `Entity` and `RemoteSnapshot`, the two sides being reconciled
//! - `SyncQueue` of pending local mutations with collapse rules
//! - `detect`, the pure conflict classifier
//! - `Resolution` and the `ResolutionPolicy` seam
//!
//! This is a pure crate with no I/O. Every function that needs the current
//! time takes it as an argument.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod entity;
mod error;
mod queue;
mod resolution;

pub use conflict::{detect, ConflictType, SyncConflict};
pub use entity::{Entity, EntityKind, Fields, RemoteSnapshot};
pub use error::{ModelError, ModelResult};
pub use queue::{EnqueueOutcome, Operation, QueueItem, QueueStatus, SyncQueue};
pub use resolution::{ConflictPolicy, Resolution, ResolutionPolicy};
