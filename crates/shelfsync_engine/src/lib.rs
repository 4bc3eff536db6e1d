//! # Shelfsync Engine
//!
//! Synchronizes a local book library with a remote, rate-limited record
//! collection.
//!
//! This crate provides:
//! - Sync processor state machine (idle → pushing → pulling → synced)
//! - Durable sync queue and per-collection cursors (the journal)
//! - Retry with exponential backoff around every remote call
//! - `LocalStore` and `RemoteStore` seams, with a file-backed local store,
//!   a scripted mock remote and an HTTP remote adapter
//!
//! ## Architecture
//!
//! A sync run is **push-then-pull**:
//! 1. Drain the pending queue in FIFO order, checking each update against
//!    the remote record first
//! 2. Query each remote collection for records changed since its cursor
//! 3. Advance the cursor only once the whole batch applied cleanly
//!
//! ## Key Invariants
//!
//! - At most one pending queue item per entity
//! - One queue item or pulled record is fully handled before the next
//! - Per-item failures are reported, never raised
//! - Cursors never move past work that was not durably applied

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod error;
mod http;
mod journal;
mod local;
mod processor;
mod remote;
mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{RemoteConfig, RetryConfig, SyncConfig};
pub use error::{EngineResult, SyncError};
pub use http::{HttpClient, HttpMethod, HttpRemoteStore, HttpRequest, HttpResponse};
pub use journal::SyncJournal;
pub use local::{JsonLocalStore, LocalStore};
pub use processor::{SyncProcessor, SyncResult, SyncState, SyncStats};
pub use remote::{MockRemoteStore, RemoteOp, RemoteStore};
pub use retry::with_retry;
