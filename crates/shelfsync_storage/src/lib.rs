//! # Shelfsync Storage
//!
//! Append-only record log used to persist shelfsync's sync state.
//!
//! A record log stores **opaque payloads**, one per record. Each record is
//! framed with a magic tag, a length and a CRC32 so that a crash in the middle
//! of an append can be detected and discarded on the next open.
//!
//! ## Design Principles
//!
//! - Logs are simple record stores (append, read all, replace all)
//! - No knowledge of what the payloads mean
//! - Must be `Send + Sync` so a journal can sit behind a lock
//! - A torn trailing record is dropped, never reported as data
//!
//! ## Available Logs
//!
//! - [`MemoryRecordLog`] - For testing and ephemeral state
//! - [`FileRecordLog`] - For persistent state using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use shelfsync_storage::{MemoryRecordLog, RecordLog};
//!
//! let mut log = MemoryRecordLog::new();
//! log.append(b"first").unwrap();
//! log.append(b"second").unwrap();
//! assert_eq!(log.read_all().unwrap(), vec![b"first".to_vec(), b"second".to_vec()]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod frame;
mod log;
mod memory;

pub use error::{StorageError, StorageResult};
pub use file::FileRecordLog;
pub use frame::{compute_crc32, decode_frames, encode_frame, DecodedFrames, FRAME_MAGIC, FRAME_OVERHEAD};
pub use log::RecordLog;
pub use memory::MemoryRecordLog;
