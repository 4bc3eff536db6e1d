//! Record log trait definition.

use crate::error::StorageResult;

/// An append-only log of opaque records.
///
/// # Invariants
///
/// - `append` makes the record visible to `read_all` immediately
/// - `read_all` returns records in append order, never a torn record
/// - `replace_all` is atomic: readers see either the old or the new log
/// - `sync` ensures every appended record survives process termination
///
/// # Implementors
///
/// - [`super::MemoryRecordLog`] - For testing
/// - [`super::FileRecordLog`] - For persistent storage
pub trait RecordLog: Send + Sync {
    /// Appends one record and returns the byte offset of its frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is too large or an I/O error occurs.
    fn append(&mut self, payload: &[u8]) -> StorageResult<u64>;

    /// Reads every intact record in append order.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is corrupted before its final frame.
    fn read_all(&self) -> StorageResult<Vec<Vec<u8>>>;

    /// Atomically replaces the whole log with `records`.
    ///
    /// Used for compaction: a journal writes a snapshot of its state as a
    /// short list of records and drops the history.
    ///
    /// # Errors
    ///
    /// Returns an error if the replacement cannot be written.
    fn replace_all(&mut self, records: &[Vec<u8>]) -> StorageResult<()>;

    /// Flushes data and metadata to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current size of the log in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;
}
