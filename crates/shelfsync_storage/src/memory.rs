//! In-memory record log for testing.

use crate::error::StorageResult;
use crate::frame::{decode_frames, encode_frame};
use crate::log::RecordLog;
use parking_lot::RwLock;

/// An in-memory record log.
///
/// Stores the framed bytes exactly as [`super::FileRecordLog`] would write
/// them, so recovery behaviour can be exercised without touching disk.
///
/// # Example
///
/// ```rust
/// use shelfsync_storage::{MemoryRecordLog, RecordLog};
///
/// let mut log = MemoryRecordLog::new();
/// assert_eq!(log.append(b"a").unwrap(), 0);
/// assert_eq!(log.read_all().unwrap().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct MemoryRecordLog {
    data: RwLock<Vec<u8>>,
}

impl MemoryRecordLog {
    /// Creates a new empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a log over pre-existing framed bytes.
    ///
    /// A torn trailing frame is cut off, as on a file reopen.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are corrupted before the final frame.
    pub fn with_data(data: Vec<u8>) -> StorageResult<Self> {
        let decoded = decode_frames(&data)?;
        let mut data = data;
        data.truncate(decoded.valid_len as usize);
        Ok(Self {
            data: RwLock::new(data),
        })
    }

    /// Returns a copy of the raw framed bytes.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl RecordLog for MemoryRecordLog {
    fn append(&mut self, payload: &[u8]) -> StorageResult<u64> {
        let frame = encode_frame(payload)?;
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(&frame);
        Ok(offset)
    }

    fn read_all(&self) -> StorageResult<Vec<Vec<u8>>> {
        Ok(decode_frames(&self.data.read())?.records)
    }

    fn replace_all(&mut self, records: &[Vec<u8>]) -> StorageResult<()> {
        let mut fresh = Vec::new();
        for record in records {
            fresh.extend_from_slice(&encode_frame(record)?);
        }
        *self.data.write() = fresh;
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.data.read().len() as u64)
    }
}
