//! File-backed record log for persistent state.

use crate::error::StorageResult;
use crate::frame::{decode_frames, encode_frame};
use crate::log::RecordLog;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A file-backed record log.
///
/// # Durability
///
/// - every `append` writes one whole frame and flushes it to the OS
/// - with `sync_on_append`, every append is also `sync_all`ed
/// - `replace_all` writes a sibling `.tmp` file, syncs it and renames it
///   over the log
///
/// A torn trailing frame left by a crash is truncated when the log is
/// opened.
///
/// # Example
///
/// ```no_run
/// use shelfsync_storage::{FileRecordLog, RecordLog};
/// use std::path::Path;
///
/// let mut log = FileRecordLog::open(Path::new("journal.log")).unwrap();
/// log.append(b"state change").unwrap();
/// log.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileRecordLog {
    path: PathBuf,
    file: Mutex<File>,
    size: u64,
    recovered_bytes: u64,
    sync_on_append: bool,
}

impl FileRecordLog {
    /// Opens or creates a record log at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, or if it is corrupted
    /// before its final frame.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        let decoded = decode_frames(&bytes)?;

        let total = bytes.len() as u64;
        let recovered_bytes = total - decoded.valid_len;
        if recovered_bytes > 0 {
            file.set_len(decoded.valid_len)?;
            file.sync_all()?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            size: decoded.valid_len,
            recovered_bytes,
            sync_on_append: false,
        })
    }

    /// Opens or creates a record log, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot
    /// be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Makes every append call `sync_all` before returning.
    #[must_use]
    pub fn with_sync_on_append(mut self, enabled: bool) -> Self {
        self.sync_on_append = enabled;
        self
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of torn bytes discarded when the log was opened.
    #[must_use]
    pub fn recovered_bytes(&self) -> u64 {
        self.recovered_bytes
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

impl RecordLog for FileRecordLog {
    fn append(&mut self, payload: &[u8]) -> StorageResult<u64> {
        let frame = encode_frame(payload)?;
        let mut file = self.file.lock();

        let offset = self.size;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&frame)?;
        file.flush()?;
        if self.sync_on_append {
            file.sync_all()?;
        }
        self.size += frame.len() as u64;

        Ok(offset)
    }

    fn read_all(&self) -> StorageResult<Vec<Vec<u8>>> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;

        let mut bytes = Vec::with_capacity(self.size as usize);
        file.read_to_end(&mut bytes)?;
        bytes.truncate(self.size as usize);

        Ok(decode_frames(&bytes)?.records)
    }

    fn replace_all(&mut self, records: &[Vec<u8>]) -> StorageResult<()> {
        let tmp_path = self.tmp_path();
        let mut size = 0u64;
        {
            let mut tmp = File::create(&tmp_path)?;
            for record in records {
                let frame = encode_frame(record)?;
                tmp.write_all(&frame)?;
                size += frame.len() as u64;
            }
            tmp.sync_all()?;
        }

        let mut file = self.file.lock();
        fs::rename(&tmp_path, &self.path)?;
        *file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.size = size;

        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.size)
    }
}
