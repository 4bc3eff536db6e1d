//! Opening the on-disk library and wiring up the engine.

use crate::error::{CliError, CliResult};
use crate::http::ReqwestClient;
use fs2::FileExt;
use shelfsync_engine::{
    Clock, HttpRemoteStore, JsonLocalStore, RemoteConfig, SyncConfig, SyncJournal, SyncProcessor,
    SystemClock,
};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// The remote store used by the CLI.
pub type Remote = HttpRemoteStore<ReqwestClient>;

const LOCK_FILE: &str = "LOCK";

/// The local library and sync journal under one data directory.
///
/// Holds an exclusive lock on the directory for as long as it lives, so
/// only one process edits or syncs a library at a time.
pub struct Workspace {
    /// Data directory.
    pub dir: PathBuf,
    /// Sync queue and cursors.
    pub journal: Arc<SyncJournal>,
    /// Local library.
    pub store: Arc<JsonLocalStore>,
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
    _lock: File,
}

impl Workspace {
    /// Opens (or creates) the data directory.
    pub fn open(dir: &Path) -> CliResult<Self> {
        std::fs::create_dir_all(dir)?;
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        if lock.try_lock_exclusive().is_err() {
            return Err(CliError::Locked(dir.to_path_buf()));
        }

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let journal = Arc::new(SyncJournal::open(&dir.join("sync.journal"))?);
        let store = Arc::new(JsonLocalStore::open(
            &dir.join("library.json"),
            journal.clone(),
            clock.clone(),
        )?);
        debug!(dir = %dir.display(), "opened workspace");

        Ok(Self {
            dir: dir.to_path_buf(),
            journal,
            store,
            clock,
            _lock: lock,
        })
    }

    /// Builds a processor talking to the remote configured in the
    /// environment. Reading logs are synced only when their collection is
    /// configured.
    pub fn processor(&self) -> CliResult<SyncProcessor<JsonLocalStore, Remote>> {
        let remote_config = RemoteConfig::from_env()?;
        let sync_config = SyncConfig::from_env()?.with_kinds(remote_config.configured_kinds());
        sync_config.validate()?;

        let client = ReqwestClient::new(remote_config.timeout)?;
        let remote = HttpRemoteStore::new(remote_config, client, self.clock.clone())
            .with_page_size(sync_config.page_size);

        Ok(SyncProcessor::new(
            sync_config,
            self.store.clone(),
            Arc::new(remote),
            self.journal.clone(),
            self.clock.clone(),
        ))
    }
}
