//! Durable snapshot of the volume table
//!
//! The whole table is rewritten as one JSON object keyed by volume name.
//! Writes go to a temporary file that is renamed over the snapshot, so a
//! crash never leaves a half-written table behind. The snapshot holds
//! passwords in the clear; the file is created `0600` inside a `0700`
//! directory so it is no more exposed than the key files themselves.

use std::collections::BTreeMap;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::credential::KEY_FILE_MODE;
use crate::error::{Result, VolumeError};
use crate::volume::Volume;

/// Permissions for driver-owned directories (rwx------)
pub const DIR_MODE: u32 = 0o700;

/// The volume table as persisted
pub type Snapshot = BTreeMap<String, Volume>;

/// Reads and writes the snapshot file
pub struct StatePersister {
    path: PathBuf,
    /// Serializes writers so snapshots land in the order they were taken
    write_lock: Mutex<()>,
}

impl StatePersister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last snapshot. A missing file means first start and yields
    /// an empty table; anything unreadable is an error.
    pub fn load(&self) -> Result<Snapshot> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No state found at {:?}", self.path);
                return Ok(Snapshot::new());
            }
            Err(e) => {
                return Err(VolumeError::Persistence(format!(
                    "failed to read state {:?}: {}",
                    self.path, e
                )))
            }
        };

        let snapshot: Snapshot = serde_json::from_slice(&data).map_err(|e| {
            VolumeError::Persistence(format!("failed to parse state {:?}: {}", self.path, e))
        })?;

        for (key, volume) in &snapshot {
            if key != &volume.name {
                return Err(VolumeError::Persistence(format!(
                    "state {:?} is inconsistent: entry {:?} holds volume {:?}",
                    self.path, key, volume.name
                )));
            }
        }

        info!("Loaded {} volume(s) from {:?}", snapshot.len(), self.path);
        Ok(snapshot)
    }

    /// Write a snapshot produced by `take`, which runs under the writer lock
    /// so the snapshot written last is also the one taken last.
    pub fn save_with<F>(&self, take: F) -> Result<()>
    where
        F: FnOnce() -> Snapshot,
    {
        let _guard = self.write_lock.lock();
        let snapshot = take();
        self.write(&snapshot)
    }

    /// Write `snapshot` to disk
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.write(snapshot)
    }

    fn write(&self, snapshot: &Snapshot) -> Result<()> {
        let data = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| VolumeError::Persistence(format!("failed to encode state: {}", e)))?;

        let persist_err = |e: io::Error| {
            VolumeError::Persistence(format!("failed to write state {:?}: {}", self.path, e))
        };

        if let Some(parent) = self.path.parent() {
            DirBuilder::new()
                .recursive(true)
                .mode(DIR_MODE)
                .create(parent)
                .map_err(persist_err)?;
        }

        let tmp = self.tmp_path();
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(KEY_FILE_MODE)
            .open(&tmp)
            .map_err(persist_err)?;
        file.write_all(&data).map_err(persist_err)?;
        file.sync_all().map_err(persist_err)?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(persist_err)?;
        debug!("Saved {} volume(s) to {:?}", snapshot.len(), self.path);
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut raw = self.path.as_os_str().to_owned();
        raw.push(".tmp");
        PathBuf::from(raw)
    }
}
