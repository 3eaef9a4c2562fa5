//! On-disk key material for volumes created with an inline key

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use tracing::{debug, error, warn};

use crate::error::Result;

/// Permissions for key files (rw-------)
pub const KEY_FILE_MODE: u32 = 0o600;

/// Writes and deletes identity files owned by the driver
#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialStore;

impl CredentialStore {
    pub fn new() -> Self {
        Self
    }

    /// Write `key` to `path`, readable and writable by the owner only.
    ///
    /// An existing file is truncated and its mode tightened.
    pub fn write(&self, path: &Path, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing to write an empty key to {:?}", path),
            )
            .into());
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(KEY_FILE_MODE)
            .open(path)
            .map_err(|e| {
                error!("Failed to create key file at {:?}: {}", path, e);
                io::Error::new(
                    e.kind(),
                    format!("failed to create key file at {:?}: {}", path, e),
                )
            })?;

        // `mode` only applies to newly created files
        file.set_permissions(fs::Permissions::from_mode(KEY_FILE_MODE))?;
        file.write_all(key.as_bytes())?;
        file.sync_all()?;

        debug!("Wrote key file {:?}", path);
        Ok(())
    }

    /// Delete the key file at `path`. A file that is already gone is not an error.
    pub fn remove(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => {
                debug!("Removed key file {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Key file {:?} was already removed", path);
                Ok(())
            }
            Err(e) => {
                error!("Failed to remove key file {:?}: {}", path, e);
                Err(e.into())
            }
        }
    }
}
