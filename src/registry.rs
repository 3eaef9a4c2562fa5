//! Volume registry and mount lifecycle
//!
//! The registry owns the volume table and drives the state machine:
//!
//! - **Created**: `ref_count == 0`, mount point exists, nothing attached.
//! - **Mounted**: `ref_count > 0`, remote filesystem attached.
//!
//! The first Mount attaches, the last Unmount detaches. Every successful
//! mutation is followed by a snapshot of the whole table.
//!
//! # Locking
//!
//! The table sits behind a read/write lock that is only ever held for
//! in-memory reads and updates, so List/Get/Path never wait on sshfs.
//! Mutating operations additionally hold an async per-name lock for their
//! whole duration, external command included: at most one operation per
//! volume name is in flight, while distinct volumes proceed in parallel.

use std::collections::BTreeMap;
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::{Config, Scope};
use crate::credential::CredentialStore;
use crate::error::{Result, VolumeError};
use crate::mounter::{is_mount_point, Mounter};
use crate::options::parse_options;
use crate::state::{Snapshot, StatePersister, DIR_MODE};
use crate::volume::{mount_point_for, validate_name, Volume, VolumeInfo};

/// Where the registry keeps its files
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Parent directory of every mount point
    pub volumes_dir: PathBuf,
    /// Snapshot file
    pub state_file: PathBuf,
    /// Scope reported by `capabilities()`
    pub scope: Scope,
}

impl From<&Config> for RegistryConfig {
    fn from(config: &Config) -> Self {
        Self {
            volumes_dir: config.volumes_dir(),
            state_file: config.state_file(),
            scope: config.scope,
        }
    }
}

/// The volume registry
pub struct VolumeRegistry {
    volumes_dir: PathBuf,
    scope: Scope,
    table: RwLock<BTreeMap<String, Volume>>,
    /// Per-name operation locks, kept only for registered names. An entry
    /// is dropped once its name is gone and nobody else holds the lock, so
    /// two callers never end up holding different locks for the same name.
    op_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    mounter: Arc<dyn Mounter>,
    credentials: CredentialStore,
    persister: StatePersister,
}

impl VolumeRegistry {
    /// Open the registry: create the volumes directory, load the last
    /// snapshot and reconcile it with what is actually mounted.
    ///
    /// Fails if the snapshot exists but cannot be read; guessing the mount
    /// state of existing volumes is not safe.
    pub fn open(config: RegistryConfig, mounter: Arc<dyn Mounter>) -> Result<Self> {
        info!(
            "Opening volume registry, volumes={:?} state={:?}",
            config.volumes_dir, config.state_file
        );

        DirBuilder::new()
            .recursive(true)
            .mode(DIR_MODE)
            .create(&config.volumes_dir)?;

        let persister = StatePersister::new(config.state_file);
        let mut snapshot = persister.load()?;

        if reconcile(&mut snapshot) {
            if let Err(e) = persister.save(&snapshot) {
                error!("Failed to save reconciled state: {}", e);
            }
        }

        Ok(Self {
            volumes_dir: config.volumes_dir,
            scope: config.scope,
            table: RwLock::new(snapshot),
            op_locks: DashMap::new(),
            mounter,
            credentials: CredentialStore::new(),
            persister,
        })
    }

    /// Register a new volume.
    ///
    /// The mount point is created first; if validation or writing the inline
    /// key then fails, a directory made by this call is removed again.
    pub async fn create(&self, name: &str, options: &IndexMap<String, String>) -> Result<()> {
        validate_name(name)?;

        let exists = self.table.read().contains_key(name);
        if exists {
            return Err(VolumeError::AlreadyExists(name.to_string()));
        }

        let lock = self.op_lock(name);
        let result = {
            let _op = lock.lock().await;
            self.create_locked(name, options)
        };
        self.release_op_lock(name, lock);
        result
    }

    fn create_locked(&self, name: &str, options: &IndexMap<String, String>) -> Result<()> {
        let exists = self.table.read().contains_key(name);
        if exists {
            return Err(VolumeError::AlreadyExists(name.to_string()));
        }

        let mount_point = mount_point_for(&self.volumes_dir, name);
        let created = create_mount_point(&mount_point).map_err(|e| {
            error!(
                "Failed to create the volume mount path {:?} ({})",
                mount_point, e
            );
            e
        })?;

        let rollback = scopeguard::guard(created, |created| {
            if created {
                if let Err(e) = fs::remove_dir(&mount_point) {
                    warn!("Failed to roll back mount point {:?}: {}", mount_point, e);
                }
            }
        });

        let parsed = parse_options(&mount_point, options)?;

        if let (Some(key), Some(path)) = (&parsed.inline_key, parsed.spec.credential.identity_file())
        {
            self.credentials.write(path, key)?;
        }

        scopeguard::ScopeGuard::into_inner(rollback);

        let volume = Volume::new(name.to_string(), mount_point, parsed.spec);
        info!(
            "Created volume {} at {:?} for {}",
            name, volume.mount_point, volume.spec.target
        );
        self.table.write().insert(name.to_string(), volume);
        self.persist();
        Ok(())
    }

    /// Take a reference on the volume, attaching it on the first one.
    /// Returns the mount point.
    pub async fn mount(&self, name: &str) -> Result<PathBuf> {
        self.lookup(name)?;

        let lock = self.op_lock(name);
        let result = {
            let _op = lock.lock().await;
            self.mount_locked(name).await
        };
        self.release_op_lock(name, lock);
        result
    }

    async fn mount_locked(&self, name: &str) -> Result<PathBuf> {
        let volume = self.lookup(name)?;

        if !volume.is_mounted() {
            debug!(
                "First volume mount {} establish connection to {}",
                name, volume.spec.target
            );
            if let Err(e) = self.mounter.attach(&volume.spec, &volume.mount_point).await {
                error!("Failed to mount {}, {}", name, e);
                return Err(e);
            }
        }

        let ref_count = self.update(name, |vol| {
            vol.ref_count = vol.ref_count.saturating_add(1);
            vol.ref_count
        })?;
        debug!("Volume {} mounted, {} reference(s)", name, ref_count);

        self.persist();
        Ok(volume.mount_point)
    }

    /// Drop a reference on the volume, detaching it when none are left.
    ///
    /// The count never goes below zero, and an Unmount at zero still runs
    /// the detach. If the detach command fails the reference count is left
    /// untouched, so the bookkeeping keeps matching the attached filesystem
    /// and the caller can retry. Entries left in the mount point after a
    /// successful detach are reported, but the count stays at zero.
    pub async fn unmount(&self, name: &str) -> Result<()> {
        self.lookup(name)?;

        let lock = self.op_lock(name);
        let result = {
            let _op = lock.lock().await;
            self.unmount_locked(name).await
        };
        self.release_op_lock(name, lock);
        result
    }

    async fn unmount_locked(&self, name: &str) -> Result<()> {
        let volume = self.lookup(name)?;

        if volume.ref_count > 1 {
            let ref_count = self.update(name, |vol| {
                vol.ref_count -= 1;
                vol.ref_count
            })?;
            debug!("Volume {} still has {} reference(s)", name, ref_count);
            self.persist();
            return Ok(());
        }

        if volume.is_mounted() {
            debug!("Last reference to volume {} released, detaching", name);
        } else {
            warn!("Unmount of volume {} with no references, detaching anyway", name);
        }

        if let Err(e) = self.mounter.detach(&volume.mount_point).await {
            error!("Failed to unmount {}, {}", name, e);
            return Err(e);
        }

        self.update(name, |vol| vol.ref_count = 0)?;
        self.persist();

        verify_empty(&volume.mount_point)
    }

    /// Forget the volume, deleting its mount point and any key it owns
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.lookup(name)?;

        let lock = self.op_lock(name);
        let result = {
            let _op = lock.lock().await;
            self.remove_locked(name)
        };
        self.release_op_lock(name, lock);
        result
    }

    fn remove_locked(&self, name: &str) -> Result<()> {
        let volume = self.lookup(name)?;

        if volume.is_mounted() {
            return Err(VolumeError::Conflict(format!(
                "Can't remove volume {} because it is mounted by {} containers",
                name, volume.ref_count
            )));
        }

        // Never recurse into a live remote filesystem
        if is_mount_point(&volume.mount_point).unwrap_or(false) {
            return Err(VolumeError::Conflict(format!(
                "Can't remove volume {} because {:?} is still mounted",
                name, volume.mount_point
            )));
        }

        if volume.is_ephemeral() {
            if let Some(path) = volume.credential().identity_file() {
                self.credentials.remove(path)?;
            }
        }

        match fs::remove_dir_all(&volume.mount_point) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Mount point {:?} was already gone", volume.mount_point);
            }
            Err(e) => {
                error!(
                    "Failed to remove the volume {} mountpoint {:?} ({})",
                    name, volume.mount_point, e
                );
                return Err(e.into());
            }
        }

        self.table.write().remove(name);
        info!("Removed volume {}", name);
        self.persist();
        Ok(())
    }

    /// All registered volumes, ordered by name
    pub fn list(&self) -> Vec<VolumeInfo> {
        self.table.read().values().map(Volume::info).collect()
    }

    pub fn get(&self, name: &str) -> Result<VolumeInfo> {
        self.table
            .read()
            .get(name)
            .map(Volume::info)
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))
    }

    pub fn path(&self, name: &str) -> Result<PathBuf> {
        self.table
            .read()
            .get(name)
            .map(|vol| vol.mount_point.clone())
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))
    }

    /// Full record of a volume, credentials included
    pub fn inspect(&self, name: &str) -> Option<Volume> {
        self.table.read().get(name).cloned()
    }

    pub fn capabilities(&self) -> Scope {
        self.scope
    }

    fn op_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let entry = self.op_locks.entry(name.to_string()).or_default();
        Arc::clone(&entry)
    }

    /// Forget the lock of a name that is no longer registered, unless
    /// another caller already holds a handle on it
    fn release_op_lock(&self, name: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let registered = self.table.read().contains_key(name);
        if !registered {
            // One reference in the map, one in `lock`
            self.op_locks.remove_if(name, |_, entry| {
                Arc::ptr_eq(entry, &lock) && Arc::strong_count(entry) == 2
            });
        }
    }

    fn lookup(&self, name: &str) -> Result<Volume> {
        self.inspect(name)
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))
    }

    /// Apply `f` to the stored record of `name`
    fn update<T>(&self, name: &str, f: impl FnOnce(&mut Volume) -> T) -> Result<T> {
        let mut table = self.table.write();
        let volume = table
            .get_mut(name)
            .ok_or_else(|| VolumeError::NotFound(name.to_string()))?;
        Ok(f(volume))
    }

    /// Snapshot the table. Failures are logged and otherwise ignored; the
    /// operation that triggered the save has already taken effect.
    fn persist(&self) {
        if let Err(e) = self.persister.save_with(|| self.table.read().clone()) {
            error!("saveState failed {}", e);
        }
    }
}

/// Create `path` with owner-only permissions. Returns whether it was
/// created by this call.
fn create_mount_point(path: &Path) -> io::Result<bool> {
    match DirBuilder::new().mode(DIR_MODE).create(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(false),
        Err(e) => Err(e),
    }
}

/// After a detach the mount point must be an empty directory again
fn verify_empty(mount_point: &Path) -> Result<()> {
    let entries = fs::read_dir(mount_point)?.count();
    if entries > 0 {
        return Err(VolumeError::UnmountVerification(format!(
            "after unmount {} files still exists in {:?}",
            entries, mount_point
        )));
    }
    Ok(())
}

/// Bring a freshly loaded snapshot in line with the host. Mounts do not
/// survive a restart, so references on volumes that are no longer attached
/// are dropped. Returns whether anything changed.
fn reconcile(snapshot: &mut Snapshot) -> bool {
    let mut changed = false;

    for volume in snapshot.values_mut() {
        if !volume.mount_point.is_dir() {
            warn!(
                "Mount point {:?} of volume {} is missing, recreating it",
                volume.mount_point, volume.name
            );
            if let Err(e) = DirBuilder::new()
                .recursive(true)
                .mode(DIR_MODE)
                .create(&volume.mount_point)
            {
                error!(
                    "Failed to recreate mount point {:?}: {}",
                    volume.mount_point, e
                );
            }
        }

        if volume.ref_count > 0 && !is_mount_point(&volume.mount_point).unwrap_or(false) {
            warn!(
                "Volume {} had {} reference(s) but is no longer mounted, resetting",
                volume.name, volume.ref_count
            );
            volume.ref_count = 0;
            changed = true;
        }
    }

    changed
}
