//! Shared fixtures for registry integration tests
//!
//! `RecordingMounter` stands in for sshfs: it records every attach and
//! detach, can be told to fail, and can leave files behind in the mount
//! point to simulate a detach that did not really empty the directory.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::Notify;

use sshfs_volume::config::Scope;
use sshfs_volume::mounter::Mounter;
use sshfs_volume::options::MountSpec;
use sshfs_volume::registry::{RegistryConfig, VolumeRegistry};
use sshfs_volume::{Result, VolumeError};

/// One call made to the mounter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Attach { spec: MountSpec, mount_point: PathBuf },
    Detach { mount_point: PathBuf },
}

#[derive(Default)]
pub struct RecordingMounter {
    calls: Mutex<Vec<Call>>,
    fail_attach: AtomicBool,
    fail_detach: AtomicBool,
    leave_residue: AtomicBool,
    /// When set, attaches of targets containing "slow" wait for a notification
    gate: Option<Arc<Notify>>,
}

impl RecordingMounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn gated(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(gate),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn attaches(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Attach { .. }))
            .count()
    }

    pub fn detaches(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Detach { .. }))
            .count()
    }

    pub fn fail_attach(&self, fail: bool) {
        self.fail_attach.store(fail, Ordering::SeqCst);
    }

    pub fn fail_detach(&self, fail: bool) {
        self.fail_detach.store(fail, Ordering::SeqCst);
    }

    pub fn leave_residue(&self, leave: bool) {
        self.leave_residue.store(leave, Ordering::SeqCst);
    }
}

#[async_trait]
impl Mounter for RecordingMounter {
    async fn attach(&self, spec: &MountSpec, mount_point: &Path) -> Result<()> {
        if let Some(gate) = &self.gate {
            if spec.target.contains("slow") {
                gate.notified().await;
            }
        }

        self.calls.lock().push(Call::Attach {
            spec: spec.clone(),
            mount_point: mount_point.to_path_buf(),
        });

        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(VolumeError::MountExecution(
                "sshfs command failed exit status: 1 (read: Connection reset by peer)".to_string(),
            ));
        }
        Ok(())
    }

    async fn detach(&self, mount_point: &Path) -> Result<()> {
        self.calls.lock().push(Call::Detach {
            mount_point: mount_point.to_path_buf(),
        });

        if self.fail_detach.load(Ordering::SeqCst) {
            return Err(VolumeError::MountExecution(format!(
                "umount: {}: target is busy",
                mount_point.display()
            )));
        }

        if self.leave_residue.load(Ordering::SeqCst) {
            std::fs::write(mount_point.join("leftover"), b"still here")?;
        }
        Ok(())
    }
}

/// A registry rooted in a temporary directory
pub struct Fixture {
    pub dir: TempDir,
    pub mounter: Arc<RecordingMounter>,
    pub registry: VolumeRegistry,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_mounter(RecordingMounter::new())
    }

    pub fn with_mounter(mounter: Arc<RecordingMounter>) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let registry = open_registry(dir.path(), mounter.clone());
        Self {
            dir,
            mounter,
            registry,
        }
    }

    /// Open a second registry over the same directory, as after a restart
    pub fn reopen(&self) -> VolumeRegistry {
        open_registry(self.dir.path(), RecordingMounter::new())
    }

    pub fn volumes_dir(&self) -> PathBuf {
        self.dir.path().join("volumes")
    }

    pub fn state_file(&self) -> PathBuf {
        self.dir.path().join("state").join("sshfs-state.json")
    }
}

pub fn registry_config(root: &Path) -> RegistryConfig {
    RegistryConfig {
        volumes_dir: root.join("volumes"),
        state_file: root.join("state").join("sshfs-state.json"),
        scope: Scope::Global,
    }
}

pub fn open_registry(root: &Path, mounter: Arc<RecordingMounter>) -> VolumeRegistry {
    VolumeRegistry::open(registry_config(root), mounter).expect("open registry")
}

/// Build an ordered option map
pub fn opts(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

pub fn password_opts() -> IndexMap<String, String> {
    opts(&[("target", "user@host:/data"), ("password", "secret")])
}
