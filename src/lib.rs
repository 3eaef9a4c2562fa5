//! sshfs-volume: a Docker volume plugin for sshfs mounts
//!
//! Volumes are named, refcounted handles on remote directories reached over
//! SSH. Creating a volume only records it; the remote filesystem is attached
//! when the first container mounts it and detached when the last one leaves.
//!
//! # Architecture
//!
//! - **Options**: validates the `-o key=value` pairs of `docker volume create`
//!   into a typed [`options::MountSpec`].
//! - **Credentials**: writes and deletes inline private keys owned by a volume.
//! - **Mounter**: the seam to the outside world; `SshfsMounter` builds and runs
//!   the sshfs / umount command lines.
//! - **Registry**: the volume table and its Create/Mount/Unmount/Remove state
//!   machine, persisted after every change by the state module.
//! - **Plugin**: the Docker plugin protocol served over a unix socket.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sshfs_volume::config::Config;
//! use sshfs_volume::mounter::SshfsMounter;
//! use sshfs_volume::registry::{RegistryConfig, VolumeRegistry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let mounter = Arc::new(SshfsMounter::new(config.mounter.clone()));
//! let registry = VolumeRegistry::open(RegistryConfig::from(&config), mounter)?;
//!
//! let path = registry.mount("backup").await?;
//! println!("backup is mounted at {:?}", path);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod credential;
pub mod env;
pub mod error;
pub mod mounter;
pub mod options;
pub mod plugin;
pub mod registry;
pub mod state;
pub mod volume;

pub use error::{Result, VolumeError};
