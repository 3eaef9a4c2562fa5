//! Snapshot persistence tests
//!
//! The registry must come back after a restart with the same volume table it
//! had before, minus references on mounts that did not survive the restart.

mod common;

use std::fs;
use std::os::unix::fs::PermissionsExt;

use common::*;
use sshfs_volume::registry::VolumeRegistry;
use sshfs_volume::state::StatePersister;
use sshfs_volume::VolumeError;

#[tokio::test]
async fn test_round_trip_through_snapshot() {
    let fx = Fixture::new();

    fx.registry
        .create(
            "ordered",
            &opts(&[
                ("reconnect", ""),
                ("target", "user@host:/data"),
                ("ServerAliveInterval", "15"),
                ("port", "2222"),
                ("inline-key", "KEY"),
                ("cache", "no"),
            ]),
        )
        .await
        .unwrap();
    fx.registry.create("plain", &password_opts()).await.unwrap();
    fx.registry.create("gone", &password_opts()).await.unwrap();
    fx.registry.mount("plain").await.unwrap();
    fx.registry.mount("plain").await.unwrap();
    fx.registry.remove("gone").await.unwrap();

    // Read the snapshot exactly as written, before any reconciliation
    let on_disk = StatePersister::new(fx.state_file()).load().unwrap();
    let live: Vec<_> = fx.registry.list().into_iter().map(|v| v.name).collect();
    assert_eq!(on_disk.keys().cloned().collect::<Vec<_>>(), live);

    for name in ["ordered", "plain"] {
        assert_eq!(on_disk[name], fx.registry.inspect(name).unwrap(), "{}", name);
    }
    assert_eq!(on_disk["plain"].ref_count, 2);
    assert_eq!(
        on_disk["ordered"].spec.options,
        vec!["reconnect", "ServerAliveInterval=15", "cache=no"]
    );
    assert_eq!(on_disk["ordered"].spec.port.as_deref(), Some("2222"));
    assert!(on_disk["ordered"].is_ephemeral());
    assert!(!on_disk.contains_key("gone"));
}

#[tokio::test]
async fn test_reopen_restores_table() {
    let fx = Fixture::new();
    fx.registry.create("a", &password_opts()).await.unwrap();
    fx.registry.create("b", &opts(&[("target", "h:/"), ("identity-file", "/k")])).await.unwrap();

    let restored = fx.reopen();

    for name in ["a", "b"] {
        assert_eq!(restored.inspect(name), fx.registry.inspect(name));
    }
}

#[tokio::test]
async fn test_restart_drops_references_of_vanished_mounts() {
    let fx = Fixture::new();
    fx.registry.create("v", &password_opts()).await.unwrap();
    fx.registry.mount("v").await.unwrap();
    fx.registry.mount("v").await.unwrap();

    // The recording mounter never really mounts, so after a restart the
    // mount point is a plain directory again
    let restored = fx.reopen();
    assert_eq!(restored.inspect("v").unwrap().ref_count, 0);

    // The reconciled count is written back
    let on_disk = StatePersister::new(fx.state_file()).load().unwrap();
    assert_eq!(on_disk["v"].ref_count, 0);

    // And the volume is usable again
    restored.remove("v").await.unwrap();
}

#[tokio::test]
async fn test_restart_recreates_missing_mount_point() {
    let fx = Fixture::new();
    fx.registry.create("v", &password_opts()).await.unwrap();
    let mount_point = fx.registry.path("v").unwrap();
    fs::remove_dir(&mount_point).unwrap();

    let _restored = fx.reopen();
    assert!(mount_point.is_dir());
}

#[tokio::test]
async fn test_snapshot_is_owner_only() {
    let fx = Fixture::new();
    fx.registry.create("v", &password_opts()).await.unwrap();

    let mode = fs::metadata(fx.state_file()).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o600);
}

#[test]
fn test_first_start_without_state() {
    let dir = tempfile::TempDir::new().unwrap();
    let registry = open_registry(dir.path(), RecordingMounter::new());
    assert!(registry.list().is_empty());
    assert!(!dir.path().join("state").join("sshfs-state.json").exists());
}

#[test]
fn test_corrupt_state_is_fatal() {
    let dir = tempfile::TempDir::new().unwrap();
    let state_dir = dir.path().join("state");
    fs::create_dir_all(&state_dir).unwrap();
    fs::write(state_dir.join("sshfs-state.json"), b"{\"v\": 42}").unwrap();

    let result = VolumeRegistry::open(registry_config(dir.path()), RecordingMounter::new());
    assert!(matches!(result, Err(VolumeError::Persistence(_))));
}
