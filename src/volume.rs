//! Volume records

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VolumeError};
use crate::options::{Credential, MountSpec, INLINE_KEY_SUFFIX};

/// A registered volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub mount_point: PathBuf,
    pub created_at: DateTime<Utc>,
    /// Number of containers currently using the mount; zero means detached
    pub ref_count: u32,
    #[serde(flatten)]
    pub spec: MountSpec,
}

impl Volume {
    pub fn new(name: String, mount_point: PathBuf, spec: MountSpec) -> Self {
        Self {
            name,
            mount_point,
            created_at: Utc::now(),
            ref_count: 0,
            spec,
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.ref_count > 0
    }

    pub fn credential(&self) -> &Credential {
        &self.spec.credential
    }

    /// Whether the key file belongs to this volume and dies with it
    pub fn is_ephemeral(&self) -> bool {
        self.spec.credential.is_ephemeral()
    }

    pub fn info(&self) -> VolumeInfo {
        VolumeInfo {
            name: self.name.clone(),
            mount_point: self.mount_point.clone(),
            created_at: self.created_at,
        }
    }
}

/// Read-only view of a volume handed out by List and Get
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub mount_point: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl VolumeInfo {
    /// Creation time as RFC 3339 with nanoseconds, e.g. `2024-05-01T10:00:00.000000001Z`
    pub fn created_at_rfc3339(&self) -> String {
        self.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true)
    }
}

/// Check that `name` can be used as a single path component below the
/// volumes directory.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(VolumeError::Validation("volume name cannot be empty".to_string()));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(VolumeError::Validation(format!(
            "invalid volume name {:?}",
            name
        )));
    }
    // Reserved for the inline key of the volume without the suffix
    if name.ends_with(INLINE_KEY_SUFFIX) {
        return Err(VolumeError::Validation(format!(
            "volume name {:?} must not end in {:?}",
            name, INLINE_KEY_SUFFIX
        )));
    }
    Ok(())
}

/// Mount point of volume `name` under `volumes_dir`
pub fn mount_point_for(volumes_dir: &Path, name: &str) -> PathBuf {
    volumes_dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> MountSpec {
        MountSpec {
            target: "user@host:/data".to_string(),
            port: Some("22".to_string()),
            credential: Credential::IdentityFile {
                path: PathBuf::from("/mnt/volumes/v_id_rsa"),
                ephemeral: true,
            },
            options: vec!["reconnect".to_string()],
        }
    }

    #[test]
    fn test_new_volume_is_detached() {
        let vol = Volume::new("v".into(), PathBuf::from("/mnt/volumes/v"), spec());
        assert_eq!(vol.ref_count, 0);
        assert!(!vol.is_mounted());
        assert!(vol.is_ephemeral());
    }

    #[test]
    fn test_record_is_flat() {
        let vol = Volume::new("v".into(), PathBuf::from("/mnt/volumes/v"), spec());
        let json = serde_json::to_value(&vol).unwrap();

        for field in ["name", "mount_point", "created_at", "ref_count", "target", "port", "options", "credential"] {
            assert!(json.get(field).is_some(), "missing field {}", field);
        }
        assert_eq!(json["credential"]["ephemeral"], true);
    }

    #[test]
    fn test_name_rules() {
        assert!(validate_name("backup").is_ok());
        assert!(validate_name("my.vol-1_x").is_ok());
        for bad in ["", ".", "..", "a/b", "/abs", "nul\0", "backup_id_rsa"] {
            assert!(
                matches!(validate_name(bad), Err(VolumeError::Validation(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_created_at_format() {
        let vol = Volume::new("v".into(), PathBuf::from("/mnt/volumes/v"), spec());
        let shown = vol.info().created_at_rfc3339();
        assert!(shown.ends_with('Z'));
        assert_eq!(
            DateTime::parse_from_rfc3339(&shown).unwrap().with_timezone(&Utc),
            vol.created_at
        );
    }
}
