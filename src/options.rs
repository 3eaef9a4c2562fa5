//! Volume option validation
//!
//! Docker hands us the `-o key=value` pairs of `docker volume create` as an
//! untyped map. This module turns that map into a [`MountSpec`]: a handful
//! of recognized keys select the remote endpoint and the credential, and
//! everything else is kept, in order, as a pass-through sshfs `-o` option.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VolumeError};

/// Remote endpoint, `user@host:/path`
pub const KEY_TARGET: &str = "target";
/// Inline password, delivered to sshfs on stdin
pub const KEY_PASSWORD: &str = "password";
/// SSH port, passed through verbatim
pub const KEY_PORT: &str = "port";
/// Path to an externally managed private key
pub const KEY_IDENTITY_FILE: &str = "identity-file";
/// Private key material owned by the volume
pub const KEY_INLINE_KEY: &str = "inline-key";

/// Suffix appended to the mount point to build the path of an inline key
pub const INLINE_KEY_SUFFIX: &str = "_id_rsa";

/// How the volume authenticates against the remote host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum Credential {
    /// Secret written to sshfs' standard input
    Password { password: String },
    /// Private key on disk. `ephemeral` keys were written by this driver
    /// and are deleted together with the volume.
    IdentityFile { path: PathBuf, ephemeral: bool },
}

impl Credential {
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, Credential::IdentityFile { ephemeral: true, .. })
    }

    /// Path of the key file, if this credential uses one
    pub fn identity_file(&self) -> Option<&Path> {
        match self {
            Credential::IdentityFile { path, .. } => Some(path),
            Credential::Password { .. } => None,
        }
    }
}

/// Everything needed to reproduce the sshfs invocation for a volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    pub credential: Credential,
    /// Pass-through `-o` options in the order they were supplied
    #[serde(default)]
    pub options: Vec<String>,
}

/// Result of validating a Create request
#[derive(Debug, Clone)]
pub struct ParsedOptions {
    pub spec: MountSpec,
    /// Key material still to be written to `spec.credential`'s path
    pub inline_key: Option<String>,
}

/// Path at which the inline key of the volume mounted at `mount_point` lives.
///
/// The key sits next to the mount point rather than inside it, so it is
/// neither hidden by the mount nor counted by the post-detach emptiness check.
pub fn inline_key_path(mount_point: &Path) -> PathBuf {
    let mut raw = mount_point.as_os_str().to_owned();
    raw.push(INLINE_KEY_SUFFIX);
    PathBuf::from(raw)
}

/// Validate the option map of a Create request.
///
/// Empty values of recognized keys count as unset.
pub fn parse_options(mount_point: &Path, options: &IndexMap<String, String>) -> Result<ParsedOptions> {
    let mut target: Option<&str> = None;
    let mut password: Option<&str> = None;
    let mut port: Option<&str> = None;
    let mut identity_file: Option<&str> = None;
    let mut inline_key: Option<&str> = None;
    let mut passthrough = Vec::new();

    for (key, value) in options {
        let value = value.as_str();
        let slot = match key.as_str() {
            KEY_TARGET => &mut target,
            KEY_PASSWORD => &mut password,
            KEY_PORT => &mut port,
            KEY_IDENTITY_FILE => &mut identity_file,
            KEY_INLINE_KEY => &mut inline_key,
            _ => {
                if value.is_empty() {
                    passthrough.push(key.clone());
                } else {
                    passthrough.push(format!("{}={}", key, value));
                }
                continue;
            }
        };
        *slot = Some(value).filter(|v| !v.is_empty());
    }

    let target = target.ok_or_else(|| {
        VolumeError::Validation(format!("'{}' option required", KEY_TARGET))
    })?;

    if password.is_some() && (identity_file.is_some() || inline_key.is_some()) {
        return Err(VolumeError::Validation(format!(
            "'{}' and '{}'/'{}' options are mutually exclusive",
            KEY_PASSWORD, KEY_IDENTITY_FILE, KEY_INLINE_KEY
        )));
    }

    if identity_file.is_some() && inline_key.is_some() {
        return Err(VolumeError::Validation(format!(
            "'{}' and '{}' options are mutually exclusive",
            KEY_IDENTITY_FILE, KEY_INLINE_KEY
        )));
    }

    let credential = match (password, identity_file, inline_key) {
        (Some(password), None, None) => Credential::Password {
            password: password.to_string(),
        },
        (None, Some(path), None) => Credential::IdentityFile {
            path: PathBuf::from(path),
            ephemeral: false,
        },
        (None, None, Some(_)) => Credential::IdentityFile {
            path: inline_key_path(mount_point),
            ephemeral: true,
        },
        _ => {
            return Err(VolumeError::Validation(format!(
                "either '{}', '{}' or '{}' option must be set",
                KEY_PASSWORD, KEY_IDENTITY_FILE, KEY_INLINE_KEY
            )))
        }
    };

    Ok(ParsedOptions {
        spec: MountSpec {
            target: target.to_string(),
            port: port.map(str::to_string),
            credential,
            options: passthrough,
        },
        inline_key: inline_key.map(str::to_string),
    })
}
