//! Configuration parsing and structures

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::env;

/// Default base path inside the plugin's rootfs
pub const DEFAULT_BASE_PATH: &str = "/mnt";

/// Default plugin socket path
pub const DEFAULT_SOCKET: &str = "/run/docker/plugins/sshfs.sock";

/// Name of the snapshot file inside the state directory
pub const STATE_FILE_NAME: &str = "sshfs-state.json";

// =============================================================================
// Raw Config (Deserialized from YAML)
// =============================================================================

/// Raw configuration as deserialized from YAML.
/// Every field is optional; `resolve()` fills in the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Directory holding `volumes/` and `state/`
    pub base_path: Option<PathBuf>,

    /// Unix socket the plugin API listens on
    pub socket: Option<PathBuf>,

    /// Scope reported by `Capabilities`
    pub scope: Option<Scope>,

    /// Program used to attach volumes
    pub sshfs_command: Option<String>,

    /// Program used to detach volumes
    pub umount_command: Option<String>,

    /// Upper bound on a single sshfs invocation (e.g. "30s")
    #[serde(default, with = "humantime_serde")]
    pub mount_timeout: Option<Duration>,
}

// =============================================================================
// Resolved Config (Ready for use)
// =============================================================================

/// Top-level configuration (resolved from RawConfig)
#[derive(Debug, Clone)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Directory holding `volumes/` and `state/`
    pub base_path: PathBuf,

    /// Unix socket the plugin API listens on
    pub socket: PathBuf,

    /// Scope reported by `Capabilities`
    pub scope: Scope,

    /// How the sshfs and umount programs are invoked
    pub mounter: MounterConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Whether the container runtime may use a volume from several hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Volume names are cluster-wide
    #[default]
    Global,
    /// Volume names are host-local
    Local,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Local => "local",
        }
    }
}

/// Settings for the sshfs mounter
#[derive(Debug, Clone)]
pub struct MounterConfig {
    pub sshfs_command: String,
    pub umount_command: String,
    pub timeout: Option<Duration>,
}

impl Default for MounterConfig {
    fn default() -> Self {
        Self {
            sshfs_command: "sshfs".to_string(),
            umount_command: "umount".to_string(),
            timeout: None,
        }
    }
}

// =============================================================================
// Resolution Logic
// =============================================================================

impl RawConfig {
    /// Resolve raw config into final config by applying defaults
    pub fn resolve(self) -> Config {
        let defaults = MounterConfig::default();

        Config {
            logging: self.logging,
            base_path: self
                .base_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_PATH)),
            socket: self.socket.unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET)),
            scope: self.scope.unwrap_or_default(),
            mounter: MounterConfig {
                sshfs_command: self.sshfs_command.unwrap_or(defaults.sshfs_command),
                umount_command: self.umount_command.unwrap_or(defaults.umount_command),
                timeout: self.mount_timeout,
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        RawConfig::default().resolve()
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string, expanding `${VAR}` references first
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let expanded = env::expand(content)?;
        // An empty document means "all defaults"
        if expanded.trim().is_empty() {
            return Ok(Self::default());
        }
        let raw: RawConfig =
            serde_yaml::from_str(&expanded).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        Ok(raw.resolve())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.base_path.is_absolute() {
            return Err(ConfigError::ValidationError(format!(
                "base_path must be absolute: {:?}",
                self.base_path
            )));
        }

        if self.socket.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "socket path cannot be empty".to_string(),
            ));
        }

        if self.mounter.sshfs_command.trim().is_empty()
            || self.mounter.umount_command.trim().is_empty()
        {
            return Err(ConfigError::ValidationError(
                "sshfs_command and umount_command cannot be empty".to_string(),
            ));
        }

        if self.mounter.timeout == Some(Duration::ZERO) {
            return Err(ConfigError::ValidationError(
                "mount_timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Directory under which per-volume mount points are created
    pub fn volumes_dir(&self) -> PathBuf {
        self.base_path.join("volumes")
    }

    /// Location of the persisted volume table
    pub fn state_file(&self) -> PathBuf {
        self.base_path.join("state").join(STATE_FILE_NAME)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
