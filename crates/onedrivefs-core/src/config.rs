//! Typed configuration for every onedrivefs binary (SPEC_FULL §10.3).
//!
//! Provides a `Config` struct that maps to the YAML configuration file,
//! with loading, validation, defaults, and a builder for programmatic use
//! (primarily for tests). The configuration file loader itself is treated
//! as an ambient concern carried regardless of §1's Non-goals — every
//! binary needs a typed, validated way to read its settings, even though
//! most of the surfaces it parametrizes (the GUI, systemd units) are out
//! of scope.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub sync: SyncConfig,
    pub rate_limiting: RateLimitingConfig,
    pub large_files: LargeFilesConfig,
    pub logging: LoggingConfig,
    pub auth: AuthConfig,
    pub fuse: FuseConfig,
}

/// Delta-loop timing (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between delta polls while online.
    pub poll_interval_secs: u64,
    /// Seconds between delta polls while offline and retrying.
    pub offline_retry_interval_secs: u64,
}

/// Microsoft Graph API rate-limiting settings, consumed by the remote
/// client's adaptive limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    pub delta_requests_per_minute: u32,
    pub upload_concurrent: u32,
    pub upload_requests_per_minute: u32,
    pub download_concurrent: u32,
    pub metadata_requests_per_minute: u32,
}

/// Large-file upload / chunking settings (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LargeFilesConfig {
    /// Files at or above this size (in MiB) use the chunked protocol.
    pub threshold_mb: u64,
    /// Size of each upload chunk (in MiB).
    pub chunk_size_mb: u64,
    /// Maximum in-flight upload sessions (§4.4: five).
    pub max_concurrent_uploads: u32,
}

/// Logging / tracing settings (§10.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON-formatted log lines instead of human-readable ones.
    pub json: bool,
}

/// Authentication settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Azure AD Application (client) ID.
    pub app_id: Option<String>,
    pub scopes: Vec<String>,
}

/// Mount and cache settings (§4.3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuseConfig {
    /// Directory where the filesystem is mounted.
    pub mount_point: PathBuf,
    /// Directory holding the persistent store database file.
    pub cache_dir: PathBuf,
    /// Soft cap on the content bucket's on-disk size, in gigabytes.
    pub cache_max_size_gb: u32,
}

impl Config {
    /// Loads configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Tries to load from `path`; falls back to [`Config::default`] on any
    /// error (missing file on first run, malformed YAML).
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file,
    /// typically `$XDG_CONFIG_HOME/onedrivefs/config.yaml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("onedrivefs")
            .join("config.yaml")
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            offline_retry_interval_secs: 2,
        }
    }
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            delta_requests_per_minute: 10,
            upload_concurrent: 5,
            upload_requests_per_minute: 60,
            download_concurrent: 8,
            metadata_requests_per_minute: 100,
        }
    }
}

impl Default for LargeFilesConfig {
    fn default() -> Self {
        Self {
            threshold_mb: 4,
            chunk_size_mb: 10,
            max_concurrent_uploads: 5,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for FuseConfig {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("~/.cache"))
            .join("onedrivefs");
        Self {
            mount_point: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("OneDrive"),
            cache_dir,
            cache_max_size_gb: 10,
        }
    }
}

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.poll_interval_secs"`.
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validates the configuration and returns all errors found. An empty
    /// vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.sync.poll_interval_secs == 0 {
            errors.push(ValidationError {
                field: "sync.poll_interval_secs".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.sync.offline_retry_interval_secs == 0 {
            errors.push(ValidationError {
                field: "sync.offline_retry_interval_secs".into(),
                message: "must be greater than 0".into(),
            });
        }

        if self.rate_limiting.delta_requests_per_minute == 0 {
            errors.push(ValidationError {
                field: "rate_limiting.delta_requests_per_minute".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.rate_limiting.upload_concurrent == 0 {
            errors.push(ValidationError {
                field: "rate_limiting.upload_concurrent".into(),
                message: "must be greater than 0".into(),
            });
        }

        if self.large_files.chunk_size_mb == 0 || self.large_files.threshold_mb == 0 {
            errors.push(ValidationError {
                field: "large_files".into(),
                message: "threshold_mb and chunk_size_mb must be greater than 0".into(),
            });
        }
        if self.large_files.max_concurrent_uploads == 0 {
            errors.push(ValidationError {
                field: "large_files.max_concurrent_uploads".into(),
                message: "must be greater than 0".into(),
            });
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        if self.fuse.cache_max_size_gb == 0 {
            errors.push(ValidationError {
                field: "fuse.cache_max_size_gb".into(),
                message: "must be greater than 0".into(),
            });
        }

        errors
    }
}

/// Builder for constructing a [`Config`] programmatically, primarily for
/// tests that only want to override a couple of fields.
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn mount_point(mut self, path: PathBuf) -> Self {
        self.config.fuse.mount_point = path;
        self
    }

    pub fn cache_dir(mut self, path: PathBuf) -> Self {
        self.config.fuse.cache_dir = path;
        self
    }

    pub fn poll_interval_secs(mut self, secs: u64) -> Self {
        self.config.sync.poll_interval_secs = secs;
        self
    }

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
