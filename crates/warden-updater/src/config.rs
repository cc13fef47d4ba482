//! Warden configuration, read from and written to TOML.
//!
//! Defines configuration for source querying, update policy, install
//! safety settings and rollback retention. Loaded from TOML.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::eligibility::UpdatePolicy;
use crate::error::UpdateError;

/// Environment variable consulted when no release-API token is configured.
pub const GITHUB_TOKEN_ENV: &str = "WARDEN_GITHUB_TOKEN";

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Update source configuration
    #[serde(default)]
    pub sources: SourcesConfig,

    /// Pin/ignore policy
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Security configuration
    #[serde(default)]
    pub security: SecurityConfig,

    /// Rollback configuration
    #[serde(default)]
    pub rollback: RollbackConfig,

    /// Installer configuration
    #[serde(default)]
    pub install: InstallConfig,

    /// Incompatibility rule configuration
    #[serde(default)]
    pub rules: RulesConfig,

    /// Background trigger preconditions
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl UpdateConfig {
    /// Parse a TOML configuration file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        Ok(config)
    }

    /// Load from `path` if given, else from the default location if present.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, UpdateError> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => {
                let default_path = default_config_path();
                if default_path.exists() {
                    Self::load_from_file(&default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Write this configuration as TOML, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Network configuration for feeds, APIs and downloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Download timeout in seconds
    #[serde(default = "default_download_timeout")]
    pub download_timeout_seconds: u64,

    /// Largest feed, release listing or rule list read into memory
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: u64,

    /// Largest artifact streamed to disk
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,

    /// Upper bound on concurrent source queries
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_queries: usize,

    /// User agent sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout(),
            download_timeout_seconds: default_download_timeout(),
            max_document_bytes: default_max_document_bytes(),
            max_download_bytes: default_max_download_bytes(),
            max_concurrent_queries: default_max_concurrent(),
            user_agent: default_user_agent(),
        }
    }
}

impl NetworkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Update source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Release-API token (falls back to `WARDEN_GITHUB_TOKEN`)
    #[serde(default)]
    pub github_token: Option<String>,

    /// Release-API base URL
    #[serde(default = "default_github_api")]
    pub github_api_url: String,

    /// Whether to query the package manager
    #[serde(default = "default_true")]
    pub package_manager: bool,

    /// Timeout for the batched outdated listing in seconds
    #[serde(default = "default_registry_timeout")]
    pub registry_timeout_seconds: u64,

    /// Timeout for changelog summarization in seconds
    #[serde(default = "default_summary_timeout")]
    pub summary_timeout_seconds: u64,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            github_token: None,
            github_api_url: default_github_api(),
            package_manager: true,
            registry_timeout_seconds: default_registry_timeout(),
            summary_timeout_seconds: default_summary_timeout(),
        }
    }
}

impl SourcesConfig {
    /// Configured token, or the environment fallback.
    pub fn resolved_github_token(&self) -> Option<String> {
        self.github_token
            .clone()
            .or_else(|| std::env::var(GITHUB_TOKEN_ENV).ok())
            .filter(|token| !token.trim().is_empty())
    }
}

/// User policy supplied by the settings collaborator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Only install security updates in the background
    #[serde(default)]
    pub security_only: bool,

    /// Application identifier -> pinned version string
    #[serde(default)]
    pub pins: BTreeMap<String, String>,

    /// Application identifiers never updated
    #[serde(default)]
    pub ignored: BTreeSet<String>,
}

impl PolicyConfig {
    pub fn to_policy(&self) -> UpdatePolicy {
        UpdatePolicy {
            security_only: self.security_only,
            pins: self.pins.clone(),
            ignored: self.ignored.clone(),
        }
    }
}

/// Security configuration for install verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Whether to verify code signatures before staging
    #[serde(default = "default_true")]
    pub verify_code_signature: bool,

    /// Team identifier every signature must carry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_id: Option<String>,

    /// Also require a Gatekeeper (`spctl --assess`) pass
    #[serde(default)]
    pub gatekeeper_assessment: bool,

    /// Whether to clear the quarantine attribute after the swap
    #[serde(default = "default_true")]
    pub release_quarantine: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            verify_code_signature: true,
            team_id: None,
            gatekeeper_assessment: false,
            release_quarantine: true,
        }
    }
}

/// Rollback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackConfig {
    /// Maximum number of backups to retain per application
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,

    /// Backup location; unset means `<data dir>/backups`
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            max_backups: default_max_backups(),
            backup_dir: None,
        }
    }
}

impl RollbackConfig {
    /// Configured backup directory, or the platform data directory.
    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| default_data_dir().join("backups"))
    }
}

/// Installer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Staging directory (empty = system temp dir)
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    /// Timeout for ordinary tool invocations in seconds
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_seconds: u64,

    /// Timeout for package-manager upgrades in seconds
    #[serde(default = "default_package_timeout")]
    pub package_timeout_seconds: u64,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            staging_dir: None,
            tool_timeout_seconds: default_tool_timeout(),
            package_timeout_seconds: default_package_timeout(),
        }
    }
}

impl InstallConfig {
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("warden-staging"))
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_seconds)
    }

    pub fn package_timeout(&self) -> Duration {
        Duration::from_secs(self.package_timeout_seconds)
    }
}

/// Incompatibility rule configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Remote JSON document refreshing the bundled list
    #[serde(default)]
    pub remote_url: Option<String>,
}

/// Preconditions for background runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_true")]
    pub require_ac_power: bool,

    #[serde(default)]
    pub require_wifi: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            require_ac_power: true,
            require_wifi: false,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing` filter directive used when no CLI flag overrides it
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// serde defaults
fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    30
}

fn default_download_timeout() -> u64 {
    600
}

fn default_max_document_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_max_download_bytes() -> u64 {
    16 * 1024 * 1024 * 1024
}

fn default_max_concurrent() -> usize {
    8
}

fn default_user_agent() -> String {
    format!("warden-updater/{}", env!("CARGO_PKG_VERSION"))
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

fn default_registry_timeout() -> u64 {
    120
}

fn default_summary_timeout() -> u64 {
    20
}

fn default_max_backups() -> usize {
    3
}

fn default_tool_timeout() -> u64 {
    120
}

fn default_package_timeout() -> u64 {
    900
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// Default location of the configuration file.
pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.toml")
}

/// Platform-appropriate data directory.
pub fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("Warden");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(data_home).join("warden");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("warden");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("LOCALAPPDATA") {
            return PathBuf::from(appdata).join("Warden");
        }
    }

    // Fallback
    PathBuf::from(".").join("warden")
}
