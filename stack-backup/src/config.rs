//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file with environment variable overrides.
//! Target locators are only checked when targets are enumerated, so `list`
//! and `check` work with a config that has no targets at all.

use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Used when neither `--config` nor `STACK_BACKUP_CONFIG` is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/stack-backup/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,

    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,

    #[serde(default)]
    pub master_key: Option<MasterKeyConfig>,

    #[serde(default)]
    pub repository: Option<RepositoryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding finished archives, staging areas and the run lock
    pub root: PathBuf,

    /// Archive file name prefix
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Append-only run log
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Ceiling for a single target capture
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Docker CLI used for container-hosted targets
    #[serde(default = "default_docker")]
    pub docker: String,

    /// Helper image that streams a named volume as tar.gz
    #[serde(default = "default_volume_image")]
    pub volume_image: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    #[default]
    #[serde(alias = "mariadb")]
    Mysql,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,

    /// Container running the database server
    #[serde(default)]
    pub container: Option<String>,

    #[serde(default)]
    pub engine: DatabaseEngine,

    /// Full dump command; replaces the engine default
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub name: String,

    /// Docker named volume
    #[serde(default)]
    pub volume: Option<String>,

    /// Host directory, captured in-process
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub excludes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterKeyConfig {
    #[serde(default = "default_master_key_name")]
    pub name: String,

    /// When set, `path` is resolved inside this container
    #[serde(default)]
    pub container: Option<String>,

    #[serde(default)]
    pub path: Option<PathBuf>,

    /// A run without the key is aborted instead of degraded
    #[serde(default = "default_true")]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    #[serde(default = "default_repository_name")]
    pub name: String,

    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub excludes: Vec<String>,
}

// Default values
fn default_prefix() -> String {
    "stack-backup".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout_secs() -> u64 {
    30 * 60
}

fn default_docker() -> String {
    "docker".to_string()
}

fn default_volume_image() -> String {
    "busybox".to_string()
}

fn default_master_key_name() -> String {
    "master_key".to_string()
}

fn default_repository_name() -> String {
    "repository".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            docker: default_docker(),
            volume_image: default_volume_image(),
        }
    }
}

impl CaptureConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Configuration with no targets, storing archives under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Config {
            storage: StorageConfig {
                root: root.into(),
                prefix: default_prefix(),
            },
            log: LogConfig::default(),
            capture: CaptureConfig::default(),
            databases: Vec::new(),
            volumes: Vec::new(),
            master_key: None,
            repository: None,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Resolve the config path (flag, then environment, then the default),
    /// load it and apply environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => std::env::var_os("STACK_BACKUP_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
        };
        let mut config = Self::from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `STACK_BACKUP_*` overrides from the given lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("STACK_BACKUP_ROOT").filter(|v| !v.is_empty()) {
            self.storage.root = PathBuf::from(root);
        }
        if let Some(level) = lookup("STACK_BACKUP_LOG_LEVEL").filter(|v| !v.is_empty()) {
            self.log.level = level;
        }
        if let Some(file) = lookup("STACK_BACKUP_LOG_FILE").filter(|v| !v.is_empty()) {
            self.log.file = Some(PathBuf::from(file));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
[storage]
root = "/srv/stack/backups"

[log]
file = "/var/log/stack-backup.log"

[[databases]]
name = "kimai"
container = "kimai-db"

[[databases]]
name = "nextcloud"
container = "nextcloud-db"
engine = "mariadb"

[[volumes]]
name = "nextcloud_data"
volume = "stack_nextcloud_data"

[master_key]
container = "nextcloud"
path = "/var/www/html/data/files_encryption"

[repository]
path = "/srv/stack"
excludes = ["backups", "node_modules"]
"#;

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(SAMPLE).unwrap();

        assert_eq!(config.storage.root, PathBuf::from("/srv/stack/backups"));
        assert_eq!(config.storage.prefix, "stack-backup");
        assert_eq!(config.log.level, "info");
        assert_eq!(config.capture.timeout_secs, 1800);
        assert_eq!(config.capture.docker, "docker");
        assert_eq!(config.databases.len(), 2);
        assert_eq!(config.databases[1].engine, DatabaseEngine::Mysql);
        assert_eq!(config.volumes[0].volume.as_deref(), Some("stack_nextcloud_data"));

        let key = config.master_key.unwrap();
        assert_eq!(key.name, "master_key");
        assert!(key.required);

        let repo = config.repository.unwrap();
        assert_eq!(repo.name, "repository");
        assert_eq!(repo.excludes, vec!["backups", "node_modules"]);
    }

    #[test]
    fn test_storage_root_is_required() {
        assert!(Config::from_toml("[log]\nlevel = \"debug\"\n").is_err());
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Config::from_file(Path::new("/nonexistent/stack-backup.toml")).unwrap_err();
        assert!(matches!(err, BackupError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::from_toml(SAMPLE).unwrap();
        let env: HashMap<&str, &str> = [
            ("STACK_BACKUP_ROOT", "/mnt/backups"),
            ("STACK_BACKUP_LOG_LEVEL", "debug"),
            ("STACK_BACKUP_LOG_FILE", ""),
        ]
        .into_iter()
        .collect();

        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.storage.root, PathBuf::from("/mnt/backups"));
        assert_eq!(config.log.level, "debug");
        // Empty values leave the file setting alone
        assert_eq!(config.log.file, Some(PathBuf::from("/var/log/stack-backup.log")));
    }
}
