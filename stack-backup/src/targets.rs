//! Backup targets resolved from configuration.
//!
//! The set is fixed: databases, volumes, the encryption master key and the
//! repository tree, in that order. Nothing is discovered at runtime.

use crate::config::{CaptureConfig, Config, DatabaseEngine};
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Database,
    VolumeOrTree,
    SecretFile,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TargetKind::Database => "database",
            TargetKind::VolumeOrTree => "volume",
            TargetKind::SecretFile => "secret",
        };
        f.write_str(label)
    }
}

/// Where a target's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// Stdout of an external command
    Command(Vec<String>),
    /// Local file or directory
    Path(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Target {
    pub name: String,
    pub kind: TargetKind,
    pub locator: Locator,
    /// Name patterns skipped when a directory is captured in-process
    pub excludes: Vec<String>,
    /// Absolute paths skipped when a directory is captured in-process
    pub exclude_paths: Vec<PathBuf>,
    /// Failure aborts the run instead of degrading the archive
    pub required: bool,
}

impl Target {
    fn new(name: &str, kind: TargetKind, locator: Locator) -> Self {
        Self {
            name: name.to_string(),
            kind,
            locator,
            excludes: Vec::new(),
            exclude_paths: Vec::new(),
            required: false,
        }
    }
}

/// Resolve the ordered target list.
pub fn enumerate(config: &Config) -> Result<Vec<Target>> {
    let capture = &config.capture;
    let mut targets = Vec::new();

    for db in &config.databases {
        let command = match (&db.command, &db.container) {
            (Some(cmd), _) if !cmd.is_empty() => cmd.clone(),
            (Some(_), _) => {
                return Err(missing(&db.name, "an empty dump command"));
            }
            (None, Some(container)) if !container.is_empty() => {
                database_dump_command(capture, container, db.engine)
            }
            (None, _) => return Err(missing(&db.name, "no container or command")),
        };
        targets.push(Target::new(&db.name, TargetKind::Database, Locator::Command(command)));
    }

    for vol in &config.volumes {
        let locator = match (&vol.volume, &vol.path) {
            (Some(_), Some(_)) => {
                return Err(BackupError::Config(format!(
                    "volume '{}' sets both `volume` and `path`",
                    vol.name
                )));
            }
            (Some(volume), None) if !volume.is_empty() => {
                Locator::Command(volume_stream_command(capture, volume))
            }
            (None, Some(path)) => Locator::Path(path.clone()),
            _ => return Err(missing(&vol.name, "no volume or path")),
        };
        let mut target = Target::new(&vol.name, TargetKind::VolumeOrTree, locator);
        target.excludes = vol.excludes.clone();
        targets.push(target);
    }

    if let Some(key) = &config.master_key {
        let path = key
            .path
            .as_ref()
            .ok_or_else(|| missing(&key.name, "no path"))?;
        let locator = match &key.container {
            Some(container) if !container.is_empty() => {
                Locator::Command(container_tar_command(capture, container, path)?)
            }
            _ => Locator::Path(path.clone()),
        };
        let mut target = Target::new(&key.name, TargetKind::SecretFile, locator);
        target.required = key.required;
        targets.push(target);
    }

    if let Some(repo) = &config.repository {
        let path = repo
            .path
            .as_ref()
            .ok_or_else(|| missing(&repo.name, "no path"))?;
        let mut target = Target::new(&repo.name, TargetKind::VolumeOrTree, Locator::Path(path.clone()));
        target.excludes = repo.excludes.clone();
        // Never archive the archive directory itself
        if config.storage.root.starts_with(path) {
            target.exclude_paths.push(config.storage.root.clone());
        }
        targets.push(target);
    }

    if targets.is_empty() {
        return Err(BackupError::Config("no backup targets configured".to_string()));
    }

    let mut seen = HashSet::new();
    for target in &targets {
        validate_name(&target.name)?;
        if !seen.insert(target.name.as_str()) {
            return Err(BackupError::Config(format!(
                "duplicate target name '{}'",
                target.name
            )));
        }
    }

    Ok(targets)
}

fn missing(name: &str, what: &str) -> BackupError {
    BackupError::Config(format!("target '{}' has {}", name, what))
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(BackupError::Config(format!("invalid target name '{}'", name)))
    }
}

/// Dump command that reads one consistent snapshot without locking writers.
fn database_dump_command(capture: &CaptureConfig, container: &str, engine: DatabaseEngine) -> Vec<String> {
    let script = match engine {
        DatabaseEngine::Mysql => {
            "mysqldump --single-transaction --quick --routines \
             -u\"$MYSQL_USER\" -p\"$MYSQL_PASSWORD\" \"$MYSQL_DATABASE\""
        }
        DatabaseEngine::Postgres => "pg_dump -U \"$POSTGRES_USER\" \"$POSTGRES_DB\"",
    };
    vec![
        capture.docker.clone(),
        "exec".to_string(),
        container.to_string(),
        "sh".to_string(),
        "-c".to_string(),
        script.to_string(),
    ]
}

/// Streams a named volume as tar.gz through a throwaway read-only container.
fn volume_stream_command(capture: &CaptureConfig, volume: &str) -> Vec<String> {
    vec![
        capture.docker.clone(),
        "run".to_string(),
        "--rm".to_string(),
        format!("-v{}:/volume:ro", volume),
        capture.volume_image.clone(),
        "tar".to_string(),
        "czf".to_string(),
        "-".to_string(),
        "-C".to_string(),
        "/volume".to_string(),
        ".".to_string(),
    ]
}

fn container_tar_command(capture: &CaptureConfig, container: &str, path: &Path) -> Result<Vec<String>> {
    let (parent, name) = match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => (parent, name),
        _ => {
            return Err(BackupError::Config(format!(
                "master key path {} has no parent directory",
                path.display()
            )));
        }
    };
    Ok(vec![
        capture.docker.clone(),
        "exec".to_string(),
        container.to_string(),
        "tar".to_string(),
        "czf".to_string(),
        "-".to_string(),
        "-C".to_string(),
        parent.to_string_lossy().into_owned(),
        name.to_string_lossy().into_owned(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, MasterKeyConfig, RepositoryConfig, VolumeConfig};

    fn base_config() -> Config {
        let mut config = Config::new("/srv/stack/backups");
        config.databases.push(DatabaseConfig {
            name: "kimai".to_string(),
            container: Some("kimai-db".to_string()),
            engine: DatabaseEngine::Mysql,
            command: None,
        });
        config.volumes.push(VolumeConfig {
            name: "redis_data".to_string(),
            volume: Some("stack_redis_data".to_string()),
            path: None,
            excludes: vec![],
        });
        config.master_key = Some(MasterKeyConfig {
            name: "master_key".to_string(),
            container: Some("nextcloud".to_string()),
            path: Some(PathBuf::from("/var/www/html/data/files_encryption")),
            required: true,
        });
        config.repository = Some(RepositoryConfig {
            name: "repository".to_string(),
            path: Some(PathBuf::from("/srv/stack")),
            excludes: vec!["node_modules".to_string()],
        });
        config
    }

    #[test]
    fn test_enumerate_order_and_kinds() {
        let targets = enumerate(&base_config()).unwrap();
        let names: Vec<_> = targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["kimai", "redis_data", "master_key", "repository"]);
        assert_eq!(targets[0].kind, TargetKind::Database);
        assert_eq!(targets[1].kind, TargetKind::VolumeOrTree);
        assert_eq!(targets[2].kind, TargetKind::SecretFile);
        assert!(targets[2].required);
        assert!(!targets[0].required);
    }

    #[test]
    fn test_mysql_dump_uses_consistent_snapshot() {
        let targets = enumerate(&base_config()).unwrap();
        match &targets[0].locator {
            Locator::Command(argv) => {
                assert_eq!(&argv[..3], &["docker", "exec", "kimai-db"]);
                assert!(argv[5].contains("--single-transaction"));
            }
            other => panic!("unexpected locator {:?}", other),
        }
    }

    #[test]
    fn test_master_key_in_container_is_tarred_from_parent() {
        let targets = enumerate(&base_config()).unwrap();
        match &targets[2].locator {
            Locator::Command(argv) => {
                assert!(argv.ends_with(&[
                    "-C".to_string(),
                    "/var/www/html/data".to_string(),
                    "files_encryption".to_string(),
                ]));
            }
            other => panic!("unexpected locator {:?}", other),
        }
    }

    #[test]
    fn test_repository_excludes_nested_storage_root() {
        let targets = enumerate(&base_config()).unwrap();
        let repo = &targets[3];
        assert_eq!(repo.locator, Locator::Path(PathBuf::from("/srv/stack")));
        assert_eq!(repo.exclude_paths, vec![PathBuf::from("/srv/stack/backups")]);
    }

    #[test]
    fn test_database_without_locator_is_config_error() {
        let mut config = base_config();
        config.databases[0].container = None;
        let err = enumerate(&config).unwrap_err();
        assert!(matches!(err, BackupError::Config(msg) if msg.contains("kimai")));
    }

    #[test]
    fn test_master_key_without_path_is_config_error() {
        let mut config = base_config();
        if let Some(key) = config.master_key.as_mut() {
            key.path = None;
        }
        assert!(matches!(enumerate(&config), Err(BackupError::Config(_))));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut config = base_config();
        config.volumes[0].name = "kimai".to_string();
        assert!(matches!(enumerate(&config), Err(BackupError::Config(_))));
    }

    #[test]
    fn test_unsafe_name_rejected() {
        let mut config = base_config();
        config.volumes[0].name = "../etc".to_string();
        assert!(matches!(enumerate(&config), Err(BackupError::Config(_))));
    }

    #[test]
    fn test_empty_config_is_error() {
        assert!(matches!(
            enumerate(&Config::new("/tmp/backups")),
            Err(BackupError::Config(_))
        ));
    }
}
