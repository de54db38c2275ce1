//! Archive naming and the on-disk archive directory.
//!
//! Layout of the storage root:
//!
//! ```text
//! <root>/
//! ├── <prefix>-20261016T120000Z.tar       finished archives
//! ├── .<prefix>-20261016T121500Z.tar.partial
//! ├── .staging-20261016T121500Z-<uuid>/   per-run staging area
//! └── .lock                               run lock
//! ```
//!
//! Only names matching `<prefix>-<id>.tar` are archives. Everything starting
//! with a dot is a temporary owned by a run and may be swept once no run
//! holds the lock.

pub mod builder;
pub mod manifest;

pub use builder::{Archive, Staging};
pub use manifest::{ArchiveStatus, Manifest, ManifestEntry};

use crate::config::StorageConfig;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const STAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const STAMP_LEN: usize = 16;
const ARCHIVE_EXTENSION: &str = ".tar";
const PARTIAL_EXTENSION: &str = ".partial";
const STAGING_PREFIX: &str = ".staging-";
const LOCK_FILE: &str = ".lock";

/// Sortable archive identifier: `YYYYMMDDTHHMMSSZ`, optionally `-NNN` for
/// runs started within the same second.
///
/// Ordering is by creation second, then by sequence number, then by the id
/// string, so the greatest id is the newest archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveId {
    id: String,
    created: DateTime<Utc>,
    seq: u32,
}

impl ArchiveId {
    pub fn from_time(time: DateTime<Utc>) -> Self {
        let id = time.format(STAMP_FORMAT).to_string();
        // Round-trip drops sub-second precision
        Self::parse(&id).unwrap_or(Self {
            id,
            created: time,
            seq: 0,
        })
    }

    pub fn parse(s: &str) -> Option<Self> {
        let stamp = s.get(..STAMP_LEN)?;
        let rest = &s[STAMP_LEN..];
        let seq = if rest.is_empty() {
            0
        } else {
            let digits = rest.strip_prefix('-')?;
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            digits.parse().ok()?
        };
        let created = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?.and_utc();
        Some(Self {
            id: s.to_string(),
            created,
            seq,
        })
    }

    fn with_sequence(&self, seq: u32) -> Self {
        Self {
            id: format!("{}-{:03}", self.created.format(STAMP_FORMAT), seq),
            created: self.created,
            seq,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }
}

impl Ord for ArchiveId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created
            .cmp(&other.created)
            .then_with(|| self.seq.cmp(&other.seq))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for ArchiveId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// A finished archive found on disk
#[derive(Debug, Clone)]
pub struct StoredArchive {
    pub id: ArchiveId,
    pub path: PathBuf,
    pub size: u64,
}

/// The archive directory
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    root: PathBuf,
    prefix: String,
}

impl ArchiveStore {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    pub fn from_config(storage: &StorageConfig) -> Self {
        Self::new(storage.root.clone(), storage.prefix.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn file_name(&self, id: &ArchiveId) -> String {
        format!("{}-{}{}", self.prefix, id, ARCHIVE_EXTENSION)
    }

    pub fn path_for(&self, id: &ArchiveId) -> PathBuf {
        self.root.join(self.file_name(id))
    }

    pub(crate) fn partial_path_for(&self, id: &ArchiveId) -> PathBuf {
        self.root
            .join(format!(".{}{}", self.file_name(id), PARTIAL_EXTENSION))
    }

    pub(crate) fn staging_dir_for(&self, id: &ArchiveId) -> PathBuf {
        self.root
            .join(format!("{}{}-{}", STAGING_PREFIX, id, uuid::Uuid::new_v4().simple()))
    }

    /// Parse an archive file name back into its id
    pub fn parse_file_name(&self, name: &str) -> Option<ArchiveId> {
        let rest = name.strip_prefix(self.prefix.as_str())?.strip_prefix('-')?;
        let id = rest.strip_suffix(ARCHIVE_EXTENSION)?;
        ArchiveId::parse(id)
    }

    /// All finished archives, newest first. A missing root means no archives.
    pub fn list(&self) -> Result<Vec<StoredArchive>> {
        let dir = match std::fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut archives = Vec::new();
        for entry in dir {
            let entry = entry?;
            let name = entry.file_name();
            let Some(id) = self.parse_file_name(&name.to_string_lossy()) else {
                continue;
            };
            let metadata = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                // Pruned between read_dir and stat
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            archives.push(StoredArchive {
                id,
                path: entry.path(),
                size: metadata.len(),
            });
        }

        archives.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(archives)
    }

    pub fn latest(&self) -> Result<Option<StoredArchive>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Locate the archive a `check` refers to: the latest when `selector` is
    /// empty, otherwise an archive id, an archive file name, or a path.
    pub fn resolve(&self, selector: Option<&str>) -> Result<PathBuf> {
        let Some(selector) = selector else {
            return self
                .latest()?
                .map(|a| a.path)
                .ok_or_else(|| BackupError::ArchiveNotFound(format!("no archives in {}", self.root.display())));
        };

        if let Some(id) = ArchiveId::parse(selector) {
            let path = self.path_for(&id);
            if path.is_file() {
                return Ok(path);
            }
        }
        let in_root = self.root.join(selector);
        if self.parse_file_name(selector).is_some() && in_root.is_file() {
            return Ok(in_root);
        }
        let as_path = PathBuf::from(selector);
        if as_path.is_file() {
            return Ok(as_path);
        }
        Err(BackupError::ArchiveNotFound(selector.to_string()))
    }

    /// Id for a new archive created at `now`, unique within the store.
    pub fn next_id(&self, now: DateTime<Utc>) -> ArchiveId {
        let base = ArchiveId::from_time(now);
        if !self.path_for(&base).exists() {
            return base;
        }
        let mut seq = 1;
        loop {
            let candidate = base.with_sequence(seq);
            if !self.path_for(&candidate).exists() {
                return candidate;
            }
            seq += 1;
        }
    }

    /// Delete one archive. Only the retention manager calls this.
    pub(crate) fn remove(&self, id: &ArchiveId) -> std::io::Result<()> {
        std::fs::remove_file(self.path_for(id))
    }

    /// Remove staging directories and partial archives left by crashed runs.
    /// Must only be called while holding the run lock.
    pub fn sweep_stale(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let path = entry.path();

            let result = if name.starts_with(STAGING_PREFIX) && path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else if name.starts_with('.') && name.ends_with(PARTIAL_EXTENSION) {
                std::fs::remove_file(&path)
            } else {
                continue;
            };

            match result {
                Ok(()) => {
                    info!("Removed stale temporary {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove stale temporary {}: {}", path.display(), e),
            }
        }
        Ok(removed)
    }
}
