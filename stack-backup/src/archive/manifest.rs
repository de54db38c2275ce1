//! Manifest types for archives.
//!
//! The manifest is the first entry of every archive (`manifest.json`) and
//! records, for every target attempted, whether it was captured and the
//! checksum and size of the stored stream.

use crate::archive::ArchiveId;
use crate::checksum::Checksum;
use crate::targets::TargetKind;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    Complete,
    Degraded,
}

impl fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveStatus::Complete => f.write_str("complete"),
            ArchiveStatus::Degraded => f.write_str("degraded"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOutcome {
    Ok,
    Failed,
}

/// Archive manifest, serialized as `manifest.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub archive_id: String,
    pub created_at: DateTime<Utc>,
    pub host: String,
    pub status: ArchiveStatus,
    pub targets: Vec<ManifestEntry>,
}

/// One attempted target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub target: String,
    pub kind: TargetKind,
    pub outcome: EntryOutcome,

    /// Path of the stored stream inside the archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ManifestEntry {
    pub fn captured(target: &str, kind: TargetKind, entry: &str, checksum: Checksum, size: u64) -> Self {
        Self {
            target: target.to_string(),
            kind,
            outcome: EntryOutcome::Ok,
            entry: Some(entry.to_string()),
            checksum: Some(checksum),
            size: Some(size),
            error: None,
        }
    }

    pub fn failed(target: &str, kind: TargetKind, error: String) -> Self {
        Self {
            target: target.to_string(),
            kind,
            outcome: EntryOutcome::Failed,
            entry: None,
            checksum: None,
            size: None,
            error: Some(error),
        }
    }
}

impl Manifest {
    /// Build a manifest; the status follows from the entries.
    pub fn new(id: &ArchiveId, created_at: DateTime<Utc>, host: String, targets: Vec<ManifestEntry>) -> Self {
        let status = if targets.iter().all(|t| t.outcome == EntryOutcome::Ok) {
            ArchiveStatus::Complete
        } else {
            ArchiveStatus::Degraded
        };
        Self {
            version: MANIFEST_VERSION,
            archive_id: id.to_string(),
            created_at,
            host,
            status,
            targets,
        }
    }

    /// Parse the manifest from an archive entry
    pub fn from_tar_entry<R: Read>(mut entry: tar::Entry<'_, R>) -> Result<Self> {
        let path = entry
            .path()
            .map_err(|e| BackupError::Verification(format!("unreadable entry name: {}", e)))?
            .into_owned();
        if path.as_os_str() != MANIFEST_ENTRY {
            return Err(BackupError::Verification(format!(
                "first entry is {}, expected {}",
                path.display(),
                MANIFEST_ENTRY
            )));
        }
        let manifest: Manifest = serde_json::from_reader(&mut entry)
            .map_err(|e| BackupError::Verification(format!("invalid manifest: {}", e)))?;
        if manifest.version > MANIFEST_VERSION {
            return Err(BackupError::Verification(format!(
                "unsupported manifest version {}",
                manifest.version
            )));
        }
        Ok(manifest)
    }

    /// Read only the manifest of an archive file.
    pub fn read_from_archive(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut archive = tar::Archive::new(BufReader::new(file));
        let mut entries = archive
            .entries()
            .map_err(|e| BackupError::Verification(format!("unreadable archive: {}", e)))?;
        match entries.next() {
            Some(Ok(entry)) => Self::from_tar_entry(entry),
            Some(Err(e)) => Err(BackupError::Verification(format!("unreadable archive: {}", e))),
            None => Err(BackupError::Verification("archive is empty".to_string())),
        }
    }
}
