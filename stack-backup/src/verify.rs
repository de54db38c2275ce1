//! Integrity verification of finished archives.
//!
//! Re-reads an archive end to end, recomputes the checksum and size of every
//! stored stream and compares them with the manifest. Never modifies the
//! archive.

use crate::archive::manifest::{EntryOutcome, Manifest};
use crate::checksum::{Checksum, HashingWriter};
use crate::utils::errors::{BackupError, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactVerdict {
    Pass,
    Mismatch {
        expected: Checksum,
        actual: Checksum,
        expected_size: u64,
        actual_size: u64,
    },
    /// Listed in the manifest but not stored
    Missing,
    /// Target failed at capture time. Reported, not a failure.
    NotCaptured { error: String },
    /// Stored but not listed in the manifest
    Unexpected,
}

impl ArtifactVerdict {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ArtifactVerdict::Mismatch { .. } | ArtifactVerdict::Missing | ArtifactVerdict::Unexpected
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ArtifactVerdict::Pass => "pass",
            ArtifactVerdict::Mismatch { .. } => "MISMATCH",
            ArtifactVerdict::Missing => "MISSING",
            ArtifactVerdict::NotCaptured { .. } => "not captured",
            ArtifactVerdict::Unexpected => "UNEXPECTED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactCheck {
    /// Target name, or the stored entry for unexpected entries
    pub target: String,
    pub entry: Option<String>,
    pub verdict: ArtifactVerdict,
}

#[derive(Debug, Clone)]
pub struct VerificationReport {
    pub archive: PathBuf,
    pub manifest: Manifest,
    pub artifacts: Vec<ArtifactCheck>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.artifacts.iter().all(|a| !a.verdict.is_failure())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ArtifactCheck> {
        self.artifacts.iter().filter(|a| a.verdict.is_failure())
    }
}

fn unreadable(e: io::Error) -> BackupError {
    BackupError::Verification(format!("unreadable archive: {}", e))
}

/// Verify the archive at `path`.
///
/// Per-artifact problems end up in the report. A missing manifest or an
/// unreadable tar fails the whole archive with `BackupError::Verification`.
pub fn verify_archive(path: &Path) -> Result<VerificationReport> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(BackupError::ArchiveNotFound(path.display().to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    let mut archive = tar::Archive::new(BufReader::new(file));
    let mut entries = archive.entries().map_err(unreadable)?;

    let manifest = match entries.next() {
        Some(Ok(entry)) => Manifest::from_tar_entry(entry)?,
        Some(Err(e)) => return Err(unreadable(e)),
        None => return Err(BackupError::Verification("archive is empty".to_string())),
    };

    let mut stored: BTreeMap<String, (Checksum, u64)> = BTreeMap::new();
    for entry in entries {
        let mut entry = entry.map_err(unreadable)?;
        let name = entry.path().map_err(unreadable)?.to_string_lossy().into_owned();
        let mut hasher = HashingWriter::new(io::sink());
        io::copy(&mut entry, &mut hasher).map_err(unreadable)?;
        let (_, checksum, size) = hasher.finish();
        stored.insert(name, (checksum, size));
    }

    let mut artifacts = Vec::with_capacity(manifest.targets.len() + stored.len());
    for target in &manifest.targets {
        let verdict = match (target.outcome, &target.entry, &target.checksum, target.size) {
            (EntryOutcome::Failed, _, _, _) => ArtifactVerdict::NotCaptured {
                error: target.error.clone().unwrap_or_default(),
            },
            (EntryOutcome::Ok, Some(entry), Some(expected), Some(expected_size)) => match stored.remove(entry) {
                None => ArtifactVerdict::Missing,
                Some((actual, actual_size)) if actual == *expected && actual_size == expected_size => {
                    ArtifactVerdict::Pass
                }
                Some((actual, actual_size)) => ArtifactVerdict::Mismatch {
                    expected: expected.clone(),
                    actual,
                    expected_size,
                    actual_size,
                },
            },
            (EntryOutcome::Ok, ..) => ArtifactVerdict::Missing,
        };
        artifacts.push(ArtifactCheck {
            target: target.target.clone(),
            entry: target.entry.clone(),
            verdict,
        });
    }
    for (name, _) in stored {
        artifacts.push(ArtifactCheck {
            target: name.clone(),
            entry: Some(name),
            verdict: ArtifactVerdict::Unexpected,
        });
    }

    let report = VerificationReport {
        archive: path.to_path_buf(),
        manifest,
        artifacts,
    };

    for failure in report.failures() {
        error!(
            "Verification of {} failed for '{}': {}",
            path.display(),
            failure.target,
            failure.verdict.label()
        );
    }
    info!(
        "Verified {}: {} artifacts, {}",
        path.display(),
        report.artifacts.len(),
        if report.passed() { "all pass" } else { "FAILED" }
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::manifest::{ManifestEntry, MANIFEST_ENTRY};
    use crate::archive::{Archive, ArchiveId, ArchiveStore};
    use crate::collector::Artifact;
    use crate::targets::TargetKind;
    use chrono::{TimeZone, Utc};
    use std::fs::{self, OpenOptions};
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;

    fn build(temp_dir: &TempDir, streams: &[(&str, &[u8])], failed: &[&str]) -> Archive {
        let store = ArchiveStore::new(temp_dir.path(), "stack");
        let id = ArchiveId::from_time(Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap());
        let staging = store.begin(id.clone()).unwrap();

        let mut artifacts = Vec::new();
        let mut entries = Vec::new();
        for (name, content) in streams {
            let entry = format!("databases/{}.sql.zst", name);
            let staged = staging.prepare(&entry).unwrap();
            fs::write(&staged, content).unwrap();
            let checksum = Checksum::of(content);
            entries.push(ManifestEntry::captured(
                name,
                TargetKind::Database,
                &entry,
                checksum.clone(),
                content.len() as u64,
            ));
            artifacts.push(Artifact {
                target: name.to_string(),
                kind: TargetKind::Database,
                entry,
                staged,
                checksum,
                size: content.len() as u64,
            });
        }
        for name in failed {
            entries.push(ManifestEntry::failed(name, TargetKind::VolumeOrTree, "exit status: 1".to_string()));
        }

        let manifest = Manifest::new(&id, id.created(), "test-host".to_string(), entries);
        staging.seal(&manifest, &artifacts).unwrap()
    }

    fn data_offset(path: &Path, entry_name: &str) -> u64 {
        let mut archive = tar::Archive::new(File::open(path).unwrap());
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            if entry.path().unwrap().to_string_lossy() == entry_name {
                return entry.raw_file_position();
            }
        }
        panic!("{} not in archive", entry_name);
    }

    #[test]
    fn test_fresh_archive_passes() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = build(&temp_dir, &[("kimai", &b"dump one"[..]), ("nextcloud", &b"dump two"[..])], &["redis"]);

        let report = verify_archive(&archive.path)?;
        assert!(report.passed());
        assert_eq!(report.artifacts.len(), 3);
        assert_eq!(report.artifacts[0].verdict, ArtifactVerdict::Pass);
        assert_eq!(report.artifacts[1].verdict, ArtifactVerdict::Pass);
        assert!(matches!(report.artifacts[2].verdict, ArtifactVerdict::NotCaptured { .. }));
        Ok(())
    }

    #[test]
    fn test_flipped_byte_fails_exactly_that_artifact() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let archive = build(&temp_dir, &[("kimai", &b"dump one"[..]), ("nextcloud", &b"dump two"[..])], &[]);

        let offset = data_offset(&archive.path, "databases/nextcloud.sql.zst");
        let mut file = OpenOptions::new().read(true).write(true).open(&archive.path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(b"X")?;
        drop(file);

        let report = verify_archive(&archive.path)?;
        assert!(!report.passed());
        let failures: Vec<_> = report.failures().map(|f| f.target.as_str()).collect();
        assert_eq!(failures, vec!["nextcloud"]);
        match &report.artifacts[1].verdict {
            ArtifactVerdict::Mismatch {
                expected,
                actual,
                expected_size,
                actual_size,
            } => {
                assert_eq!(expected, &Checksum::of(b"dump two"));
                assert_eq!(actual, &Checksum::of(b"Xump two"));
                assert_eq!(expected_size, actual_size);
            }
            other => panic!("unexpected verdict {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_unlisted_and_missing_entries_fail() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let id = ArchiveId::parse("20261016T120000Z").unwrap();
        let entries = vec![ManifestEntry::captured(
            "kimai",
            TargetKind::Database,
            "databases/kimai.sql.zst",
            Checksum::of(b"x"),
            1,
        )];
        let manifest = Manifest::new(&id, id.created(), "host".to_string(), entries);

        let path = temp_dir.path().join("stack-20261016T120000Z.tar");
        let mut builder = tar::Builder::new(File::create(&path)?);
        let json = serde_json::to_vec(&manifest)?;
        let mut header = tar::Header::new_gnu();
        header.set_size(json.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, MANIFEST_ENTRY, json.as_slice())?;
        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o644);
        builder.append_data(&mut header, "extra.bin", &b"abc"[..])?;
        builder.finish()?;
        drop(builder);

        let report = verify_archive(&path)?;
        assert!(!report.passed());
        assert_eq!(report.artifacts[0].verdict, ArtifactVerdict::Missing);
        assert_eq!(report.artifacts[1].target, "extra.bin");
        assert_eq!(report.artifacts[1].verdict, ArtifactVerdict::Unexpected);
        Ok(())
    }

    #[test]
    fn test_archive_without_manifest_fails_whole() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("stack-20261016T120000Z.tar");
        let mut builder = tar::Builder::new(File::create(&path)?);
        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o644);
        builder.append_data(&mut header, "databases/kimai.sql.zst", &b"abc"[..])?;
        builder.finish()?;
        drop(builder);

        assert!(matches!(verify_archive(&path), Err(BackupError::Verification(_))));
        Ok(())
    }

    #[test]
    fn test_missing_archive_is_not_found() {
        assert!(matches!(
            verify_archive(Path::new("/nonexistent/stack-20261016T120000Z.tar")),
            Err(BackupError::ArchiveNotFound(_))
        ));
    }
}
