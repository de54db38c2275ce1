//! Archive assembly.
//!
//! Artifacts are written into a per-run staging directory. Sealing packs the
//! manifest and the staged streams into `.<name>.partial`, syncs it, and
//! renames it to the final name. A crash at any point leaves only dot-file
//! temporaries, which the next run sweeps.

use crate::archive::manifest::{Manifest, MANIFEST_ENTRY};
use crate::archive::{ArchiveId, ArchiveStore};
use crate::collector::Artifact;
use crate::utils::errors::{BackupError, Result};
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::PathBuf;
use tracing::{debug, warn};

/// A sealed, visible archive
#[derive(Debug, Clone)]
pub struct Archive {
    pub id: ArchiveId,
    pub path: PathBuf,
    pub manifest: Manifest,
    pub size: u64,
}

/// Staging area for one run. Dropping it removes everything it wrote that
/// has not been published.
#[derive(Debug)]
pub struct Staging {
    id: ArchiveId,
    dir: PathBuf,
    partial_path: PathBuf,
    final_path: PathBuf,
    root: PathBuf,
}

impl ArchiveStore {
    /// Create the staging area for a new archive
    pub fn begin(&self, id: ArchiveId) -> Result<Staging> {
        let dir = self.staging_dir_for(&id);
        fs::create_dir_all(&dir).map_err(|e| BackupError::archive_write("create staging directory", e))?;
        debug!("Staging archive {} in {}", id, dir.display());
        Ok(Staging {
            partial_path: self.partial_path_for(&id),
            final_path: self.path_for(&id),
            root: self.root().to_path_buf(),
            id,
            dir,
        })
    }
}

impl Staging {
    #[cfg(test)]
    pub(crate) fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    /// Staging path for an archive entry, with parent directories created
    pub fn prepare(&self, entry: &str) -> io::Result<PathBuf> {
        let path = self.dir.join(entry);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    /// Pack, sync and publish the archive under its final name.
    pub fn seal(self, manifest: &Manifest, artifacts: &[Artifact]) -> Result<Archive> {
        self.write_partial(manifest, artifacts)?;
        let size = self.publish()?;
        Ok(Archive {
            id: self.id.clone(),
            path: self.final_path.clone(),
            manifest: manifest.clone(),
            size,
        })
    }

    /// Write the complete archive under its temporary name.
    pub(crate) fn write_partial(&self, manifest: &Manifest, artifacts: &[Artifact]) -> Result<()> {
        let file = File::create(&self.partial_path)
            .map_err(|e| BackupError::archive_write("create partial archive", e))?;
        let mut builder = tar::Builder::new(BufWriter::new(file));

        let manifest_json = serde_json::to_vec_pretty(manifest)?;
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest_json.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(manifest.created_at.timestamp().max(0) as u64);
        header.set_entry_type(tar::EntryType::Regular);
        builder
            .append_data(&mut header, MANIFEST_ENTRY, manifest_json.as_slice())
            .map_err(|e| BackupError::archive_write("write manifest", e))?;

        for artifact in artifacts {
            builder
                .append_path_with_name(&artifact.staged, &artifact.entry)
                .map_err(|e| BackupError::archive_write(&format!("append {}", artifact.entry), e))?;
        }

        let writer = builder
            .into_inner()
            .map_err(|e| BackupError::archive_write("finish archive", e))?;
        let file = writer
            .into_inner()
            .map_err(|e| BackupError::archive_write("flush archive", e.into_error()))?;
        file.sync_all()
            .map_err(|e| BackupError::archive_write("sync archive", e))?;
        Ok(())
    }

    /// Atomically move the partial archive to its final name.
    fn publish(&self) -> Result<u64> {
        if self.final_path.exists() {
            return Err(BackupError::ArchiveWrite(format!(
                "{} already exists",
                self.final_path.display()
            )));
        }
        fs::rename(&self.partial_path, &self.final_path)
            .map_err(|e| BackupError::archive_write("rename archive into place", e))?;
        File::open(&self.root)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| BackupError::archive_write("sync archive directory", e))?;
        let size = fs::metadata(&self.final_path)?.len();
        Ok(size)
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove staging directory {}: {}", self.dir.display(), e);
            }
        }
        if let Err(e) = fs::remove_file(&self.partial_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove partial archive {}: {}", self.partial_path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::manifest::ManifestEntry;
    use crate::checksum::Checksum;
    use crate::targets::TargetKind;
    use chrono::{TimeZone, Utc};
    use std::io::Read;
    use tempfile::TempDir;

    fn stage_artifact(staging: &Staging, target: &str, entry: &str, content: &[u8]) -> Artifact {
        let staged = staging.prepare(entry).unwrap();
        fs::write(&staged, content).unwrap();
        Artifact {
            target: target.to_string(),
            kind: TargetKind::Database,
            entry: entry.to_string(),
            staged,
            checksum: Checksum::of(content),
            size: content.len() as u64,
        }
    }

    fn manifest_for(id: &ArchiveId, artifacts: &[Artifact]) -> Manifest {
        let entries = artifacts
            .iter()
            .map(|a| ManifestEntry::captured(&a.target, a.kind, &a.entry, a.checksum.clone(), a.size))
            .collect();
        Manifest::new(id, id.created(), "test-host".to_string(), entries)
    }

    fn fixture() -> (TempDir, ArchiveStore, ArchiveId) {
        let temp_dir = TempDir::new().unwrap();
        let store = ArchiveStore::new(temp_dir.path(), "stack");
        let id = ArchiveId::from_time(Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap());
        (temp_dir, store, id)
    }

    #[test]
    fn test_seal_publishes_manifest_first() -> Result<()> {
        let (_temp_dir, store, id) = fixture();
        let staging = store.begin(id.clone())?;
        let staging_dir = staging.dir().to_path_buf();
        let artifacts = vec![
            stage_artifact(&staging, "kimai", "databases/kimai.sql.zst", b"dump-kimai"),
            stage_artifact(&staging, "nextcloud", "databases/nextcloud.sql.zst", b"dump-nc"),
        ];
        let manifest = manifest_for(&id, &artifacts);

        let archive = staging.seal(&manifest, &artifacts)?;

        assert_eq!(archive.path, store.path_for(&id));
        assert!(archive.path.is_file());
        assert!(!staging_dir.exists());
        assert!(!store.partial_path_for(&id).exists());

        let mut tar = tar::Archive::new(File::open(&archive.path)?);
        let mut names = Vec::new();
        for entry in tar.entries()? {
            let mut entry = entry?;
            names.push(entry.path()?.to_string_lossy().into_owned());
            let mut sink = Vec::new();
            entry.read_to_end(&mut sink)?;
        }
        assert_eq!(
            names,
            vec!["manifest.json", "databases/kimai.sql.zst", "databases/nextcloud.sql.zst"]
        );

        assert_eq!(Manifest::read_from_archive(&archive.path)?, manifest);
        Ok(())
    }

    #[test]
    fn test_interrupted_build_leaves_only_temporaries() -> Result<()> {
        let (_temp_dir, store, id) = fixture();
        let staging = store.begin(id.clone())?;
        let artifacts = vec![stage_artifact(&staging, "kimai", "databases/kimai.sql.zst", b"dump")];
        let manifest = manifest_for(&id, &artifacts);

        staging.write_partial(&manifest, &artifacts)?;
        // Simulate a crash: no rename, no cleanup
        std::mem::forget(staging);

        assert!(!store.path_for(&id).exists());
        assert!(store.partial_path_for(&id).exists());
        assert!(store.list()?.is_empty());

        assert_eq!(store.sweep_stale()?, 2);
        assert!(!store.partial_path_for(&id).exists());
        Ok(())
    }

    #[test]
    fn test_dropped_staging_cleans_up() -> Result<()> {
        let (temp_dir, store, id) = fixture();
        let staging = store.begin(id)?;
        stage_artifact(&staging, "kimai", "databases/kimai.sql.zst", b"dump");
        drop(staging);

        let leftovers: Vec<_> = fs::read_dir(temp_dir.path())?.collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[test]
    fn test_seal_refuses_to_overwrite() -> Result<()> {
        let (_temp_dir, store, id) = fixture();
        fs::write(store.path_for(&id), b"existing")?;

        let staging = store.begin(id.clone())?;
        let artifacts = vec![stage_artifact(&staging, "kimai", "databases/kimai.sql.zst", b"dump")];
        let manifest = manifest_for(&id, &artifacts);

        assert!(matches!(
            staging.seal(&manifest, &artifacts),
            Err(BackupError::ArchiveWrite(_))
        ));
        assert_eq!(fs::read(store.path_for(&id))?, b"existing");
        assert!(!store.partial_path_for(&id).exists());
        Ok(())
    }
}
