//! In-process capture of a directory tree as tar.zst.

use crate::checksum::{Checksum, HashingWriter};
use crate::fs::walker::{walk_directory_with_callback, WalkOptions};
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Pack `root` into a zstd-compressed tar at `staged`.
///
/// Symlinks are stored as links. Regular files are stored at the size they
/// had when opened, so files written to during the capture cannot break the
/// stream. Entries that disappear or cannot be read during the walk are
/// skipped with a warning. Cancellation is checked between entries and ends
/// the capture with `ErrorKind::Interrupted`.
pub fn capture_tree(
    root: &Path,
    staged: &Path,
    options: &WalkOptions,
    cancel: &CancellationToken,
) -> io::Result<(Checksum, u64)> {
    let file = File::create(staged)?;
    let encoder = zstd::stream::write::Encoder::new(
        HashingWriter::new(BufWriter::new(file)),
        zstd::DEFAULT_COMPRESSION_LEVEL,
    )?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut entries = 0usize;
    let mut skipped = 0usize;
    walk_directory_with_callback(root, options, |info| {
        if cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "tree capture cancelled"));
        }
        let appended = if info.file_type.is_file() {
            append_file(&mut builder, &info.path, &info.relative_path)
        } else {
            builder.append_path_with_name(&info.path, &info.relative_path)
        };
        match appended {
            Ok(()) => {
                entries += 1;
                Ok(())
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied) => {
                warn!("Skipping {}: {}", info.path.display(), e);
                skipped += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    })?;

    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    let (buffered, checksum, size) = writer.finish();
    let file = buffered.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    info!(
        "Packed {} entries from {} ({} skipped)",
        entries,
        root.display(),
        skipped
    );
    Ok((checksum, size))
}

/// Append a regular file using the length of the open descriptor. Bytes
/// appended after that are left out and a file that shrinks is padded with
/// zeros, as GNU tar does.
fn append_file<W: Write>(builder: &mut tar::Builder<W>, path: &Path, name: &Path) -> io::Result<()> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    if !metadata.is_file() {
        return builder.append_path_with_name(path, name);
    }

    let len = metadata.len();
    let mut header = tar::Header::new_gnu();
    header.set_metadata_in_mode(&metadata, tar::HeaderMode::Complete);
    header.set_size(len);
    let data = file.take(len).chain(io::repeat(0)).take(len);
    builder.append_data(&mut header, name, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn entry_names(archive: &Path) -> Vec<String> {
        let decoded = zstd::decode_all(File::open(archive).unwrap()).unwrap();
        let mut tar = tar::Archive::new(decoded.as_slice());
        tar.entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_capture_relative_paths_and_checksum() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("repo");
        fs::create_dir_all(root.join("config"))?;
        fs::write(root.join("compose.yml"), b"services: {}")?;
        fs::write(root.join("config/app.env"), b"A=1")?;
        let staged = temp_dir.path().join("repo.tar.zst");

        let (checksum, size) = capture_tree(&root, &staged, &WalkOptions::default(), &CancellationToken::new())?;

        let stored = fs::read(&staged)?;
        assert_eq!(size, stored.len() as u64);
        assert_eq!(checksum, Checksum::of(&stored));
        assert_eq!(entry_names(&staged), vec!["compose.yml", "config", "config/app.env"]);
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks_stored_as_links() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("repo");
        fs::create_dir_all(&root)?;
        std::os::unix::fs::symlink("/etc/passwd", root.join("passwd"))?;
        let staged = temp_dir.path().join("repo.tar.zst");

        capture_tree(&root, &staged, &WalkOptions::default(), &CancellationToken::new())?;

        let decoded = zstd::decode_all(File::open(&staged)?)?;
        let mut tar = tar::Archive::new(decoded.as_slice());
        let entry = tar.entries()?.next().expect("one entry")?;
        assert_eq!(entry.header().entry_type(), tar::EntryType::Symlink);
        Ok(())
    }

    #[test]
    fn test_growing_file_keeps_stream_readable() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("data");
        fs::create_dir_all(&root)?;
        fs::write(root.join("a.log"), vec![b'x'; 4 * 1024 * 1024])?;
        fs::write(root.join("z.txt"), b"last entry")?;
        let staged = temp_dir.path().join("data.tar.zst");

        let stop = Arc::new(AtomicBool::new(false));
        let writer = {
            let path = root.join("a.log");
            let stop = stop.clone();
            std::thread::spawn(move || -> io::Result<()> {
                let mut log = fs::OpenOptions::new().append(true).open(path)?;
                while !stop.load(Ordering::Relaxed) {
                    log.write_all(&[b'y'; 8192])?;
                }
                Ok(())
            })
        };

        let captured = capture_tree(&root, &staged, &WalkOptions::default(), &CancellationToken::new());
        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap()?;
        captured?;

        let decoded = zstd::decode_all(File::open(&staged)?)?;
        let mut tar = tar::Archive::new(decoded.as_slice());
        let mut names = Vec::new();
        for entry in tar.entries()? {
            let mut entry = entry?;
            let name = entry.path()?.to_string_lossy().into_owned();
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            assert_eq!(content.len() as u64, entry.header().size()?);
            if name == "z.txt" {
                assert_eq!(content, b"last entry");
            }
            names.push(name);
        }
        assert_eq!(names, vec!["a.log", "z.txt"]);
        Ok(())
    }

    #[test]
    fn test_cancelled_capture_is_interrupted() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("repo");
        fs::create_dir_all(&root)?;
        fs::write(root.join("a"), b"1")?;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = capture_tree(&root, &temp_dir.path().join("out"), &WalkOptions::default(), &cancel).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        Ok(())
    }
}
