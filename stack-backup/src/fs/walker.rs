//! Directory traversal for in-process tree captures.
//!
//! Entries are reported in walk order with their path relative to the root.
//! Excluded directories are pruned, so nothing below them is visited.

use std::fs::FileType;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// File name patterns: `name`, `*suffix` or `prefix*`
    pub exclude_patterns: Vec<String>,

    /// Absolute paths to skip
    pub exclude_paths: Vec<PathBuf>,
}

/// Information about an entry discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// Type of the entry itself; links are reported, never resolved
    pub file_type: FileType,
}

impl FileInfo {
    fn from_entry(entry: &DirEntry, root: &Path) -> Self {
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        Self {
            path,
            relative_path,
            file_type: entry.file_type(),
        }
    }
}

/// Walk a directory tree, calling `callback` for every entry below `root`.
///
/// Entries that vanish or cannot be read mid-walk are logged and skipped;
/// a live tree is expected to change underneath us. An error returned by
/// the callback stops the walk.
pub fn walk_directory_with_callback<F>(root: &Path, options: &WalkOptions, mut callback: F) -> io::Result<()>
where
    F: FnMut(&FileInfo) -> io::Result<()>,
{
    if !root.exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} does not exist", root.display()),
        ));
    }

    let entries = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !should_exclude(entry, options));

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };

        callback(&FileInfo::from_entry(&entry, root))?;
    }

    Ok(())
}

/// Check if a directory entry should be excluded
fn should_exclude(entry: &DirEntry, options: &WalkOptions) -> bool {
    if options.exclude_paths.iter().any(|p| entry.path() == p) {
        return true;
    }

    let file_name = entry.file_name().to_string_lossy();
    options
        .exclude_patterns
        .iter()
        .any(|pattern| matches_pattern(&file_name, pattern))
}

fn matches_pattern(name: &str, pattern: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix('*') {
        name.ends_with(suffix)
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        name.starts_with(prefix)
    } else {
        name == pattern
    }
}
