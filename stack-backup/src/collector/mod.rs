//! Dump collector - turns one target into one staged artifact.
//!
//! Command targets stream the stdout of an external process into the
//! staging area, database dumps are zstd-compressed on the way. Path
//! targets are copied (files) or packed in-process as tar.zst (directories).
//! The checksum and size come out of the same pass that writes the stream.

pub mod tree;

use crate::archive::Staging;
use crate::checksum::{Checksum, HashingWriter};
use crate::fs::walker::WalkOptions;
use crate::report::format_bytes;
use crate::targets::{Locator, Target, TargetKind};
use crate::utils::errors::DumpError;
use async_compression::tokio::write::ZstdEncoder;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lines of command stderr kept for the error message
const STDERR_TAIL_LINES: usize = 5;

/// A captured target, staged and hashed
#[derive(Debug, Clone)]
pub struct Artifact {
    pub target: String,
    pub kind: TargetKind,
    /// Path inside the archive
    pub entry: String,
    /// Path of the stream in the staging area
    pub staged: PathBuf,
    pub checksum: Checksum,
    pub size: u64,
}

/// How far a target failure reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Recorded in the manifest; the archive is still built
    Degraded,
    /// No archive is built
    RunFatal,
}

#[derive(Debug)]
pub enum TargetOutcome {
    Captured(Artifact),
    Failed { error: DumpError, severity: Severity },
}

/// Resolved source of a target's bytes
enum Source<'a> {
    Command(&'a [String]),
    File(&'a Path),
    Tree(&'a Path),
}

/// Captures targets one at a time under a per-target time ceiling.
#[derive(Debug, Clone)]
pub struct Collector {
    timeout: Duration,
}

impl Collector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Capture one target into the staging area. Never fails the run by
    /// itself; the outcome says what happened.
    pub async fn collect(&self, target: &Target, staging: &Staging) -> TargetOutcome {
        let start = Instant::now();
        info!("Capturing {} '{}'", target.kind, target.name);

        match self.capture(target, staging).await {
            Ok(artifact) => {
                info!(
                    "Captured '{}' as {}: {} ({}) in {:.1}s",
                    target.name,
                    artifact.entry,
                    format_bytes(artifact.size),
                    artifact.checksum.short(),
                    start.elapsed().as_secs_f64()
                );
                TargetOutcome::Captured(artifact)
            }
            Err(error) => {
                let severity = if target.required {
                    Severity::RunFatal
                } else {
                    Severity::Degraded
                };
                error!("Capture of '{}' failed: {}", target.name, error);
                TargetOutcome::Failed { error, severity }
            }
        }
    }

    async fn capture(&self, target: &Target, staging: &Staging) -> Result<Artifact, DumpError> {
        let source = match &target.locator {
            Locator::Command(argv) => Source::Command(argv),
            Locator::Path(path) => match tokio::fs::metadata(path).await {
                Ok(metadata) if metadata.is_dir() => Source::Tree(path),
                Ok(_) => Source::File(path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(DumpError::NotFound(path.clone()));
                }
                Err(e) => return Err(e.into()),
            },
        };

        let entry = entry_name(&target.name, target.kind, &source);
        let staged = staging.prepare(&entry)?;
        debug!("Staging '{}' at {}", target.name, staged.display());

        let result = match source {
            Source::Command(argv) => {
                let compress = target.kind == TargetKind::Database;
                match tokio::time::timeout(self.timeout, capture_command(argv, &staged, compress)).await {
                    Ok(result) => result,
                    // Dropping the capture future kills the child
                    Err(_) => Err(DumpError::TimedOut(self.timeout)),
                }
            }
            Source::File(path) => {
                match tokio::time::timeout(self.timeout, copy_file(path, &staged)).await {
                    Ok(result) => result,
                    Err(_) => Err(DumpError::TimedOut(self.timeout)),
                }
            }
            Source::Tree(root) => self.capture_tree(target, root, &staged).await,
        };

        match result {
            Ok((checksum, size)) => Ok(Artifact {
                target: target.name.clone(),
                kind: target.kind,
                entry,
                staged,
                checksum,
                size,
            }),
            Err(e) => {
                discard(&staged).await;
                Err(e)
            }
        }
    }

    async fn capture_tree(&self, target: &Target, root: &Path, staged: &Path) -> Result<(Checksum, u64), DumpError> {
        let options = WalkOptions {
            exclude_patterns: target.excludes.clone(),
            exclude_paths: target.exclude_paths.clone(),
            ..WalkOptions::default()
        };
        let root = root.to_path_buf();
        let staged = staged.to_path_buf();
        run_blocking(self.timeout, move |cancel| tree::capture_tree(&root, &staged, &options, cancel)).await
    }
}

/// Run blocking `work` under `timeout`. On expiry the token passed to the
/// work is cancelled and `TimedOut` is returned at once; the blocking thread
/// winds down on its own, so a read stuck in the kernel cannot hold up the
/// run.
async fn run_blocking<T, F>(timeout: Duration, work: F) -> Result<T, DumpError>
where
    T: Send + 'static,
    F: FnOnce(&CancellationToken) -> io::Result<T> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let handle = {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || work(&cancel))
    };

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(e))) => Err(e.into()),
        Ok(Err(join_err)) => Err(DumpError::Io(io::Error::other(join_err))),
        Err(_) => {
            cancel.cancel();
            warn!("Blocking capture exceeded {:?}, abandoning it", timeout);
            Err(DumpError::TimedOut(timeout))
        }
    }
}

/// Archive entry for a target, by kind and source.
fn entry_name(name: &str, kind: TargetKind, source: &Source<'_>) -> String {
    match (source, kind) {
        (Source::Command(_), TargetKind::Database) => format!("databases/{}.sql.zst", name),
        (Source::Command(_), TargetKind::VolumeOrTree) => format!("volumes/{}.tar.gz", name),
        (Source::Command(_), TargetKind::SecretFile) => format!("secrets/{}.tar.gz", name),
        (Source::File(_), TargetKind::SecretFile) => format!("secrets/{}", name),
        (Source::Tree(_), TargetKind::SecretFile) => format!("secrets/{}.tar.zst", name),
        (Source::File(_), _) => format!("files/{}", name),
        (Source::Tree(_), _) => format!("trees/{}.tar.zst", name),
    }
}

/// Run `argv` and stream its stdout into `staged`.
async fn capture_command(argv: &[String], staged: &Path, compress: bool) -> Result<(Checksum, u64), DumpError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| DumpError::Io(io::Error::new(io::ErrorKind::InvalidInput, "empty command")))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| DumpError::Spawn {
            program: program.clone(),
            source,
        })?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("child stdout not captured"))?;
    let stderr_task = tokio::spawn(stderr_tail(child.stderr.take()));

    let file = tokio::fs::File::create(staged).await?;
    let (raw_bytes, file, checksum, size) = if compress {
        let mut encoder = ZstdEncoder::new(HashingWriter::new(file));
        let raw = tokio::io::copy(&mut stdout, &mut encoder).await?;
        encoder.shutdown().await?;
        let (file, checksum, size) = encoder.into_inner().finish();
        (raw, file, checksum, size)
    } else {
        let mut writer = HashingWriter::new(file);
        let raw = tokio::io::copy(&mut stdout, &mut writer).await?;
        writer.shutdown().await?;
        let (file, checksum, size) = writer.finish();
        (raw, file, checksum, size)
    };
    file.sync_all().await?;

    let status = child.wait().await?;
    let stderr = stderr_task.await.unwrap_or_default();

    if !status.success() {
        return Err(DumpError::CommandFailed {
            program: program.clone(),
            status: status.to_string(),
            stderr,
        });
    }
    if raw_bytes == 0 {
        return Err(DumpError::EmptyOutput(program.clone()));
    }
    if !stderr.is_empty() {
        debug!("`{}` stderr: {}", program, stderr);
    }

    Ok((checksum, size))
}

/// Last lines of a child's stderr, joined for an error message
async fn stderr_tail(stderr: Option<ChildStderr>) -> String {
    let Some(stderr) = stderr else {
        return String::new();
    };
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("; ")
}

/// Byte-for-byte copy of a single file
async fn copy_file(source: &Path, staged: &Path) -> Result<(Checksum, u64), DumpError> {
    let mut input = match tokio::fs::File::open(source).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(DumpError::NotFound(source.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    let mut writer = HashingWriter::new(tokio::fs::File::create(staged).await?);
    tokio::io::copy(&mut input, &mut writer).await?;
    writer.shutdown().await?;
    let (file, checksum, size) = writer.finish();
    file.sync_all().await?;
    Ok((checksum, size))
}

async fn discard(staged: &Path) {
    if let Err(e) = tokio::fs::remove_file(staged).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", staged.display(), e);
        }
    }
}
