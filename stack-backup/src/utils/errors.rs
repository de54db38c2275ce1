//! Error taxonomy for backup runs.
//!
//! `BackupError` covers everything that stops an operation. `DumpError` is
//! scoped to one target and normally only degrades the archive.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capture of required target '{target}' failed: {source}")]
    RequiredTarget {
        target: String,
        #[source]
        source: DumpError,
    },

    #[error("Archive write error: {0}")]
    ArchiveWrite(String),

    #[error("Verification error: {0}")]
    Verification(String),

    #[error("Retention error: {0}")]
    Retention(String),

    #[error("Archive not found: {0}")]
    ArchiveNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackupError {
    /// Wrap an I/O failure that happened while assembling an archive.
    pub fn archive_write(context: &str, err: std::io::Error) -> Self {
        BackupError::ArchiveWrite(format!("{}: {}", context, err))
    }
}

/// Failure to capture a single target.
#[derive(Error, Debug)]
pub enum DumpError {
    #[error("`{program}` exited with {status}: {stderr}")]
    CommandFailed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("Failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{0}` produced no output")]
    EmptyOutput(String),

    #[error("Source not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BackupError>;
