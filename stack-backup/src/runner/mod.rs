//! One backup cycle.
//!
//! enumerate -> lock -> sweep -> capture -> seal -> verify -> prune
//!
//! Capture failures are collected per target and reduced to a single
//! verdict once every target has been attempted. Only a run-fatal target, an
//! archive write failure or a failed self-check stop the cycle early, and in
//! every case retention does not run.

pub mod lock;

use crate::archive::{Archive, ArchiveStatus, ArchiveStore, Manifest, ManifestEntry};
use crate::checksum::Checksum;
use crate::collector::{Collector, Severity, TargetOutcome};
use crate::config::Config;
use crate::retention::{self, PruneOutcome, RetentionPolicy};
use crate::targets::{self, TargetKind};
use crate::utils::errors::{BackupError, Result};
use crate::verify::{self, VerificationReport};
use chrono::Utc;
use lock::RunLock;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tracing::{error, info, warn};

pub const EXIT_OK: u8 = 0;
pub const EXIT_FATAL: u8 = 1;
pub const EXIT_DEGRADED: u8 = 2;
pub const EXIT_VERIFICATION_FAILED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Captured,
    Failed,
    /// Failed and required; aborts the run
    Fatal,
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetState::Captured => f.write_str("ok"),
            TargetState::Failed => f.write_str("failed"),
            TargetState::Fatal => f.write_str("FATAL"),
        }
    }
}

/// Outcome of one target, as shown in the run table
#[derive(Debug, Clone)]
pub struct TargetReport {
    pub name: String,
    pub kind: TargetKind,
    pub state: TargetState,
    pub entry: Option<String>,
    pub size: Option<u64>,
    pub checksum: Option<Checksum>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Complete,
    Degraded,
    /// Fatal error after the lock was taken; no archive
    Aborted,
    /// Archive written but its self-check failed; retention skipped
    VerificationFailed,
    /// Another run holds the lock
    Skipped,
}

impl RunStatus {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunStatus::Complete | RunStatus::Skipped => EXIT_OK,
            RunStatus::Degraded => EXIT_DEGRADED,
            RunStatus::Aborted => EXIT_FATAL,
            RunStatus::VerificationFailed => EXIT_VERIFICATION_FAILED,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Complete => "complete",
            RunStatus::Degraded => "degraded",
            RunStatus::Aborted => "aborted",
            RunStatus::VerificationFailed => "verification failed",
            RunStatus::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

#[derive(Debug)]
pub struct RunReport {
    pub status: RunStatus,
    pub targets: Vec<TargetReport>,
    pub archive: Option<Archive>,
    pub verification: Option<VerificationReport>,
    pub retention: Option<PruneOutcome>,
    /// Stage and error that ended the run early
    pub failure: Option<String>,
    pub duration: Duration,
}

impl RunReport {
    fn new(status: RunStatus, started: Instant) -> Self {
        Self {
            status,
            targets: Vec::new(),
            archive: None,
            verification: None,
            retention: None,
            failure: None,
            duration: started.elapsed(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.status.exit_code()
    }
}

/// Aggregate of all target outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Complete,
    Degraded,
    Fatal,
}

/// Reduce per-target states to the run verdict. Any fatal target wins,
/// then any failed one.
pub fn reduce(targets: &[TargetReport]) -> Verdict {
    targets.iter().fold(Verdict::Complete, |verdict, target| match (verdict, target.state) {
        (Verdict::Fatal, _) | (_, TargetState::Fatal) => Verdict::Fatal,
        (Verdict::Degraded, _) | (_, TargetState::Failed) => Verdict::Degraded,
        (Verdict::Complete, TargetState::Captured) => Verdict::Complete,
    })
}

/// Runs backup cycles against one configuration
pub struct Runner {
    config: Config,
    store: ArchiveStore,
    policy: RetentionPolicy,
}

impl Runner {
    pub fn new(config: Config) -> Self {
        let store = ArchiveStore::from_config(&config.storage);
        Self {
            config,
            store,
            policy: RetentionPolicy::standard(),
        }
    }

    pub fn store(&self) -> &ArchiveStore {
        &self.store
    }

    /// Execute one cycle.
    ///
    /// Errors before any target is captured (configuration, lock, staging)
    /// are returned as `Err`. Everything later is reported through the
    /// returned `RunReport` so the per-target table is always available.
    pub async fn run(&self) -> Result<RunReport> {
        let started = Instant::now();
        let targets = targets::enumerate(&self.config)?;

        self.store.ensure_root()?;
        let lock_path = self.store.lock_path();
        let Some(run_lock) = RunLock::try_acquire(&lock_path)? else {
            warn!(
                "Another run holds {} ({}), skipping",
                lock_path.display(),
                lock::holder(&lock_path).unwrap_or_else(|| "unknown holder".to_string())
            );
            return Ok(RunReport::new(RunStatus::Skipped, started));
        };

        let swept = self.store.sweep_stale()?;
        if swept > 0 {
            info!("Swept {} stale temporaries", swept);
        }

        let created_at = Utc::now();
        let id = self.store.next_id(created_at);
        info!(
            "Backup run {} started: {} targets into {}",
            id,
            targets.len(),
            self.store.root().display()
        );
        let staging = self.store.begin(id.clone())?;

        let collector = Collector::new(self.config.capture.timeout());
        let mut artifacts = Vec::new();
        let mut entries = Vec::with_capacity(targets.len());
        let mut reports = Vec::with_capacity(targets.len());
        let mut fatal: Option<BackupError> = None;

        for target in &targets {
            match collector.collect(target, &staging).await {
                TargetOutcome::Captured(artifact) => {
                    entries.push(ManifestEntry::captured(
                        &target.name,
                        target.kind,
                        &artifact.entry,
                        artifact.checksum.clone(),
                        artifact.size,
                    ));
                    reports.push(TargetReport {
                        name: target.name.clone(),
                        kind: target.kind,
                        state: TargetState::Captured,
                        entry: Some(artifact.entry.clone()),
                        size: Some(artifact.size),
                        checksum: Some(artifact.checksum.clone()),
                        error: None,
                    });
                    artifacts.push(artifact);
                }
                TargetOutcome::Failed { error, severity } => {
                    let state = match severity {
                        Severity::Degraded => TargetState::Failed,
                        Severity::RunFatal => TargetState::Fatal,
                    };
                    entries.push(ManifestEntry::failed(&target.name, target.kind, error.to_string()));
                    reports.push(TargetReport {
                        name: target.name.clone(),
                        kind: target.kind,
                        state,
                        entry: None,
                        size: None,
                        checksum: None,
                        error: Some(error.to_string()),
                    });
                    if state == TargetState::Fatal && fatal.is_none() {
                        fatal = Some(BackupError::RequiredTarget {
                            target: target.name.clone(),
                            source: error,
                        });
                    }
                }
            }
        }

        if reduce(&reports) == Verdict::Fatal {
            let reason = fatal
                .map(|e| e.to_string())
                .unwrap_or_else(|| "required target failed".to_string());
            error!("Backup run {} aborted at capture stage: {}", id, reason);
            let mut report = RunReport::new(RunStatus::Aborted, started);
            report.targets = reports;
            report.failure = Some(format!("capture: {}", reason));
            return Ok(report);
        }

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let manifest = Manifest::new(&id, created_at, host, entries);

        let sealed = blocking_under_lock(run_lock, move || staging.seal(&manifest, &artifacts))
            .await
            .map_err(|e| BackupError::ArchiveWrite(format!("archive task failed: {}", e)))
            .and_then(|(result, lock)| result.map(|archive| (archive, lock)));
        let (archive, _lock) = match sealed {
            Ok(sealed) => sealed,
            Err(e) => {
                error!("Backup run {} failed at archive stage: {}", id, e);
                let mut report = RunReport::new(RunStatus::Aborted, started);
                report.targets = reports;
                report.failure = Some(format!("archive: {}", e));
                return Ok(report);
            }
        };
        info!("Archive {} written ({} bytes)", archive.path.display(), archive.size);

        let mut report = RunReport::new(RunStatus::Complete, started);
        report.targets = reports;

        let path = archive.path.clone();
        let verified = tokio::task::spawn_blocking(move || verify::verify_archive(&path))
            .await
            .map_err(|e| BackupError::Verification(format!("verification task failed: {}", e)))
            .and_then(|result| result);
        let passed = match &verified {
            Ok(verification) => verification.passed(),
            Err(_) => false,
        };
        match verified {
            Ok(verification) => report.verification = Some(verification),
            Err(e) => report.failure = Some(format!("verify: {}", e)),
        }
        if !passed {
            error!(
                "Backup run {} failed at verify stage; archive {} kept, retention skipped",
                id,
                archive.path.display()
            );
            report.status = RunStatus::VerificationFailed;
            report.archive = Some(archive);
            report.duration = started.elapsed();
            return Ok(report);
        }

        match retention::prune(&self.store, &self.policy, Utc::now()) {
            Ok(outcome) => report.retention = Some(outcome),
            Err(e) => warn!("Retention skipped: {}", e),
        }

        report.status = match archive.manifest.status {
            ArchiveStatus::Complete => RunStatus::Complete,
            ArchiveStatus::Degraded => RunStatus::Degraded,
        };
        report.archive = Some(archive);
        report.duration = started.elapsed();

        info!(
            "Backup run {} finished: {} in {:.1}s",
            id,
            report.status,
            report.duration.as_secs_f64()
        );
        Ok(report)
    }
}

/// Run blocking `work` while it owns the run lock. The lock comes back when
/// the work ends and stays held by the blocking thread if the caller is
/// dropped first, so an interrupted seal cannot lose its `.partial` to the
/// sweep of an overlapping run.
async fn blocking_under_lock<T, F>(lock: RunLock, work: F) -> std::result::Result<(T, RunLock), JoinError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(move || (work(), lock)).await
}
