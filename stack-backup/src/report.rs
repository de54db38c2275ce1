//! Human-readable output for the CLI commands.
//!
//! Everything here returns a `String`; printing is left to `main`.

use crate::archive::{ArchiveStatus, StoredArchive};
use crate::runner::{RunReport, RunStatus, TargetState};
use crate::verify::{ArtifactVerdict, VerificationReport};
use chrono::{DateTime, TimeDelta, Utc};
use std::fmt::Write;
use std::path::Path;

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

/// Format an age as `3d 4h 5m`, dropping zero parts
pub fn format_age(age: TimeDelta) -> String {
    let total = age.num_seconds();
    let sign = if total < 0 { "-" } else { "" };
    let total = total.unsigned_abs();
    let (days, rem) = (total / 86_400, total % 86_400);
    let (hours, rem) = (rem / 3_600, rem % 3_600);
    let (minutes, seconds) = (rem / 60, rem % 60);

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 {
        parts.push(format!("{}m", minutes));
    }
    if seconds > 0 || parts.is_empty() {
        parts.push(format!("{}s", seconds));
    }
    format!("{}{}", sign, parts.join(" "))
}

/// Filesystem capacity of the archive root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageUsage {
    pub total: u64,
    pub available: u64,
}

impl StorageUsage {
    pub fn of(path: &Path) -> Option<Self> {
        let stat = nix::sys::statvfs::statvfs(path).ok()?;
        let fragment = stat.fragment_size() as u64;
        Some(Self {
            total: stat.blocks() as u64 * fragment,
            available: stat.blocks_available() as u64 * fragment,
        })
    }
}

/// An archive as shown by `list`; status is None when the manifest is unreadable
#[derive(Debug, Clone)]
pub struct ListedArchive {
    pub stored: StoredArchive,
    pub status: Option<ArchiveStatus>,
}

pub fn render_run(report: &RunReport) -> String {
    let mut out = String::new();

    if report.status == RunStatus::Skipped {
        let _ = writeln!(out, "Another backup run is in progress; nothing done.");
        return out;
    }

    let _ = writeln!(out, "=== Targets ===");
    let _ = writeln!(out, "{:<24} {:<9} {:<7} {:>10}  {}", "Target", "Kind", "Result", "Size", "Detail");
    let _ = writeln!(out, "{}", "-".repeat(72));
    for target in &report.targets {
        let size = target.size.map(format_bytes).unwrap_or_else(|| "-".to_string());
        let detail = match target.state {
            TargetState::Captured => target
                .checksum
                .as_ref()
                .map(|c| c.short().to_string())
                .unwrap_or_default(),
            TargetState::Failed | TargetState::Fatal => target.error.clone().unwrap_or_default(),
        };
        let _ = writeln!(
            out,
            "{:<24} {:<9} {:<7} {:>10}  {}",
            target.name,
            target.kind.to_string(),
            target.state.to_string(),
            size,
            detail
        );
    }

    let _ = writeln!(out);
    if let Some(archive) = &report.archive {
        let _ = writeln!(
            out,
            "Archive: {} ({})",
            archive.path.display(),
            format_bytes(archive.size)
        );
    }
    if let Some(verification) = &report.verification {
        let failures = verification.failures().count();
        if failures == 0 {
            let _ = writeln!(out, "Self-check: pass");
        } else {
            let _ = writeln!(out, "Self-check: {} artifact(s) FAILED", failures);
        }
    }
    if let Some(retention) = &report.retention {
        let _ = writeln!(
            out,
            "Retention: kept {}, deleted {}, failed {}",
            retention.plan.keep.len(),
            retention.removed.len(),
            retention.failed.len()
        );
    }
    if let Some(failure) = &report.failure {
        let _ = writeln!(out, "Failed at {}", failure);
    }
    let _ = writeln!(
        out,
        "Status: {} ({:.1}s)",
        report.status,
        report.duration.as_secs_f64()
    );
    out
}

pub fn render_list(root: &Path, usage: Option<StorageUsage>, archives: &[ListedArchive], now: DateTime<Utc>) -> String {
    let mut out = String::new();
    let used: u64 = archives.iter().map(|a| a.stored.size).sum();

    let _ = writeln!(out, "=== Backup Storage ===");
    let _ = writeln!(out, "- path: {}", root.display());
    match usage {
        Some(usage) => {
            let _ = writeln!(out, "- total: {}", format_bytes(usage.total));
            let _ = writeln!(out, "- available: {}", format_bytes(usage.available));
        }
        None => {
            let _ = writeln!(out, "- total: unknown");
        }
    }
    let _ = writeln!(out, "- used by backups: {}", format_bytes(used));

    if archives.is_empty() {
        let _ = writeln!(out, "\nNo backups present.");
        return out;
    }

    let _ = writeln!(out, "\n=== Stored Archives ===");
    let _ = writeln!(
        out,
        "{:<24} {:<21} {:<16} {:<10} {:>10}",
        "Archive", "Captured (UTC)", "Age", "Status", "Size"
    );
    let _ = writeln!(out, "{}", "-".repeat(85));
    for archive in archives {
        let id = &archive.stored.id;
        let status = archive
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unreadable".to_string());
        let _ = writeln!(
            out,
            "{:<24} {:<21} {:<16} {:<10} {:>10}",
            id.as_str(),
            id.created().format("%Y-%m-%d %H:%M:%S").to_string(),
            format_age(now - id.created()),
            status,
            format_bytes(archive.stored.size)
        );
    }
    out
}

pub fn render_verification(report: &VerificationReport) -> String {
    let mut out = String::new();
    let manifest = &report.manifest;

    let _ = writeln!(out, "Archive: {}", report.archive.display());
    let _ = writeln!(
        out,
        "Created: {} on {} ({})",
        manifest.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        manifest.host,
        manifest.status
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "{:<24} {:<34} {:<13} {}", "Target", "Entry", "Verdict", "Detail");
    let _ = writeln!(out, "{}", "-".repeat(84));
    for check in &report.artifacts {
        let detail = match &check.verdict {
            ArtifactVerdict::Pass => String::new(),
            ArtifactVerdict::Mismatch {
                expected,
                actual,
                expected_size,
                actual_size,
            } => format!(
                "expected {} ({} B), got {} ({} B)",
                expected.short(),
                expected_size,
                actual.short(),
                actual_size
            ),
            ArtifactVerdict::Missing => "listed in manifest, not stored".to_string(),
            ArtifactVerdict::NotCaptured { error } => error.clone(),
            ArtifactVerdict::Unexpected => "stored, not in manifest".to_string(),
        };
        let _ = writeln!(
            out,
            "{:<24} {:<34} {:<13} {}",
            check.target,
            check.entry.as_deref().unwrap_or("-"),
            check.verdict.label(),
            detail
        );
    }

    let _ = writeln!(out);
    let failures = report.failures().count();
    if failures == 0 {
        let _ = writeln!(out, "Result: PASS");
    } else {
        let _ = writeln!(out, "Result: FAIL ({} artifact(s))", failures);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveId;
    use chrono::TimeZone;
    use std::path::PathBuf;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(TimeDelta::zero()), "0s");
        assert_eq!(format_age(TimeDelta::seconds(59)), "59s");
        assert_eq!(format_age(TimeDelta::minutes(90)), "1h 30m");
        assert_eq!(format_age(TimeDelta::days(3) + TimeDelta::seconds(5)), "3d 5s");
        assert_eq!(format_age(TimeDelta::minutes(-2)), "-2m");
    }

    #[test]
    fn test_render_list_newest_first_with_usage() {
        let now = Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap();
        let archive = |id: &str, size: u64, status| ListedArchive {
            stored: StoredArchive {
                id: ArchiveId::parse(id).unwrap(),
                path: PathBuf::from(format!("/srv/backups/stack-backup-{}.tar", id)),
                size,
            },
            status,
        };
        let archives = vec![
            archive("20261016T114500Z", 2048, Some(ArchiveStatus::Complete)),
            archive("20261015T120000Z", 1024, None),
        ];
        let usage = StorageUsage {
            total: 10 * 1024 * 1024,
            available: 4 * 1024 * 1024,
        };

        let out = render_list(Path::new("/srv/backups"), Some(usage), &archives, now);
        assert!(out.contains("- used by backups: 3.0 KiB"));
        assert!(out.contains("- available: 4.0 MiB"));

        let first = out.find("20261016T114500Z").unwrap();
        let second = out.find("20261015T120000Z").unwrap();
        assert!(first < second);
        assert!(out.contains("15m"));
        assert!(out.contains("1d"));
        assert!(out.contains("unreadable"));
    }

    #[test]
    fn test_render_list_empty() {
        let out = render_list(Path::new("/srv/backups"), None, &[], Utc::now());
        assert!(out.contains("No backups present."));
    }
}
