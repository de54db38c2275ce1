//! Tiered retention.
//!
//! Every tier cuts time into fixed buckets of its width, counted from the
//! Unix epoch, and keeps the newest archive of each occupied bucket that lies
//! within the tier's span. An archive survives if it represents a bucket in
//! at least one tier. Planning is pure; `prune` applies a plan to the archive
//! directory.

use crate::archive::{ArchiveId, ArchiveStore};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::{info, warn};

/// How far back a tier reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Span {
    Bounded(TimeDelta),
    Unbounded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tier {
    pub bucket_width: TimeDelta,
    pub span: Span,
}

impl Tier {
    pub fn new(bucket_width: TimeDelta, span: Span) -> Self {
        Self { bucket_width, span }
    }

    /// Bucket of an archive created at `created`, or None if the tier no
    /// longer reaches it at `now`. The outer edge of the span is inclusive.
    fn bucket(&self, created: DateTime<Utc>, now: DateTime<Utc>) -> Option<i64> {
        if let Span::Bounded(span) = self.span {
            if now - created > span {
                return None;
            }
        }
        let width = self.bucket_width.num_milliseconds().max(1);
        Some(created.timestamp_millis().div_euclid(width))
    }
}

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    tiers: Vec<Tier>,
}

/// Outcome of planning: both lists newest first
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetentionPlan {
    pub keep: Vec<ArchiveId>,
    pub delete: Vec<ArchiveId>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetentionPolicy {
    pub fn new(tiers: Vec<Tier>) -> Self {
        Self { tiers }
    }

    /// 15 min for 2 h, 30 min for a day, daily for two weeks, every five
    /// days for a month, then monthly forever.
    pub fn standard() -> Self {
        Self::new(vec![
            Tier::new(TimeDelta::minutes(15), Span::Bounded(TimeDelta::hours(2))),
            Tier::new(TimeDelta::minutes(30), Span::Bounded(TimeDelta::hours(24))),
            Tier::new(TimeDelta::days(1), Span::Bounded(TimeDelta::days(14))),
            Tier::new(TimeDelta::days(5), Span::Bounded(TimeDelta::days(30))),
            Tier::new(TimeDelta::days(30), Span::Unbounded),
        ])
    }

    /// Decide which archives to keep at `now`.
    ///
    /// Archives dated after `now` (clock skew) are kept and do not compete
    /// for buckets. Within a bucket the greatest id wins, so equal
    /// timestamps resolve by id.
    pub fn plan(&self, archives: &[ArchiveId], now: DateTime<Utc>) -> RetentionPlan {
        let mut keep: BTreeSet<&ArchiveId> = archives.iter().filter(|id| id.created() > now).collect();

        for tier in &self.tiers {
            let mut representatives: HashMap<i64, &ArchiveId> = HashMap::new();
            for id in archives.iter().filter(|id| id.created() <= now) {
                let Some(bucket) = tier.bucket(id.created(), now) else {
                    continue;
                };
                representatives
                    .entry(bucket)
                    .and_modify(|current| {
                        if id > *current {
                            *current = id;
                        }
                    })
                    .or_insert(id);
            }
            keep.extend(representatives.into_values());
        }

        let mut plan = RetentionPlan::default();
        let mut sorted: Vec<&ArchiveId> = archives.iter().collect();
        sorted.sort_by(|a, b| b.cmp(a));
        sorted.dedup();
        for id in sorted {
            if keep.contains(id) {
                plan.keep.push(id.clone());
            } else {
                plan.delete.push(id.clone());
            }
        }
        plan
    }
}

/// What a prune pass did
#[derive(Debug, Clone, Default)]
pub struct PruneOutcome {
    pub plan: RetentionPlan,
    pub removed: Vec<ArchiveId>,
    /// Deletions that failed; they are retried by the next run
    pub failed: Vec<(ArchiveId, String)>,
}

/// Plan against the archives on disk and delete what falls out.
pub fn prune(store: &ArchiveStore, policy: &RetentionPolicy, now: DateTime<Utc>) -> Result<PruneOutcome> {
    let ids: Vec<ArchiveId> = store.list()?.into_iter().map(|a| a.id).collect();
    let plan = policy.plan(&ids, now);
    Ok(apply(store, plan))
}

fn apply(store: &ArchiveStore, plan: RetentionPlan) -> PruneOutcome {
    let kept: Vec<&str> = plan.keep.iter().map(|id| id.as_str()).collect();
    info!("Retention keeps {} archives: {}", kept.len(), kept.join(", "));

    let mut removed = Vec::new();
    let mut failed = Vec::new();
    for id in &plan.delete {
        match store.remove(id) {
            Ok(()) => {
                info!("Retention deleted {}", id);
                removed.push(id.clone());
            }
            Err(e) => {
                let err = BackupError::Retention(format!("failed to delete {}: {}", id, e));
                warn!("{}", err);
                failed.push((id.clone(), e.to_string()));
            }
        }
    }

    PruneOutcome { plan, removed, failed }
}
