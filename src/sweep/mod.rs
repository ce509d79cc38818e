//! Eviction sweep: discard held messages past the retention window, purge
//! stale autoresponse counters, and tell owners what is still waiting.

pub mod summary;

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info};

use crate::error::{ConfigError, ModerationError};
use crate::requests::manager::{ListManager, LockedList};
use crate::requests::model::{Decision, RequestKind, ResolveOptions};

pub use summary::{Summary, pending_summary};

/// What one sweep did to one list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub list: String,
    pub discarded: usize,
    pub evicted_autoresponses: usize,
    pub remaining: usize,
}

/// Sweep one locked list and commit if anything changed.
pub async fn evict(list: &mut LockedList) -> Result<SweepReport, ModerationError> {
    let now = list.services().clock.now();
    let mut discarded = 0;

    let max_days = list.config().max_days_to_hold;
    if max_days > 0 {
        let cutoff = now - Duration::days(i64::from(max_days));
        let expired: Vec<u64> = list
            .list_of_kind(RequestKind::HeldMessage)
            .into_iter()
            .filter(|id| list.get(*id).is_ok_and(|r| r.created_at < cutoff))
            .collect();
        for id in expired {
            match list
                .resolve(id, Decision::Discard, &ResolveOptions::default())
                .await
            {
                Ok(_) => discarded += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!(list = %list.name(), id, error = %e, "Expired request skipped"),
            }
        }
    }

    let midnight = list.services().clock.midnight(now);
    let evicted_autoresponses = list.evict_autoresponses(midnight);

    if list.has_changes() {
        list.commit().await?;
    }

    let report = SweepReport {
        list: list.name().to_string(),
        discarded,
        evicted_autoresponses,
        remaining: list.pending_count(),
    };
    info!(
        list = %report.list,
        discarded = report.discarded,
        evicted_autoresponses = report.evicted_autoresponses,
        remaining = report.remaining,
        "Sweep complete"
    );
    Ok(report)
}

/// Sweep every list and send each owner a pending summary when there is
/// anything to report. A list that fails is logged and skipped.
pub async fn check_and_notify(manager: &ListManager) -> Vec<SweepReport> {
    let mut reports = Vec::new();
    for name in manager.list_names() {
        let mut list = match manager.lock(&name).await {
            Ok(list) => list,
            Err(e) => {
                error!(list = %name, error = %e, "Failed to lock list for sweep");
                continue;
            }
        };
        let report = match evict(&mut list).await {
            Ok(report) => report,
            Err(e) => {
                error!(list = %name, error = %e, "Sweep failed");
                continue;
            }
        };
        let summary = pending_summary(&list, report.discarded);
        let owner = list.config().owner_address.clone();
        drop(list);
        if let Some(summary) = summary {
            manager
                .services()
                .notifier
                .notify(&owner, &summary.subject, &summary.body)
                .await;
        }
        reports.push(report);
    }
    reports
}

/// Parse a cron expression and compute the next sweep time after now.
pub fn next_sweep(schedule: &str) -> Result<Option<DateTime<Utc>>, ConfigError> {
    let schedule = cron::Schedule::from_str(schedule).map_err(|e| ConfigError::InvalidValue {
        key: "sweep_cron".to_string(),
        message: e.to_string(),
    })?;
    Ok(schedule.upcoming(Utc).next())
}

/// Run [`check_and_notify`] on a cron schedule until the task is dropped.
pub fn spawn_sweep_task(
    manager: Arc<ListManager>,
    schedule: &str,
) -> Result<tokio::task::JoinHandle<()>, ConfigError> {
    let schedule = cron::Schedule::from_str(schedule).map_err(|e| ConfigError::InvalidValue {
        key: "sweep_cron".to_string(),
        message: e.to_string(),
    })?;

    Ok(tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                info!("Sweep schedule has no further fire times");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            debug!(next = %next, "Next sweep scheduled");
            tokio::time::sleep(wait).await;
            check_and_notify(&manager).await;
        }
    }))
}
