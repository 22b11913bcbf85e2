//! Report batching and coverage reconciliation.
//!
//! One "window" is the unit of work against the external report API: a run of
//! contiguous claimed hours, requested as a single report. The batcher claims
//! the window, awaits the executor for the full creation/poll/download cycle,
//! then reconciles what came back against what was asked for:
//!
//! - covered hours advance to `DOWNLOADED` then `APPLIED`
//! - uncovered hours stay `REQUESTED`; partial coverage is expected, not
//!   failure; the next run's reclaim sweep makes them claimable again
//! - an executor error marks every hour of the window `FAILED` with its own
//!   cooldown, so hours from the same failed batch retry independently
//!
//! Executor errors never propagate out of this module; only storage failures
//! do.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use hourglass_core::{Clock, ReportError, ReportExecutor, ReportRequest};

use crate::ledger::{LedgerEntry, LedgerStore, StoreError};

/// Burst and backoff settings for one run.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub burst_enabled: bool,
    pub burst_window_hours: usize,
    pub failure_cooldown_minutes: i64,
    pub quota_cooldown_minutes: i64,
}

impl BatchSettings {
    /// Maximum hours one report may cover under these settings.
    pub fn max_window_hours(&self) -> usize {
        if self.burst_enabled {
            self.burst_window_hours.max(1)
        } else {
            1
        }
    }
}

/// Result of executing one window.
#[derive(Debug, Default)]
pub struct WindowOutcome {
    pub hours_applied: usize,
    pub hours_uncovered: usize,
    pub hours_failed: usize,
    pub quota_exhausted: bool,
}

/// Claim the next window of up to `max_hours` contiguous hours.
///
/// Claims run oldest-first, so successive claims return increasing hours; a
/// jump of more than one hour means the gap is already ingested and the
/// window must stop there. The entry that broke contiguity is already
/// claimed, so it is handed back as the seed of the next window rather than
/// dropped.
pub async fn claim_window(
    store: &dyn LedgerStore,
    namespace: &str,
    now: DateTime<Utc>,
    max_hours: usize,
    seed: Option<LedgerEntry>,
) -> Result<(Vec<LedgerEntry>, Option<LedgerEntry>), StoreError> {
    let mut window: Vec<LedgerEntry> = seed.into_iter().collect();

    while window.len() < max_hours {
        let Some(entry) = store.claim_next_missing_hour(namespace, now).await? else {
            break;
        };

        if let Some(last) = window.last() {
            if entry.hour_start != last.hour_start + Duration::hours(1) {
                return Ok((window, Some(entry)));
            }
        }
        window.push(entry);
    }

    Ok((window, None))
}

/// Execute one claimed window and reconcile its coverage.
pub async fn execute_window(
    store: &dyn LedgerStore,
    executor: &dyn ReportExecutor,
    clock: &dyn Clock,
    namespace: &str,
    window: &[LedgerEntry],
    settings: &BatchSettings,
) -> Result<WindowOutcome, StoreError> {
    let first = window.first().expect("window is never empty");
    let last = window.last().expect("window is never empty");

    let request = ReportRequest {
        namespace: namespace.to_string(),
        start: first.hour_start,
        end: last.hour_start + Duration::hours(1),
        hours: window.iter().map(|e| e.hour_start).collect(),
    };

    info!(
        namespace,
        start = %request.start,
        end = %request.end,
        hours = window.len(),
        "requesting report window"
    );

    let mut outcome = WindowOutcome::default();

    match executor.execute(request).await {
        Ok(report) => {
            let now = clock.now();
            for entry in window {
                if report.covered_hours.contains(&entry.hour_start) {
                    store
                        .mark_downloaded(namespace, entry.hour_start, &report.report_id, now)
                        .await?;
                    store.mark_applied(namespace, entry.hour_start, now).await?;
                    outcome.hours_applied += 1;
                } else {
                    // Absence of data for a requested hour is not an error;
                    // the row stays REQUESTED for a later run.
                    outcome.hours_uncovered += 1;
                }
            }

            info!(
                namespace,
                report_id = %report.report_id,
                applied = outcome.hours_applied,
                uncovered = outcome.hours_uncovered,
                "report window reconciled"
            );
        }
        Err(err) => {
            let cooldown_minutes = match &err {
                ReportError::QuotaExceeded(_) => {
                    outcome.quota_exhausted = true;
                    settings.quota_cooldown_minutes
                }
                ReportError::Transient(_) => settings.failure_cooldown_minutes,
            };

            warn!(
                namespace,
                hours = window.len(),
                cooldown_minutes,
                error = %err,
                "report window failed; backing off every hour in it"
            );

            // Each hour gets its own FAILED row so the hours of a failed
            // batch retry independently from here on.
            let error_text = err.to_string();
            let now = clock.now();
            for entry in window {
                store
                    .mark_failed(
                        namespace,
                        entry.hour_start,
                        &error_text,
                        cooldown_minutes,
                        now,
                    )
                    .await?;
                outcome.hours_failed += 1;
            }
        }
    }

    Ok(outcome)
}
