//! Repair / fill-window scheduling.
//!
//! A repair run scans a lookback window for hours that never made it to
//! `APPLIED`, batches them into report requests under a reports/runtime
//! budget, and reconciles the results, all while holding the namespace
//! worker lock so overlapping invocations (same process or not) cannot issue
//! duplicate requests.
//!
//! The run never blocks waiting for the lock and never sleeps on failure:
//! contention and backoff are returned as ledger/summary state, and the
//! caller's own scheduling loop decides when to invoke again.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use hourglass_core::{contiguous_windows, required_hours, Clock, ReportExecutor};

use crate::batcher::{claim_window, execute_window, BatchSettings};
use crate::ledger::{IngestStatus, LedgerEntry, LedgerStore, StoreError};

/// Lock refreshes allowed per run. A run that needs more than this has
/// outlived any sane runtime budget and must wind down instead of holding
/// the namespace indefinitely.
const MAX_LOCK_REFRESHES: u32 = 16;

/// Parameters of one repair invocation.
#[derive(Debug, Clone)]
pub struct RepairRequest {
    pub namespace: String,
    pub lookback_hours: i64,
    pub max_reports: usize,
    pub max_runtime: Duration,
    pub dry_run: bool,
    pub burst_enabled: bool,
    pub burst_window_hours: usize,
    /// Identity written into the worker lock; stale runs cannot release or
    /// refresh a lock they no longer own.
    pub owner: String,
    pub lock_ttl: Duration,
    pub failure_cooldown_minutes: i64,
    pub quota_cooldown_minutes: i64,
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoppedReason {
    Done,
    MaxReports,
    Timeout,
    LockBusy,
}

/// Structured result of one repair invocation. Always returned, even when
/// the run could not start (lock contention) or ended early.
#[derive(Debug, Clone, Serialize)]
pub struct RepairSummary {
    pub namespace: String,
    pub stopped_reason: StoppedReason,
    pub dry_run: bool,
    pub hours_targeted: usize,
    pub estimated_reports: usize,
    pub reports_created: usize,
    pub remaining_missing: usize,
    /// Set when any window failed on quota. The caller's scheduling loop
    /// should apply a namespace-wide cooldown before invoking again.
    pub quota_exhausted: bool,
}

#[derive(Debug, Error)]
pub enum RepairError {
    #[error("invalid repair configuration: {0}")]
    Configuration(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Run one repair pass over the lookback window.
pub async fn run_repair(
    store: &dyn LedgerStore,
    executor: &dyn ReportExecutor,
    clock: &dyn Clock,
    request: RepairRequest,
) -> Result<RepairSummary, RepairError> {
    validate(&request)?;

    let now = clock.now();
    let window_hours = required_hours(now, request.lookback_hours);
    let from = window_hours[0];
    let to = *window_hours.last().expect("validated lookback is non-empty");

    if request.dry_run {
        return dry_run_plan(store, &request, &window_hours, from, to, now).await;
    }

    if !store
        .acquire_lock(&request.namespace, &request.owner, request.lock_ttl, now)
        .await?
    {
        info!(
            namespace = %request.namespace,
            "worker lock busy; repair run not started"
        );
        return Ok(RepairSummary {
            namespace: request.namespace,
            stopped_reason: StoppedReason::LockBusy,
            dry_run: false,
            hours_targeted: 0,
            estimated_reports: 0,
            reports_created: 0,
            remaining_missing: 0,
            quota_exhausted: false,
        });
    }

    let result = repair_under_lock(store, executor, clock, &request, &window_hours, from, to).await;

    // The lock is released no matter how the run ended. A release failure is
    // logged but does not mask the run's own outcome: the lock self-heals at
    // its TTL.
    match store.release_lock(&request.namespace, &request.owner).await {
        Ok(true) => {}
        Ok(false) => warn!(
            namespace = %request.namespace,
            "worker lock no longer owned at release time"
        ),
        Err(e) => error!(
            namespace = %request.namespace,
            error = %e,
            "failed to release worker lock; it will expire on its own"
        ),
    }

    result
}

fn validate(request: &RepairRequest) -> Result<(), RepairError> {
    if request.lookback_hours <= 0 {
        return Err(RepairError::Configuration(format!(
            "lookback_hours must be positive, got {}",
            request.lookback_hours
        )));
    }
    if request.max_reports == 0 {
        return Err(RepairError::Configuration(
            "max_reports must be at least 1".to_string(),
        ));
    }
    if request.burst_enabled && request.burst_window_hours == 0 {
        return Err(RepairError::Configuration(
            "burst_window_hours must be at least 1 when burst is enabled".to_string(),
        ));
    }
    Ok(())
}

/// Hours a run would target, given the rows currently in the window.
///
/// Absent rows are missing by definition. Existing rows are targeted when
/// claimable now, or when stuck in `REQUESTED`/`DOWNLOADED`: those are
/// orphans the reclaim sweep turns claimable at the start of a real run.
fn targeted_hours(
    window_hours: &[DateTime<Utc>],
    entries: &[LedgerEntry],
    now: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let by_hour: std::collections::HashMap<DateTime<Utc>, &LedgerEntry> =
        entries.iter().map(|e| (e.hour_start, e)).collect();

    window_hours
        .iter()
        .copied()
        .filter(|hour| match by_hour.get(hour) {
            None => true,
            Some(entry) => {
                entry.is_claimable(now)
                    || matches!(
                        entry.status,
                        IngestStatus::Requested | IngestStatus::Downloaded
                    )
            }
        })
        .collect()
}

fn batch_settings(request: &RepairRequest) -> BatchSettings {
    BatchSettings {
        burst_enabled: request.burst_enabled,
        burst_window_hours: request.burst_window_hours,
        failure_cooldown_minutes: request.failure_cooldown_minutes,
        quota_cooldown_minutes: request.quota_cooldown_minutes,
    }
}

/// Compute the plan without mutating anything: no lock row, no inserted
/// hours, no reclaim sweep, no executor calls.
async fn dry_run_plan(
    store: &dyn LedgerStore,
    request: &RepairRequest,
    window_hours: &[DateTime<Utc>],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<RepairSummary, RepairError> {
    let entries = store.list_range(&request.namespace, from, to).await?;
    let targeted = targeted_hours(window_hours, &entries, now);
    let estimated =
        contiguous_windows(&targeted, batch_settings(request).max_window_hours()).len();

    let remaining_missing = window_hours.len()
        - entries
            .iter()
            .filter(|e| e.status == IngestStatus::Applied)
            .count();

    info!(
        namespace = %request.namespace,
        hours_targeted = targeted.len(),
        estimated_reports = estimated,
        "dry-run repair plan"
    );

    Ok(RepairSummary {
        namespace: request.namespace.clone(),
        stopped_reason: StoppedReason::Done,
        dry_run: true,
        hours_targeted: targeted.len(),
        estimated_reports: estimated,
        reports_created: 0,
        remaining_missing,
        quota_exhausted: false,
    })
}

async fn repair_under_lock(
    store: &dyn LedgerStore,
    executor: &dyn ReportExecutor,
    clock: &dyn Clock,
    request: &RepairRequest,
    window_hours: &[DateTime<Utc>],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<RepairSummary, RepairError> {
    let namespace = &request.namespace;
    let settings = batch_settings(request);
    let started = clock.now();

    // With the lock held, nothing else can be mid-request for this
    // namespace: every REQUESTED/DOWNLOADED row is an orphan from a crashed
    // run or a prior batch's partial coverage. Flip them claimable first.
    store.reclaim_abandoned(namespace, started).await?;
    store
        .ensure_hours_exist(namespace, window_hours, started)
        .await?;

    let entries = store.list_range(namespace, from, to).await?;
    let targeted = targeted_hours(window_hours, &entries, started);
    let estimated = contiguous_windows(&targeted, settings.max_window_hours()).len();

    info!(
        namespace,
        hours_targeted = targeted.len(),
        estimated_reports = estimated,
        max_reports = request.max_reports,
        "starting repair run"
    );

    let mut reports_created = 0usize;
    let mut quota_exhausted = false;
    let mut refreshes = 0u32;
    let mut last_lock_refresh = started;
    let mut carry: Option<LedgerEntry> = None;
    let mut stopped_reason = StoppedReason::Done;

    loop {
        let now = clock.now();

        // Budget checks happen only at loop boundaries; an in-flight
        // executor call is never preempted.
        if reports_created >= request.max_reports {
            stopped_reason = StoppedReason::MaxReports;
            break;
        }
        if now - started >= request.max_runtime {
            stopped_reason = StoppedReason::Timeout;
            break;
        }

        // Keep the lock alive across long executor calls, a bounded number
        // of times.
        if now - last_lock_refresh >= request.lock_ttl / 2 {
            if refreshes >= MAX_LOCK_REFRESHES {
                warn!(namespace, "lock refresh budget exhausted; stopping run");
                stopped_reason = StoppedReason::Timeout;
                break;
            }
            if !store
                .refresh_lock(namespace, &request.owner, request.lock_ttl, now)
                .await?
            {
                warn!(namespace, "worker lock lost mid-run; stopping run");
                stopped_reason = StoppedReason::Timeout;
                break;
            }
            refreshes += 1;
            last_lock_refresh = now;
        }

        let (window, next_carry) = claim_window(
            store,
            namespace,
            now,
            settings.max_window_hours(),
            carry.take(),
        )
        .await?;
        carry = next_carry;

        if window.is_empty() {
            stopped_reason = StoppedReason::Done;
            break;
        }

        let outcome = execute_window(store, executor, clock, namespace, &window, &settings).await?;
        reports_created += 1;
        quota_exhausted |= outcome.quota_exhausted;
    }

    if let Some(stranded) = carry {
        // Claimed but never batched because the budget ran out first; the
        // next run's reclaim sweep picks it back up.
        info!(
            namespace,
            hour = %stranded.hour_start,
            "budget ended with a claimed hour left over"
        );
    }

    let entries = store.list_range(namespace, from, to).await?;
    let remaining_missing = entries
        .iter()
        .filter(|e| e.status != IngestStatus::Applied)
        .count();

    // Budget limits only matter if they actually left work behind.
    if remaining_missing == 0 {
        stopped_reason = StoppedReason::Done;
    }

    info!(
        namespace,
        reports_created,
        remaining_missing,
        ?stopped_reason,
        quota_exhausted,
        "repair run finished"
    );

    Ok(RepairSummary {
        namespace: namespace.clone(),
        stopped_reason,
        dry_run: false,
        hours_targeted: targeted.len(),
        estimated_reports: estimated,
        reports_created,
        remaining_missing,
        quota_exhausted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::TimeZone;

    use hourglass_core::{ManualClock, ReportError, ReportOutcome, ReportRequest};

    use crate::ledger::InMemoryLedger;

    fn hour(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, h, 0, 0).unwrap()
    }

    /// Clock pinned 30 minutes past hour(5), so a 6-hour lookback covers
    /// exactly hour(0)..=hour(5).
    fn test_clock() -> ManualClock {
        ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 10, 5, 30, 0).unwrap())
    }

    fn request(namespace: &str) -> RepairRequest {
        RepairRequest {
            namespace: namespace.to_string(),
            lookback_hours: 6,
            max_reports: 10,
            max_runtime: Duration::minutes(30),
            dry_run: false,
            burst_enabled: true,
            burst_window_hours: 3,
            owner: "repair-test".to_string(),
            lock_ttl: Duration::minutes(15),
            failure_cooldown_minutes: 15,
            quota_cooldown_minutes: 60,
        }
    }

    /// What the executor should do for one call.
    enum Step {
        CoverAll,
        CoverNone,
        Fail(fn() -> ReportError),
    }

    /// Executor that follows a script of per-call behaviors, optionally
    /// advancing a shared manual clock to simulate slow report cycles.
    struct ScriptedExecutor {
        script: Mutex<VecDeque<Step>>,
        requests: Mutex<Vec<ReportRequest>>,
        clock: Option<Arc<ManualClock>>,
        advance_per_call: Duration,
    }

    impl ScriptedExecutor {
        fn covering_all() -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
                clock: None,
                advance_per_call: Duration::zero(),
            }
        }

        fn scripted(steps: Vec<Step>) -> Self {
            Self {
                script: Mutex::new(steps.into()),
                requests: Mutex::new(Vec::new()),
                clock: None,
                advance_per_call: Duration::zero(),
            }
        }

        fn slow(clock: Arc<ManualClock>, advance_per_call: Duration) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
                clock: Some(clock),
                advance_per_call,
            }
        }

        fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ReportExecutor for ScriptedExecutor {
        async fn execute(&self, request: ReportRequest) -> Result<ReportOutcome, ReportError> {
            self.requests.lock().unwrap().push(request.clone());
            if let Some(clock) = &self.clock {
                clock.advance(self.advance_per_call);
            }

            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Step::CoverAll);

            match step {
                Step::CoverAll => Ok(ReportOutcome {
                    report_id: format!("rpt_{}", self.request_count()),
                    covered_hours: request.hours.iter().copied().collect(),
                }),
                Step::CoverNone => Ok(ReportOutcome {
                    report_id: format!("rpt_{}", self.request_count()),
                    covered_hours: Default::default(),
                }),
                Step::Fail(make_error) => Err(make_error()),
            }
        }
    }

    #[tokio::test]
    async fn test_end_to_end_burst_fill() {
        let store = InMemoryLedger::new();
        let executor = ScriptedExecutor::covering_all();
        let clock = test_clock();

        let summary = run_repair(
            &store,
            &executor,
            &clock,
            RepairRequest {
                max_reports: 2,
                ..request("A1")
            },
        )
        .await
        .unwrap();

        // Six missing hours, burst window of three: exactly two reports.
        assert_eq!(summary.reports_created, 2);
        assert_eq!(summary.hours_targeted, 6);
        assert_eq!(summary.remaining_missing, 0);
        assert_eq!(summary.stopped_reason, StoppedReason::Done);
        assert_eq!(executor.request_count(), 2);

        let rows = store.list("A1", 10).await.unwrap();
        assert_eq!(rows.len(), 6);
        assert!(rows.iter().all(|r| r.status == IngestStatus::Applied));

        // Each report covered three contiguous hours.
        let requests = executor.requests.lock().unwrap();
        assert_eq!(requests[0].hours, vec![hour(0), hour(1), hour(2)]);
        assert_eq!(requests[1].hours, vec![hour(3), hour(4), hour(5)]);
    }

    #[tokio::test]
    async fn test_lock_busy_returns_without_mutating() {
        let store = InMemoryLedger::new();
        let executor = ScriptedExecutor::covering_all();
        let clock = test_clock();

        // Someone else holds the namespace.
        store
            .acquire_lock("A1", "other-worker", Duration::minutes(30), clock.now())
            .await
            .unwrap();

        let summary = run_repair(&store, &executor, &clock, request("A1"))
            .await
            .unwrap();

        assert_eq!(summary.stopped_reason, StoppedReason::LockBusy);
        assert_eq!(summary.reports_created, 0);
        assert_eq!(executor.request_count(), 0);
        assert!(store.list("A1", 10).await.unwrap().is_empty());

        // The foreign lock is still in place.
        assert!(!store
            .acquire_lock("A1", "claimant", Duration::minutes(1), clock.now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_dry_run_mutates_nothing_and_matches_real_plan() {
        let store = InMemoryLedger::new();
        let executor = ScriptedExecutor::covering_all();
        let clock = test_clock();

        let dry = run_repair(
            &store,
            &executor,
            &clock,
            RepairRequest {
                dry_run: true,
                ..request("A1")
            },
        )
        .await
        .unwrap();

        assert!(dry.dry_run);
        assert_eq!(dry.hours_targeted, 6);
        assert_eq!(dry.estimated_reports, 2);
        assert_eq!(dry.reports_created, 0);
        assert_eq!(executor.request_count(), 0);

        // Zero ledger rows and no lock row were written.
        assert!(store.list("A1", 10).await.unwrap().is_empty());
        assert!(store
            .acquire_lock("A1", "probe", Duration::minutes(1), clock.now())
            .await
            .unwrap());
        store.release_lock("A1", "probe").await.unwrap();

        // A real run targets exactly what the dry run reported.
        let real = run_repair(&store, &executor, &clock, request("A1"))
            .await
            .unwrap();
        assert_eq!(real.hours_targeted, dry.hours_targeted);
    }

    #[tokio::test]
    async fn test_max_reports_budget_stops_early() {
        let store = InMemoryLedger::new();
        let executor = ScriptedExecutor::covering_all();
        let clock = test_clock();

        let summary = run_repair(
            &store,
            &executor,
            &clock,
            RepairRequest {
                max_reports: 1,
                ..request("A1")
            },
        )
        .await
        .unwrap();

        assert_eq!(summary.stopped_reason, StoppedReason::MaxReports);
        assert_eq!(summary.reports_created, 1);
        assert_eq!(summary.remaining_missing, 3);

        let rows = store.list("A1", 10).await.unwrap();
        let applied = rows
            .iter()
            .filter(|r| r.status == IngestStatus::Applied)
            .count();
        assert_eq!(applied, 3);
    }

    #[tokio::test]
    async fn test_runtime_budget_stops_between_batches() {
        let store = InMemoryLedger::new();
        let clock = Arc::new(test_clock());
        // Every report call consumes 20 simulated minutes against a
        // 15-minute budget: the first window runs to completion (in-flight
        // calls are never preempted), the second never starts.
        let executor = ScriptedExecutor::slow(Arc::clone(&clock), Duration::minutes(20));

        let summary = run_repair(
            &store,
            &executor,
            clock.as_ref(),
            RepairRequest {
                max_runtime: Duration::minutes(15),
                ..request("A1")
            },
        )
        .await
        .unwrap();

        assert_eq!(summary.stopped_reason, StoppedReason::Timeout);
        assert_eq!(summary.reports_created, 1);
        assert_eq!(summary.remaining_missing, 3);
        assert_eq!(executor.request_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_window_does_not_abort_run() {
        let store = InMemoryLedger::new();
        let executor = ScriptedExecutor::scripted(vec![
            Step::Fail(|| ReportError::Transient("upstream 503".to_string())),
            Step::CoverAll,
        ]);
        let clock = test_clock();

        let summary = run_repair(&store, &executor, &clock, request("A1"))
            .await
            .unwrap();

        // First window failed, second applied; the failed hours wait out
        // their cooldown so the run drains and stops cleanly.
        assert_eq!(summary.reports_created, 2);
        assert_eq!(summary.remaining_missing, 3);
        assert_eq!(summary.stopped_reason, StoppedReason::Done);

        let rows = store.list("A1", 10).await.unwrap();
        let failed: Vec<_> = rows
            .iter()
            .filter(|r| r.status == IngestStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 3);
        assert!(failed
            .iter()
            .all(|r| r.last_error.as_ref().unwrap().contains("upstream 503")));
    }

    #[tokio::test]
    async fn test_quota_failure_is_surfaced_for_caller_cooldown() {
        let store = InMemoryLedger::new();
        let executor = ScriptedExecutor::scripted(vec![
            Step::Fail(|| ReportError::QuotaExceeded("429".to_string())),
            Step::CoverAll,
        ]);
        let clock = test_clock();

        let summary = run_repair(&store, &executor, &clock, request("A1"))
            .await
            .unwrap();

        assert!(summary.quota_exhausted);
    }

    #[tokio::test]
    async fn test_uncovered_hours_stay_requested_until_next_run() {
        let store = InMemoryLedger::new();
        let executor = ScriptedExecutor::scripted(vec![Step::CoverNone, Step::CoverNone]);
        let clock = test_clock();

        let summary = run_repair(&store, &executor, &clock, request("A1"))
            .await
            .unwrap();

        assert_eq!(summary.reports_created, 2);
        assert_eq!(summary.remaining_missing, 6);
        let rows = store.list("A1", 10).await.unwrap();
        assert!(rows.iter().all(|r| r.status == IngestStatus::Requested));

        // The next run reclaims the orphans and retries them.
        let executor = ScriptedExecutor::covering_all();
        let summary = run_repair(&store, &executor, &clock, request("A1"))
            .await
            .unwrap();
        assert_eq!(summary.remaining_missing, 0);
        assert_eq!(summary.stopped_reason, StoppedReason::Done);
    }

    #[tokio::test]
    async fn test_non_positive_lookback_rejected_before_mutation() {
        let store = InMemoryLedger::new();
        let executor = ScriptedExecutor::covering_all();
        let clock = test_clock();

        let result = run_repair(
            &store,
            &executor,
            &clock,
            RepairRequest {
                lookback_hours: 0,
                ..request("A1")
            },
        )
        .await;

        assert!(matches!(result, Err(RepairError::Configuration(_))));
        assert!(store.list("A1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_max_reports_rejected() {
        let store = InMemoryLedger::new();
        let executor = ScriptedExecutor::covering_all();
        let clock = test_clock();

        let result = run_repair(
            &store,
            &executor,
            &clock,
            RepairRequest {
                max_reports: 0,
                ..request("A1")
            },
        )
        .await;

        assert!(matches!(result, Err(RepairError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_lock_released_after_successful_run() {
        let store = InMemoryLedger::new();
        let executor = ScriptedExecutor::covering_all();
        let clock = test_clock();

        run_repair(&store, &executor, &clock, request("A1"))
            .await
            .unwrap();

        // A fresh owner can take the lock immediately.
        assert!(store
            .acquire_lock("A1", "next-run", Duration::minutes(1), clock.now())
            .await
            .unwrap());
    }
}
