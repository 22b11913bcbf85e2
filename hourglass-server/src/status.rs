//! Status types for the ledger endpoints.
//!
//! This module shapes ledger rows into the JSON the status surface serves.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ledger::{IngestStatus, LedgerEntry};

/// Per-status counts plus the two cursors operators actually look for:
/// the next hour a run would claim, and the newest hour fully ingested.
#[derive(Debug, Default, Serialize)]
pub struct LedgerSummary {
    pub total_hours: usize,
    pub missing: usize,
    pub requested: usize,
    pub downloaded: usize,
    pub applied: usize,
    pub failed: usize,
    pub next_claimable_hour: Option<DateTime<Utc>>,
    pub last_applied_hour: Option<DateTime<Utc>>,
}

impl LedgerSummary {
    /// Summarize entries as of `now` (claimability of FAILED rows depends on
    /// whether their cooldown has elapsed).
    pub fn from_entries(entries: &[LedgerEntry], now: DateTime<Utc>) -> Self {
        let mut summary = LedgerSummary {
            total_hours: entries.len(),
            ..Default::default()
        };

        for entry in entries {
            match entry.status {
                IngestStatus::Missing => summary.missing += 1,
                IngestStatus::Requested => summary.requested += 1,
                IngestStatus::Downloaded => summary.downloaded += 1,
                IngestStatus::Applied => summary.applied += 1,
                IngestStatus::Failed => summary.failed += 1,
            }

            if entry.is_claimable(now)
                && summary
                    .next_claimable_hour
                    .is_none_or(|h| entry.hour_start < h)
            {
                summary.next_claimable_hour = Some(entry.hour_start);
            }

            if entry.status == IngestStatus::Applied
                && summary
                    .last_applied_hour
                    .is_none_or(|h| entry.hour_start > h)
            {
                summary.last_applied_hour = Some(entry.hour_start);
            }
        }

        summary
    }
}

/// Full status payload for one namespace.
#[derive(Debug, Serialize)]
pub struct LedgerStatusData {
    pub namespace: String,
    pub version: String,
    pub summary: LedgerSummary,
}

impl LedgerStatusData {
    pub fn from_entries(
        namespace: String,
        entries: &[LedgerEntry],
        now: DateTime<Utc>,
        version: String,
    ) -> Self {
        Self {
            namespace,
            version,
            summary: LedgerSummary::from_entries(entries, now),
        }
    }
}
