//! Durable per-hour ingestion ledger.
//!
//! This module defines the `LedgerStore` trait that abstracts storage for
//! hour-level ingestion state and the namespace worker lock. Implementations
//! provide different backends (in-memory, SQLite); the SQLite backend is the
//! durable one the service runs on.
//!
//! # State machine
//!
//! ```text
//! MISSING ──claim──▶ REQUESTED ──▶ DOWNLOADED ──▶ APPLIED (terminal)
//!                        │               │
//!                        └────▶ FAILED ◀─┘
//! ```
//!
//! `FAILED` holds a `next_retry_at`; once it passes, the hour is claimable
//! again without its stored status changing first. The claim is the only
//! operation that needs a serializable transaction; everything else is a
//! per-row write.

mod memory;
mod sqlite;

pub use memory::InMemoryLedger;
pub use sqlite::SqliteLedger;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;

/// Upper bound on stored error text. Anything longer is truncated so one
/// pathological error body cannot bloat the ledger.
pub const MAX_ERROR_LEN: usize = 500;

/// Ingestion status of a single (namespace, hour) row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestStatus {
    Missing,
    Requested,
    Downloaded,
    Applied,
    Failed,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Missing => "MISSING",
            IngestStatus::Requested => "REQUESTED",
            IngestStatus::Downloaded => "DOWNLOADED",
            IngestStatus::Applied => "APPLIED",
            IngestStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MISSING" => Some(IngestStatus::Missing),
            "REQUESTED" => Some(IngestStatus::Requested),
            "DOWNLOADED" => Some(IngestStatus::Downloaded),
            "APPLIED" => Some(IngestStatus::Applied),
            "FAILED" => Some(IngestStatus::Failed),
            _ => None,
        }
    }
}

/// One ledger row: the ingestion record for a single UTC hour in a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    pub namespace: String,
    pub hour_start: DateTime<Utc>,
    pub status: IngestStatus,
    pub report_id: Option<String>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Whether a claim at `now` would select this row.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            IngestStatus::Missing => true,
            IngestStatus::Failed => self.next_retry_at.is_none_or(|t| t <= now),
            _ => false,
        }
    }
}

/// Truncate error text to [`MAX_ERROR_LEN`] at a character boundary.
pub fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LEN {
        return error.to_string();
    }
    let mut cut = MAX_ERROR_LEN;
    while !error.is_char_boundary(cut) {
        cut -= 1;
    }
    error[..cut].to_string()
}

/// Storage-layer failures.
///
/// These are fatal for the operation that hit them and propagate to the
/// immediate caller; the backing transaction rolls back rather than leaving
/// partial state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage failure during {operation}: {detail}")]
    Storage {
        operation: &'static str,
        detail: String,
    },
    #[error("corrupt {what} in ledger store")]
    Corruption { what: &'static str },
}

impl StoreError {
    pub fn storage(operation: &'static str, detail: impl Into<String>) -> Self {
        StoreError::Storage {
            operation,
            detail: detail.into(),
        }
    }

    pub fn corruption(what: &'static str) -> Self {
        StoreError::Corruption { what }
    }
}

/// Repository trait for the hour ledger and the namespace worker lock.
///
/// Both live on the same trait because they must share one durable database:
/// the lock is only meaningful if it serializes writers of the same ledger.
/// All timestamps are passed in explicitly so implementations stay
/// deterministic under an injected clock.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert `MISSING` rows for any of `hours` not already present.
    /// Idempotent; returns the number of rows actually inserted.
    async fn ensure_hours_exist(
        &self,
        namespace: &str,
        hours: &[DateTime<Utc>],
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Atomically claim the earliest claimable hour: status in
    /// {MISSING, FAILED} with `next_retry_at` unset or elapsed. On success the
    /// row becomes `REQUESTED`, `attempt_count` increments, and
    /// `last_error`/`next_retry_at` are cleared. No two concurrent callers can
    /// claim the same hour.
    async fn claim_next_missing_hour(
        &self,
        namespace: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>, StoreError>;

    /// `REQUESTED` → `DOWNLOADED`, recording the report that covered the hour.
    async fn mark_downloaded(
        &self,
        namespace: &str,
        hour: DateTime<Utc>,
        report_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// `DOWNLOADED` → `APPLIED` (terminal success).
    async fn mark_applied(
        &self,
        namespace: &str,
        hour: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// `REQUESTED`/`DOWNLOADED` → `FAILED` with truncated error text and
    /// `next_retry_at = now + cooldown_minutes`.
    async fn mark_failed(
        &self,
        namespace: &str,
        hour: DateTime<Utc>,
        error: &str,
        cooldown_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Flip every `REQUESTED`/`DOWNLOADED` row back to claimable
    /// (`FAILED` with `next_retry_at = now`). Only valid while holding the
    /// namespace worker lock: the lock proves no other worker is mid-request,
    /// so every such row is an orphan: left by a crashed run or by a prior
    /// batch's partial coverage. Returns the number of rows reclaimed.
    async fn reclaim_abandoned(
        &self,
        namespace: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Read-only listing, ascending by hour.
    async fn list(&self, namespace: &str, limit: usize) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Read-only listing of rows with `from <= hour_start <= to`, ascending.
    async fn list_range(
        &self,
        namespace: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    // =========================================================================
    // Namespace worker lock
    // =========================================================================

    /// Take the namespace lock. Succeeds iff no lock row exists or the
    /// existing one has expired; on success the row holds `owner` with
    /// `expires_at = now + ttl`. Contention is a `false`, never an error.
    async fn acquire_lock(
        &self,
        namespace: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Extend the lock's expiry. Succeeds only while `owner` still holds it.
    async fn refresh_lock(
        &self,
        namespace: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Drop the lock only if `owner` still holds it. A stale
    /// caller must never release someone else's lock.
    async fn release_lock(&self, namespace: &str, owner: &str) -> Result<bool, StoreError>;
}
