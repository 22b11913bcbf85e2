//! In-memory implementation of `LedgerStore`.
//!
//! State is lost on restart, so this backend is only suitable for tests and
//! throwaway runs; the worker lock it provides cannot exclude other
//! processes. Behavior otherwise matches the SQLite backend exactly.

use std::collections::BTreeMap;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use super::{truncate_error, IngestStatus, LedgerEntry, LedgerStore, StoreError};

#[derive(Debug, Clone)]
struct LockRow {
    owner: String,
    expires_at: DateTime<Utc>,
}

/// In-memory ledger keyed by (namespace, hour_start).
///
/// A `BTreeMap` keeps rows ordered, which makes "earliest claimable hour"
/// a forward scan. The claim runs under the map's write lock, which gives
/// the same at-most-one-claim guarantee the SQLite transaction does.
pub struct InMemoryLedger {
    entries: RwLock<BTreeMap<(String, DateTime<Utc>), LedgerEntry>>,
    locks: RwLock<HashMap<String, LockRow>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            locks: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn ensure_hours_exist(
        &self,
        namespace: &str,
        hours: &[DateTime<Utc>],
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().await;
        let mut inserted = 0;

        for &hour in hours {
            let key = (namespace.to_string(), hour);
            entries.entry(key).or_insert_with(|| {
                inserted += 1;
                LedgerEntry {
                    namespace: namespace.to_string(),
                    hour_start: hour,
                    status: IngestStatus::Missing,
                    report_id: None,
                    attempt_count: 0,
                    last_error: None,
                    next_retry_at: None,
                    created_at: now,
                    updated_at: now,
                }
            });
        }

        Ok(inserted)
    }

    async fn claim_next_missing_hour(
        &self,
        namespace: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        let mut entries = self.entries.write().await;

        let key = entries
            .iter()
            .find(|((ns, _), entry)| ns == namespace && entry.is_claimable(now))
            .map(|(key, _)| key.clone());

        let Some(key) = key else {
            return Ok(None);
        };

        let entry = entries.get_mut(&key).expect("key was just found");
        entry.status = IngestStatus::Requested;
        entry.attempt_count += 1;
        entry.last_error = None;
        entry.next_retry_at = None;
        entry.updated_at = now;

        Ok(Some(entry.clone()))
    }

    async fn mark_downloaded(
        &self,
        namespace: &str,
        hour: DateTime<Utc>,
        report_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&(namespace.to_string(), hour))
            .filter(|e| e.status == IngestStatus::Requested)
            .ok_or_else(|| {
                StoreError::storage("mark_downloaded", "no REQUESTED row for hour")
            })?;

        entry.status = IngestStatus::Downloaded;
        entry.report_id = Some(report_id.to_string());
        entry.updated_at = now;
        Ok(())
    }

    async fn mark_applied(
        &self,
        namespace: &str,
        hour: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&(namespace.to_string(), hour))
            .filter(|e| e.status == IngestStatus::Downloaded)
            .ok_or_else(|| StoreError::storage("mark_applied", "no DOWNLOADED row for hour"))?;

        entry.status = IngestStatus::Applied;
        entry.updated_at = now;
        Ok(())
    }

    async fn mark_failed(
        &self,
        namespace: &str,
        hour: DateTime<Utc>,
        error: &str,
        cooldown_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(&(namespace.to_string(), hour))
            .filter(|e| {
                matches!(
                    e.status,
                    IngestStatus::Requested | IngestStatus::Downloaded
                )
            })
            .ok_or_else(|| {
                StoreError::storage("mark_failed", "no REQUESTED/DOWNLOADED row for hour")
            })?;

        entry.status = IngestStatus::Failed;
        entry.last_error = Some(truncate_error(error));
        entry.next_retry_at = Some(now + Duration::minutes(cooldown_minutes));
        entry.updated_at = now;
        Ok(())
    }

    async fn reclaim_abandoned(
        &self,
        namespace: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut entries = self.entries.write().await;
        let mut reclaimed = 0;

        for ((ns, _), entry) in entries.iter_mut() {
            if ns == namespace
                && matches!(
                    entry.status,
                    IngestStatus::Requested | IngestStatus::Downloaded
                )
            {
                entry.status = IngestStatus::Failed;
                entry.last_error = Some("abandoned by previous run".to_string());
                entry.next_retry_at = Some(now);
                entry.updated_at = now;
                reclaimed += 1;
            }
        }

        Ok(reclaimed)
    }

    async fn list(&self, namespace: &str, limit: usize) -> Result<Vec<LedgerEntry>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn list_range(
        &self,
        namespace: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|((ns, hour), _)| ns == namespace && *hour >= from && *hour <= to)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn acquire_lock(
        &self,
        namespace: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut locks = self.locks.write().await;

        match locks.get(namespace) {
            Some(existing) if existing.expires_at > now => Ok(false),
            _ => {
                locks.insert(
                    namespace.to_string(),
                    LockRow {
                        owner: owner.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn refresh_lock(
        &self,
        namespace: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut locks = self.locks.write().await;

        match locks.get_mut(namespace) {
            Some(existing) if existing.owner == owner => {
                existing.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lock(&self, namespace: &str, owner: &str) -> Result<bool, StoreError> {
        let mut locks = self.locks.write().await;

        match locks.get(namespace) {
            Some(existing) if existing.owner == owner => {
                locks.remove(namespace);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
