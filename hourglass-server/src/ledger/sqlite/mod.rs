//! SQLite implementation of `LedgerStore`.
//!
//! This is the durable backend the service runs on: it is what lets repair
//! runs from independent processes coordinate, and what survives crashes.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version.

mod lock;


use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::warn;

use super::{truncate_error, IngestStatus, LedgerEntry, LedgerStore, StoreError};

/// Current schema version. Increment this when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 1;

/// SQLite-backed ledger and worker-lock store.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime. The single `Mutex<Connection>` makes
/// every write per-row atomic; the claim additionally runs in an immediate
/// transaction so the select-then-update pair is serialized against any
/// other connection to the same database file.
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    /// Create a new SQLite store at the given path.
    ///
    /// Creates the database file and schema if they don't exist, and runs any
    /// pending migrations otherwise.
    ///
    /// # Durability
    ///
    /// The database is configured with:
    /// - `journal_mode = WAL` for better concurrency and crash safety
    /// - `synchronous = FULL` for maximum durability
    /// - `busy_timeout = 5000ms` to handle concurrent access gracefully
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();

        let path_str = path_ref.to_string_lossy();
        if path_str != ":memory:" && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| StoreError::storage("open database", e.to_string()))?;

        // We must verify WAL mode was actually enabled - SQLite can silently
        // keep DELETE mode on filesystems without shared-memory support, which
        // would void the concurrency guarantees the worker lock relies on.
        // In-memory databases report "memory", which is fine for tests.
        let is_in_memory = path_str == ":memory:";
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| StoreError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));

        if !journal_mode_ok {
            return Err(StoreError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'. \
                     This can happen on filesystems that don't support shared memory. \
                     The ledger requires WAL mode for its durability and concurrency \
                     guarantees.",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| StoreError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a new in-memory store (for testing).
    pub fn new_in_memory() -> Result<Self, StoreError> {
        Self::new(":memory:")
    }

    /// Run migrations from `from_version` to `CURRENT_SCHEMA_VERSION`.
    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), StoreError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        // Migration from version 0 (fresh database) to version 1.
        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS ledger (
                    namespace TEXT NOT NULL,
                    -- Unix seconds, always floored to the hour
                    hour_start INTEGER NOT NULL,
                    status TEXT NOT NULL CHECK(status IN (
                        'MISSING', 'REQUESTED', 'DOWNLOADED', 'APPLIED', 'FAILED'
                    )),
                    report_id TEXT,
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    next_retry_at INTEGER,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    PRIMARY KEY (namespace, hour_start)
                );

                CREATE INDEX IF NOT EXISTS idx_ledger_claimable
                    ON ledger(namespace, hour_start)
                    WHERE status IN ('MISSING', 'FAILED');

                CREATE TABLE IF NOT EXISTS worker_lock (
                    namespace TEXT PRIMARY KEY,
                    owner TEXT NOT NULL,
                    acquired_at INTEGER NOT NULL,
                    expires_at INTEGER NOT NULL
                );
                "#,
            )
            .map_err(|e| StoreError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::storage("update schema version", e.to_string()))?;

        Ok(())
    }
}

// =============================================================================
// Timestamp conversion helpers
// =============================================================================

/// Convert a timestamp to unix seconds for storage.
fn to_unix(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

/// Convert stored unix seconds back to a timestamp.
///
/// Returns a corruption error for values outside chrono's representable
/// range, which can only appear through outside writes to the database.
fn from_unix(secs: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| StoreError::corruption("timestamp"))
}

/// Columns selected for every full-row read, in `row_to_entry` order.
const ENTRY_COLUMNS: &str = "namespace, hour_start, status, report_id, attempt_count, \
                             last_error, next_retry_at, created_at, updated_at";

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<LedgerEntry, StoreError> {
    let read = |e: rusqlite::Error| StoreError::storage("read ledger row", e.to_string());

    let status_text: String = row.get(2).map_err(read)?;
    let status =
        IngestStatus::parse(&status_text).ok_or_else(|| StoreError::corruption("status"))?;

    let attempt_count: i64 = row.get(4).map_err(read)?;
    let attempt_count =
        u32::try_from(attempt_count).map_err(|_| StoreError::corruption("attempt_count"))?;

    let next_retry_at: Option<i64> = row.get(6).map_err(read)?;

    Ok(LedgerEntry {
        namespace: row.get(0).map_err(read)?,
        hour_start: from_unix(row.get(1).map_err(read)?)?,
        status,
        report_id: row.get(3).map_err(read)?,
        attempt_count,
        last_error: row.get(5).map_err(read)?,
        next_retry_at: next_retry_at.map(from_unix).transpose()?,
        created_at: from_unix(row.get(7).map_err(read)?)?,
        updated_at: from_unix(row.get(8).map_err(read)?)?,
    })
}

// =============================================================================
// LedgerStore trait implementation
// =============================================================================

#[async_trait]
impl LedgerStore for SqliteLedger {
    async fn ensure_hours_exist(
        &self,
        namespace: &str,
        hours: &[DateTime<Utc>],
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let conn = self.conn.clone();
        let namespace = namespace.to_string();
        let hours: Vec<i64> = hours.iter().copied().map(to_unix).collect();
        let now = to_unix(now);

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            let tx = conn
                .transaction()
                .map_err(|e| StoreError::storage("ensure_hours_exist", e.to_string()))?;

            let mut inserted = 0;
            for hour in hours {
                inserted += tx
                    .execute(
                        "INSERT OR IGNORE INTO ledger
                             (namespace, hour_start, status, attempt_count, created_at, updated_at)
                         VALUES (?1, ?2, 'MISSING', 0, ?3, ?3)",
                        params![namespace, hour, now],
                    )
                    .map_err(|e| StoreError::storage("ensure_hours_exist", e.to_string()))?;
            }

            tx.commit()
                .map_err(|e| StoreError::storage("ensure_hours_exist", e.to_string()))?;
            Ok(inserted)
        })
        .await
        .map_err(|e| StoreError::storage("ensure_hours_exist", e.to_string()))?
    }

    async fn claim_next_missing_hour(
        &self,
        namespace: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        let conn = self.conn.clone();
        let namespace = namespace.to_string();
        let now = to_unix(now);

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();

            // The claim is the one place two workers could race into the same
            // hour, so the select-then-update pair runs in an immediate
            // transaction: the write lock is taken up front, and the UPDATE
            // re-checks claimability so a row another writer got to first is
            // never claimed twice.
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|e| StoreError::storage("claim", e.to_string()))?;

            let hour: Option<i64> = tx
                .query_row(
                    "SELECT hour_start FROM ledger
                     WHERE namespace = ?1
                       AND status IN ('MISSING', 'FAILED')
                       AND (next_retry_at IS NULL OR next_retry_at <= ?2)
                     ORDER BY hour_start ASC
                     LIMIT 1",
                    params![namespace, now],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StoreError::storage("claim", e.to_string()))?;

            let Some(hour) = hour else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE ledger
                 SET status = 'REQUESTED',
                     attempt_count = attempt_count + 1,
                     last_error = NULL,
                     next_retry_at = NULL,
                     updated_at = ?3
                 WHERE namespace = ?1 AND hour_start = ?2
                   AND status IN ('MISSING', 'FAILED')
                   AND (next_retry_at IS NULL OR next_retry_at <= ?3)",
                params![namespace, hour, now],
            )
            .map_err(|e| StoreError::storage("claim", e.to_string()))?;

            if tx.changes() == 0 {
                // Lost the race within the transaction window; nothing claimed.
                tx.rollback()
                    .map_err(|e| StoreError::storage("claim", e.to_string()))?;
                return Ok(None);
            }

            let entry = tx
                .query_row(
                    &format!(
                        "SELECT {ENTRY_COLUMNS} FROM ledger
                         WHERE namespace = ?1 AND hour_start = ?2"
                    ),
                    params![namespace, hour],
                    |row| Ok(row_to_entry(row)),
                )
                .map_err(|e| StoreError::storage("claim", e.to_string()))??;

            tx.commit()
                .map_err(|e| StoreError::storage("claim", e.to_string()))?;

            Ok(Some(entry))
        })
        .await
        .map_err(|e| StoreError::storage("claim", e.to_string()))?
    }

    async fn mark_downloaded(
        &self,
        namespace: &str,
        hour: DateTime<Utc>,
        report_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let namespace = namespace.to_string();
        let report_id = report_id.to_string();
        let hour = to_unix(hour);
        let now = to_unix(now);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();

            let changed = conn
                .execute(
                    "UPDATE ledger
                     SET status = 'DOWNLOADED', report_id = ?3, updated_at = ?4
                     WHERE namespace = ?1 AND hour_start = ?2 AND status = 'REQUESTED'",
                    params![namespace, hour, report_id, now],
                )
                .map_err(|e| StoreError::storage("mark_downloaded", e.to_string()))?;

            if changed == 0 {
                return Err(StoreError::storage(
                    "mark_downloaded",
                    "no REQUESTED row for hour",
                ));
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::storage("mark_downloaded", e.to_string()))?
    }

    async fn mark_applied(
        &self,
        namespace: &str,
        hour: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let namespace = namespace.to_string();
        let hour = to_unix(hour);
        let now = to_unix(now);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();

            let changed = conn
                .execute(
                    "UPDATE ledger
                     SET status = 'APPLIED', updated_at = ?3
                     WHERE namespace = ?1 AND hour_start = ?2 AND status = 'DOWNLOADED'",
                    params![namespace, hour, now],
                )
                .map_err(|e| StoreError::storage("mark_applied", e.to_string()))?;

            if changed == 0 {
                return Err(StoreError::storage(
                    "mark_applied",
                    "no DOWNLOADED row for hour",
                ));
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::storage("mark_applied", e.to_string()))?
    }

    async fn mark_failed(
        &self,
        namespace: &str,
        hour: DateTime<Utc>,
        error: &str,
        cooldown_minutes: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let namespace = namespace.to_string();
        let error = truncate_error(error);
        let hour = to_unix(hour);
        let retry_at = to_unix(now + Duration::minutes(cooldown_minutes));
        let now = to_unix(now);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();

            let changed = conn
                .execute(
                    "UPDATE ledger
                     SET status = 'FAILED', last_error = ?3, next_retry_at = ?4, updated_at = ?5
                     WHERE namespace = ?1 AND hour_start = ?2
                       AND status IN ('REQUESTED', 'DOWNLOADED')",
                    params![namespace, hour, error, retry_at, now],
                )
                .map_err(|e| StoreError::storage("mark_failed", e.to_string()))?;

            if changed == 0 {
                return Err(StoreError::storage(
                    "mark_failed",
                    "no REQUESTED/DOWNLOADED row for hour",
                ));
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::storage("mark_failed", e.to_string()))?
    }

    async fn reclaim_abandoned(
        &self,
        namespace: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let conn = self.conn.clone();
        let namespace = namespace.to_string();
        let now = to_unix(now);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();

            let reclaimed = conn
                .execute(
                    "UPDATE ledger
                     SET status = 'FAILED',
                         last_error = 'abandoned by previous run',
                         next_retry_at = ?2,
                         updated_at = ?2
                     WHERE namespace = ?1 AND status IN ('REQUESTED', 'DOWNLOADED')",
                    params![namespace, now],
                )
                .map_err(|e| StoreError::storage("reclaim_abandoned", e.to_string()))?;

            if reclaimed > 0 {
                warn!(
                    namespace,
                    reclaimed, "reclaimed in-flight ledger rows from a previous run"
                );
            }
            Ok(reclaimed)
        })
        .await
        .map_err(|e| StoreError::storage("reclaim_abandoned", e.to_string()))?
    }

    async fn list(&self, namespace: &str, limit: usize) -> Result<Vec<LedgerEntry>, StoreError> {
        let conn = self.conn.clone();
        let namespace = namespace.to_string();
        let limit = i64::try_from(limit)
            .map_err(|_| StoreError::storage("list", format!("limit {limit} out of range")))?;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM ledger
                     WHERE namespace = ?1
                     ORDER BY hour_start ASC
                     LIMIT ?2"
                ))
                .map_err(|e| StoreError::storage("list", e.to_string()))?;

            let rows = stmt
                .query_map(params![namespace, limit], |row| Ok(row_to_entry(row)))
                .map_err(|e| StoreError::storage("list", e.to_string()))?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(|e| StoreError::storage("list", e.to_string()))??);
            }
            Ok(entries)
        })
        .await
        .map_err(|e| StoreError::storage("list", e.to_string()))?
    }

    async fn list_range(
        &self,
        namespace: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let conn = self.conn.clone();
        let namespace = namespace.to_string();
        let from = to_unix(from);
        let to = to_unix(to);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();

            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {ENTRY_COLUMNS} FROM ledger
                     WHERE namespace = ?1 AND hour_start >= ?2 AND hour_start <= ?3
                     ORDER BY hour_start ASC"
                ))
                .map_err(|e| StoreError::storage("list_range", e.to_string()))?;

            let rows = stmt
                .query_map(params![namespace, from, to], |row| Ok(row_to_entry(row)))
                .map_err(|e| StoreError::storage("list_range", e.to_string()))?;

            let mut entries = Vec::new();
            for row in rows {
                entries
                    .push(row.map_err(|e| StoreError::storage("list_range", e.to_string()))??);
            }
            Ok(entries)
        })
        .await
        .map_err(|e| StoreError::storage("list_range", e.to_string()))?
    }

    // =========================================================================
    // Namespace worker lock - delegated to lock module
    // =========================================================================

    async fn acquire_lock(
        &self,
        namespace: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.clone();
        let namespace = namespace.to_string();
        let owner = owner.to_string();
        let expires_at = to_unix(now + ttl);
        let now = to_unix(now);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            lock::acquire_lock_sync(&conn, &namespace, &owner, now, expires_at)
                .map_err(|e| StoreError::storage("acquire_lock", e))
        })
        .await
        .map_err(|e| StoreError::storage("acquire_lock", e.to_string()))?
    }

    async fn refresh_lock(
        &self,
        namespace: &str,
        owner: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.clone();
        let namespace = namespace.to_string();
        let owner = owner.to_string();
        let expires_at = to_unix(now + ttl);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            lock::refresh_lock_sync(&conn, &namespace, &owner, expires_at)
                .map_err(|e| StoreError::storage("refresh_lock", e))
        })
        .await
        .map_err(|e| StoreError::storage("refresh_lock", e.to_string()))?
    }

    async fn release_lock(&self, namespace: &str, owner: &str) -> Result<bool, StoreError> {
        let conn = self.conn.clone();
        let namespace = namespace.to_string();
        let owner = owner.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            lock::release_lock_sync(&conn, &namespace, &owner)
                .map_err(|e| StoreError::storage("release_lock", e))
        })
        .await
        .map_err(|e| StoreError::storage("release_lock", e.to_string()))?
    }
}
