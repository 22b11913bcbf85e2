//! Worker-lock operations for the SQLite store.
//!
//! One row per namespace with an absolute expiry:
//! - Acquisition succeeds when no row exists or the row has expired
//! - A crashed holder's lock self-heals once `expires_at` passes
//! - Refresh and release require the caller to still be the owner
//!
//! Acquisition uses atomic INSERT OR IGNORE plus a conditional UPDATE so two
//! workers racing for an expired lock cannot both win.

use rusqlite::{params, Connection};

/// Atomically take the namespace lock.
pub(super) fn acquire_lock_sync(
    conn: &Connection,
    namespace: &str,
    owner: &str,
    now: i64,
    expires_at: i64,
) -> Result<bool, String> {
    // INSERT OR IGNORE avoids the read-then-insert race: if two workers both
    // see "no lock row" and insert, the loser's insert is silently ignored
    // and detected via changes() == 0.
    conn.execute(
        "INSERT OR IGNORE INTO worker_lock (namespace, owner, acquired_at, expires_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![namespace, owner, now, expires_at],
    )
    .map_err(|e| e.to_string())?;

    if conn.changes() > 0 {
        return Ok(true);
    }

    // A row exists. Take it over only if it has expired. The conditional
    // UPDATE guards against the TOCTOU race where two workers both observe
    // the same expired lock: exactly one UPDATE matches.
    conn.execute(
        "UPDATE worker_lock
         SET owner = ?2, acquired_at = ?3, expires_at = ?4
         WHERE namespace = ?1 AND expires_at <= ?3",
        params![namespace, owner, now, expires_at],
    )
    .map_err(|e| e.to_string())?;

    Ok(conn.changes() > 0)
}

/// Extend the expiry of a lock the caller still holds.
pub(super) fn refresh_lock_sync(
    conn: &Connection,
    namespace: &str,
    owner: &str,
    expires_at: i64,
) -> Result<bool, String> {
    conn.execute(
        "UPDATE worker_lock SET expires_at = ?3
         WHERE namespace = ?1 AND owner = ?2",
        params![namespace, owner, expires_at],
    )
    .map_err(|e| e.to_string())?;

    Ok(conn.changes() > 0)
}

/// Drop the lock if the caller still holds it.
pub(super) fn release_lock_sync(
    conn: &Connection,
    namespace: &str,
    owner: &str,
) -> Result<bool, String> {
    conn.execute(
        "DELETE FROM worker_lock WHERE namespace = ?1 AND owner = ?2",
        params![namespace, owner],
    )
    .map_err(|e| e.to_string())?;

    Ok(conn.changes() > 0)
}
