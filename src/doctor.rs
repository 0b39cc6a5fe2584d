//! C6 — Repair / Doctor: integrity reporting and corruption remediation.
//! `Doctor()` is safe on read-only handles; `Repair`/`Reset` require write
//! access and operate at the file level, independent of any open handle.

use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::Connection;
use serde::Serialize;

use crate::error::Error;
use crate::lock;
use crate::store::{self, LocalStore};

const STALE_PENDING_OPS_WARNING_SECS: i64 = 24 * 60 * 60;

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Structured result of [`doctor`]. All fields named exactly per SPEC_FULL.md §10.
#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub integrity_ok: bool,
    pub pending_ops_count: i64,
    /// Age in seconds of the oldest unconfirmed write, if any.
    pub pending_ops_oldest_age: Option<i64>,
    pub local_seq: i64,
    pub wal_size_bytes: u64,
    pub shm_exists: bool,
    /// `(holder, expires_at)`, ignoring already-expired leases.
    pub lock_status: Option<(String, i64)>,
    pub warnings: Vec<String>,
}

/// Result of [`repair`].
#[derive(Debug, Clone, Serialize)]
pub struct RepairReport {
    pub integrity_ok: bool,
    pub vacuumed: bool,
}

/// Read-only diagnostic snapshot. Safe to call on a read-only handle.
pub fn doctor(store: &LocalStore) -> Result<DoctorReport, Error> {
    let integrity_ok = store.with_conn(|conn| {
        let result: String = conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))?;
        Ok(result.eq_ignore_ascii_case("ok"))
    })?;

    let (pending_ops_count, oldest_created_at) = store.pending_ops_summary()?;
    let pending_ops_oldest_age = oldest_created_at.map(|created_at| now_secs() - created_at);

    let local_seq = store.get_meta("max_version")?;

    let wal_path = store::with_suffix(store.path(), "-wal");
    let wal_size_bytes = fs::metadata(&wal_path).map(|m| m.len()).unwrap_or(0);
    let shm_exists = store::with_suffix(store.path(), "-shm").exists();

    let lock_status = lock::status(store)?;

    let mut warnings = Vec::new();
    if let Some(age) = pending_ops_oldest_age {
        if age > STALE_PENDING_OPS_WARNING_SECS {
            warnings.push(format!("oldest pending op is {age}s old (> 24h)"));
        }
    }
    if !integrity_ok {
        warnings.push("integrity_check did not return ok".to_string());
    }

    Ok(DoctorReport {
        integrity_ok,
        pending_ops_count,
        pending_ops_oldest_age,
        local_seq,
        wal_size_bytes,
        shm_exists,
        lock_status,
        warnings,
    })
}

/// Attempt to repair a database at `path`. `force` permits the destructive
/// `REINDEX` path when a plain checkpoint+vacuum doesn't restore integrity,
/// and also permits recovering from a database that fails to open at all.
pub fn repair(path: &Path, force: bool) -> Result<RepairReport, Error> {
    let conn = match open_for_repair(path) {
        Ok(conn) => conn,
        Err(e) if force => {
            tracing::warn!(?path, "doctor: initial open failed, attempting corrupt-file recovery");
            let _ = fs::remove_file(path);
            let _ = fs::remove_file(store::with_suffix(path, "-wal"));
            let _ = fs::remove_file(store::with_suffix(path, "-shm"));
            open_for_repair(path).map_err(|_| e)?
        }
        Err(e) => return Err(e),
    };

    conn.busy_timeout(std::time::Duration::from_millis(5000))?;

    if store::with_suffix(path, "-wal").exists() {
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
    }
    let _ = fs::remove_file(store::with_suffix(path, "-shm"));

    let integrity: String = conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))?;
    if integrity.eq_ignore_ascii_case("ok") {
        conn.execute_batch("VACUUM")?;
        return Ok(RepairReport { integrity_ok: true, vacuumed: true });
    }

    if !force {
        return Err(Error::RepairFailed);
    }

    tracing::warn!(?path, "doctor: integrity check failed, reindexing under writable_schema");
    conn.pragma_update(None, "writable_schema", true)?;
    let reindex_result = conn.execute_batch("REINDEX");
    conn.pragma_update(None, "writable_schema", false)?;
    reindex_result?;

    let integrity_after: String = conn.query_row("PRAGMA integrity_check", [], |r| r.get(0))?;
    if !integrity_after.eq_ignore_ascii_case("ok") {
        return Err(Error::RepairFailed);
    }
    conn.execute_batch("VACUUM")?;
    Ok(RepairReport { integrity_ok: true, vacuumed: true })
}

fn open_for_repair(path: &Path) -> Result<Connection, Error> {
    Ok(Connection::open(path)?)
}

/// Remove the main file and its `-wal`/`-shm` siblings, then recreate the
/// schema. The caller is expected to `Sync()` afterward to repopulate.
pub fn reset(store: &LocalStore) -> Result<(), Error> {
    tracing::warn!(path = ?store.path(), "doctor: resetting local database");
    store.wipe_and_reinit()
}
