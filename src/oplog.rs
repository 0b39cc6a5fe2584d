//! C4 — the incremental-sync op-log. Data model and apply path are fully
//! specified and implemented here; no wire protocol consumes it yet (see
//! SPEC_FULL.md §11). `pending_ops` (the always-active upload journal) lives
//! alongside `kv` in [`crate::store`].

use rusqlite::{params, OptionalExtension};

use crate::crypto;
use crate::error::Error;
use crate::hlc::HlcTimestamp;
use crate::store::LocalStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Set,
    Delete,
}

impl OpType {
    fn as_str(self) -> &'static str {
        match self {
            OpType::Set => "set",
            OpType::Delete => "delete",
        }
    }

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "set" => Ok(OpType::Set),
            "delete" => Ok(OpType::Delete),
            other => Err(Error::Other(format!("invalid op_type {other} in op_log"))),
        }
    }
}

/// A single entry in the op-log, tagged with an HLC for ordering and a
/// random `op_id` for idempotent delivery.
#[derive(Debug, Clone)]
pub struct RemoteOp {
    pub op_id: String,
    pub seq: i64,
    pub op_type: OpType,
    pub key: Vec<u8>,
    /// `None` for deletes.
    pub value: Option<Vec<u8>>,
    pub hlc: HlcTimestamp,
    pub device_id: String,
}

impl RemoteOp {
    pub fn new_set(key: Vec<u8>, value: Vec<u8>, hlc: HlcTimestamp, device_id: String) -> Self {
        Self {
            op_id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
            op_type: OpType::Set,
            key,
            value: Some(value),
            hlc,
            device_id,
        }
    }

    pub fn new_delete(key: Vec<u8>, hlc: HlcTimestamp, device_id: String) -> Self {
        Self {
            op_id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
            op_type: OpType::Delete,
            key,
            value: None,
            hlc,
            device_id,
        }
    }
}

impl LocalStore {
    /// Idempotent, HLC-ordered application of a remote operation.
    ///
    /// Returns `true` iff `kv` was mutated. Always inserts into `op_log`
    /// (unless `op.op_id` was already seen, in which case this is a no-op).
    pub fn apply_op(&self, op: &RemoteOp) -> Result<bool, Error> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let already_seen: Option<i64> = tx
                .query_row("SELECT 1 FROM op_log WHERE op_id = ?1", params![&op.op_id], |r| r.get(0))
                .optional()?;
            if already_seen.is_some() {
                tx.commit()?;
                return Ok(false);
            }

            let latest_hlc: Option<i64> = tx
                .query_row(
                    "SELECT MAX(hlc_timestamp) FROM op_log WHERE key = ?1",
                    params![&op.key],
                    |r| r.get(0),
                )
                .optional()?
                .flatten();
            let latest_hlc = latest_hlc.unwrap_or(0);

            let sealed_value = match &op.value {
                Some(v) => Some(crypto::encrypt(self.encrypt_key(), v)?),
                None => None,
            };

            tx.execute(
                "INSERT INTO op_log(op_id, seq, op_type, key, value, hlc_timestamp, device_id, synced)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
                params![
                    &op.op_id,
                    op.seq,
                    op.op_type.as_str(),
                    &op.key,
                    sealed_value,
                    op.hlc.as_u64() as i64,
                    &op.device_id,
                ],
            )?;

            let mutated = op.hlc.as_u64() as i64 > latest_hlc || latest_hlc == 0;
            if mutated {
                match (&op.op_type, &sealed_value) {
                    (OpType::Set, Some(sealed)) => {
                        tx.execute(
                            "INSERT INTO kv(key, value) VALUES (?1, ?2)
                             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                            params![&op.key, sealed],
                        )?;
                    }
                    (OpType::Delete, _) => {
                        tx.execute("DELETE FROM kv WHERE key = ?1", params![&op.key])?;
                    }
                    (OpType::Set, None) => {
                        return Err(Error::Other("Set op missing a value".to_string()));
                    }
                }
            }

            tx.commit()?;
            Ok(mutated)
        })
    }

    /// Assign the next local `op_log` sequence number (`max(seq)+1`,
    /// starting at 1) to `op`, then apply it via [`LocalStore::apply_op`].
    pub fn record_and_apply_local_op(&self, mut op: RemoteOp) -> Result<(RemoteOp, bool), Error> {
        let next_seq: i64 = self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COALESCE(MAX(seq), 0) + 1 FROM op_log", [], |r| r.get(0))?)
        })?;
        op.seq = next_seq;
        let mutated = self.apply_op(&op)?;
        Ok((op, mutated))
    }

    /// Rows in `op_log` for a given key, ordered by HLC ascending.
    pub fn op_log_for_key(&self, key: &[u8]) -> Result<Vec<RemoteOp>, Error> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT op_id, seq, op_type, key, value, hlc_timestamp, device_id
                 FROM op_log WHERE key = ?1 ORDER BY hlc_timestamp ASC",
            )?;
            let rows = stmt.query_map(params![key], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Vec<u8>>(3)?,
                    r.get::<_, Option<Vec<u8>>>(4)?,
                    r.get::<_, i64>(5)?,
                    r.get::<_, String>(6)?,
                ))
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })?;

        let mut out = Vec::new();
        for (op_id, seq, op_type_str, key, sealed_value, hlc_raw, device_id) in rows {
            let value = match sealed_value {
                Some(sealed) => Some(crypto::decrypt(self.encrypt_key(), &sealed)?),
                None => None,
            };
            out.push(RemoteOp {
                op_id,
                seq,
                op_type: OpType::from_str(&op_type_str)?,
                key,
                value,
                hlc: HlcTimestamp::from_u64(hlc_raw as u64),
                device_id,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptKey;
    use crate::hlc::Clock;
    use tempfile::tempdir;

    fn open_store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempdir().unwrap();
        let db = dir.path().join("t.db");
        let store = LocalStore::open(&db, EncryptKey::from_bytes([1u8; crypto::KEY_LEN]), false).unwrap();
        (dir, store)
    }

    #[test]
    fn applying_an_op_twice_is_a_no_op() {
        let (_dir, store) = open_store();
        let clock = Clock::new();
        let op = RemoteOp::new_set(b"k".to_vec(), b"v1".to_vec(), clock.now(), "device-a".to_string());

        let first = store.apply_op(&op).unwrap();
        let second = store.apply_op(&op).unwrap();
        assert!(first);
        assert!(!second);
        assert_eq!(store.get(b"k").unwrap(), b"v1");
    }

    #[test]
    fn last_writer_wins_by_hlc_regardless_of_application_order() {
        let (_dir, store) = open_store();
        let clock = Clock::new();
        let h1 = clock.now();
        let h2 = clock.now();
        assert!(h2 > h1);

        let op_early = RemoteOp::new_set(b"shared".to_vec(), b"from-h1".to_vec(), h1, "a".to_string());
        let op_late = RemoteOp::new_set(b"shared".to_vec(), b"from-h2".to_vec(), h2, "b".to_string());

        // Apply out of order: late first, then early.
        store.apply_op(&op_late).unwrap();
        store.apply_op(&op_early).unwrap();

        assert_eq!(store.get(b"shared").unwrap(), b"from-h2");
        assert_eq!(store.op_log_for_key(b"shared").unwrap().len(), 2);
    }

    #[test]
    fn record_and_apply_assigns_increasing_local_seq() {
        let (_dir, store) = open_store();
        let clock = Clock::new();
        let op1 = RemoteOp::new_set(b"a".to_vec(), b"1".to_vec(), clock.now(), "dev".to_string());
        let op2 = RemoteOp::new_set(b"b".to_vec(), b"2".to_vec(), clock.now(), "dev".to_string());

        let (applied1, _) = store.record_and_apply_local_op(op1).unwrap();
        let (applied2, _) = store.record_and_apply_local_op(op2).unwrap();
        assert_eq!(applied1.seq, 1);
        assert_eq!(applied2.seq, 2);
    }

    #[test]
    fn delete_op_removes_key_when_newer() {
        let (_dir, store) = open_store();
        let clock = Clock::new();
        let h1 = clock.now();
        let h2 = clock.now();
        store.apply_op(&RemoteOp::new_set(b"k".to_vec(), b"v".to_vec(), h1, "a".to_string())).unwrap();
        store.apply_op(&RemoteOp::new_delete(b"k".to_vec(), h2, "a".to_string())).unwrap();
        assert!(matches!(store.get(b"k"), Err(Error::MissingKey)));
    }
}
