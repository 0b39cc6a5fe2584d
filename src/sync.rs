//! C2 — Sync Engine: reconciles local state with the remote object-fs
//! namespace using full snapshots, coordinated through the manifest and
//! the sync lease (C3).

use std::sync::Arc;

use chrono::Utc;

use crate::collaborators::{AuthClient, ObjectFs};
use crate::error::Error;
use crate::lock::{self, DEFAULT_LEASE_TIMEOUT_SECS};
use crate::manifest::{self, BackupEntry, Manifest};
use crate::store::{self, LocalStore, SQLITE_MAGIC};

/// Couples a [`LocalStore`] to its remote collaborators for one database
/// name. `device_id` is stamped onto manifest entries for observability.
/// Held behind an `Arc` rather than a borrow so a [`crate::open::Handle`]
/// can own both the store and its sync engine together.
pub struct SyncEngine {
    store: Arc<LocalStore>,
    name: String,
    device_id: String,
    auth: Box<dyn AuthClient>,
    object_fs: Box<dyn ObjectFs>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<LocalStore>,
        name: impl Into<String>,
        device_id: impl Into<String>,
        auth: Box<dyn AuthClient>,
        object_fs: Box<dyn ObjectFs>,
    ) -> Self {
        Self {
            store,
            name: name.into(),
            device_id: device_id.into(),
            auth,
            object_fs,
        }
    }

    fn encrypted_name(&self) -> Result<String, Error> {
        self.object_fs.encrypt_path(&self.name)
    }

    fn manifest_path(&self, encrypted_name: &str) -> String {
        format!("{encrypted_name}/manifest.json")
    }

    fn blob_path(&self, encrypted_name: &str, seq: u64, hash: &str) -> String {
        format!("{encrypted_name}/{seq}-{hash}")
    }

    fn load_manifest(&self, encrypted_name: &str) -> Result<Manifest, Error> {
        use std::io::Read;
        let path = self.manifest_path(encrypted_name);
        match self.object_fs.open(&path) {
            Ok(mut reader) => {
                let mut bytes = Vec::new();
                reader.read_to_end(&mut bytes)?;
                if bytes.is_empty() {
                    Ok(Manifest::empty())
                } else {
                    Manifest::parse(&bytes)
                }
            }
            // Absent manifest is treated as empty, per spec.md §3.
            Err(_) => Ok(Manifest::empty()),
        }
    }

    fn save_manifest(&self, encrypted_name: &str, manifest: &Manifest) -> Result<(), Error> {
        let path = self.manifest_path(encrypted_name);
        self.object_fs.write_file(&path, &manifest.to_bytes()?)
    }

    /// Entry point after a local write commits: push one full snapshot,
    /// after first pulling and under the sync lease. `ErrSyncLockHeld` is
    /// not fatal — the local write already committed.
    pub fn sync_after_write(&self) -> Result<(), Error> {
        lock::with_lock(&self.store, DEFAULT_LEASE_TIMEOUT_SECS, |_lease| {
            tracing::info!(db = %self.name, "sync: starting push cycle");
            let local_max = self.store.get_meta("max_version")? as u64;
            self.sync_from(local_max)?;

            let (pending_count, _) = self.store.pending_ops_summary()?;
            if pending_count == 0 {
                tracing::info!(db = %self.name, "sync: nothing pending, skipping push");
                return Ok(());
            }

            let encrypted_name = self.encrypted_name()?;
            let seq = self.auth.next_seq(&encrypted_name)?;
            self.store.set_meta("max_version", seq as i64)?;

            let mut blob = Vec::new();
            self.store.backup(&mut blob)?;
            let hash = manifest::content_hash(&blob);

            // Idempotent: identical content under the same (seq, hash) path
            // is a no-op from the object fs's point of view.
            self.object_fs
                .write_file(&self.blob_path(&encrypted_name, seq, &hash), &blob)?;

            let mut manifest = self.load_manifest(&encrypted_name)?;
            manifest.add_backup(BackupEntry {
                seq,
                hash,
                created_at: Utc::now().to_rfc3339(),
                device_id: Some(self.device_id.clone()),
            });
            self.save_manifest(&encrypted_name, &manifest)?;
            self.store.clear_pending_ops()?;

            self.store.set_meta("_meta:last_sync", Utc::now().timestamp())?;
            tracing::info!(db = %self.name, seq, "sync: push cycle complete");
            Ok(())
        })
    }

    /// Pull: restore the single highest remote snapshot newer than `mv`.
    /// Full-snapshot mode is authoritative, so intermediate snapshots are
    /// superseded and never applied.
    pub fn sync_from(&self, mv: u64) -> Result<(), Error> {
        let encrypted_name = self.encrypted_name()?;
        let manifest = self.load_manifest(&encrypted_name)?;

        let candidates: Vec<(u64, String)> = if !manifest.backups.is_empty() {
            manifest
                .backups
                .iter()
                .filter(|b| b.seq > mv)
                .map(|b| (b.seq, b.hash.clone()))
                .collect()
        } else {
            // Fallback for legacy layouts without a manifest: list the
            // remote directory and parse entries as `<seq>-<hash>`.
            self.object_fs
                .read_dir(&encrypted_name)?
                .iter()
                .filter_map(|entry| parse_blob_name(entry))
                .filter(|(seq, _)| *seq > mv)
                .collect()
        };

        let Some(&(max_seq, ref max_hash)) = candidates.iter().max_by_key(|(seq, _)| *seq) else {
            return Ok(());
        };

        let blob_path = self.blob_path(&encrypted_name, max_seq, max_hash);
        let mut reader = self.object_fs.open(&blob_path)?;
        let mut bytes = Vec::new();
        use std::io::Read;
        reader.read_to_end(&mut bytes)?;

        match store::restore_bytes(&bytes, self.store.path()) {
            Ok(()) => {
                self.store.reload()?;
                self.store.set_meta("max_version", max_seq as i64)?;
                Ok(())
            }
            Err(Error::NotSqlite) => {
                tracing::warn!(path = %blob_path, "sync: foreign-format blob, scrubbing");
                for (seq, hash) in &candidates {
                    let _ = self.object_fs.remove(&self.blob_path(&encrypted_name, *seq, hash));
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Close, remove the main file and its `-wal`/`-shm` siblings, reopen,
    /// then `Sync()` to repopulate from remote. The caller is responsible
    /// for reopening its `LocalStore` handle afterward; this performs the
    /// file-level reset and the repopulating pull.
    pub fn reset(&self) -> Result<(), Error> {
        self.store.wipe_and_reinit()?;
        self.sync_from(0)
    }
}

fn parse_blob_name(name: &str) -> Option<(u64, String)> {
    let (seq_str, hash) = name.split_once('-')?;
    let seq: u64 = seq_str.parse().ok()?;
    Some((seq, hash.to_string()))
}
