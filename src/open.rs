//! C7 — Open / Fallback / Session API: the entry point callers actually use.
//! Wraps [`LocalStore`] with the engine's exclusive file lock, read-only
//! fallback, retry-with-backoff, and short-lived transactional sessions.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use fs4::FileExt as _;

use crate::config::{Config, RetryPolicy};
use crate::crypto::EncryptKey;
use crate::error::Error;
use crate::store::{self, LocalStore};
use crate::sync::SyncEngine;

fn lock_path(db_path: &Path) -> PathBuf {
    store::with_suffix(db_path, ".lock")
}

/// Best-effort OS-level exclusive lock alongside the database file, held for
/// the lifetime of a read-write [`Handle`]. Released automatically on drop.
struct FileLock(fs::File);

impl FileLock {
    fn try_acquire(db_path: &Path) -> Result<Self, Error> {
        let path = lock_path(db_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|e| {
            Error::DatabaseLocked {
                path: db_path.display().to_string(),
                source: Box::new(Error::Other(e.to_string())),
            }
        })?;
        Ok(FileLock(file))
    }
}

/// A live handle to one named database. Read-write handles hold the
/// engine's exclusive file lock for their lifetime; read-only handles hold
/// none and reject writes outright.
///
/// `sync` is attached with [`Handle::with_sync`]. When present,
/// [`Handle::set`]/[`Handle::delete`] call [`SyncEngine::sync_after_write`]
/// after the local write commits, matching the documented per-write data
/// flow; [`LocalStore::set`]/[`LocalStore::delete`] remain available via
/// [`Handle::store`] for callers that want to batch writes before syncing.
pub struct Handle {
    store: Arc<LocalStore>,
    sync: Option<SyncEngine>,
    _lock: Option<FileLock>,
}

impl Handle {
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    /// Clone of the store handle's `Arc`, for constructing a [`SyncEngine`]
    /// that shares this handle's connection (see [`Handle::with_sync`]).
    pub fn store_arc(&self) -> Arc<LocalStore> {
        self.store.clone()
    }

    pub fn is_read_only(&self) -> bool {
        self.store.is_read_only()
    }

    /// Attach a sync engine over this handle's store. Subsequent
    /// `set`/`delete` calls push after every successful write.
    pub fn with_sync(mut self, sync: SyncEngine) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn sync(&self) -> Option<&SyncEngine> {
        self.sync.as_ref()
    }

    /// Write a value, then `syncAfterWrite` if a sync engine is attached.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.store.set(key, value)?;
        if let Some(sync) = &self.sync {
            sync.sync_after_write()?;
        }
        Ok(())
    }

    /// Delete a value, then `syncAfterWrite` if a sync engine is attached.
    pub fn delete(&self, key: &[u8]) -> Result<(), Error> {
        self.store.delete(key)?;
        if let Some(sync) = &self.sync {
            sync.sync_after_write()?;
        }
        Ok(())
    }
}

/// Acquire the engine's exclusive file lock and open read-write.
pub fn open(config: &Config, name: &str, encrypt_key: EncryptKey) -> Result<Handle, Error> {
    let path = config.db_path(name);
    let lock = FileLock::try_acquire(&path)?;
    let store = Arc::new(LocalStore::open(&path, encrypt_key, false)?);
    Ok(Handle {
        store,
        sync: None,
        _lock: Some(lock),
    })
}

/// Open without the exclusive lock. Writes reject with `ErrReadOnlyMode`;
/// a `SyncEngine` can still be attached via `with_sync`, but `Sync()`
/// against a read-only store has no useful effect since `Set`/`Delete`
/// never populate `pending_ops`.
pub fn open_read_only(config: &Config, name: &str, encrypt_key: EncryptKey) -> Result<Handle, Error> {
    let path = config.db_path(name);
    let store = Arc::new(LocalStore::open(&path, encrypt_key, true)?);
    Ok(Handle {
        store,
        sync: None,
        _lock: None,
    })
}

/// Try read-write; on a lock-indicator error, retry per `config`'s
/// [`RetryPolicy`], then fall back to read-only.
pub fn open_with_fallback(config: &Config, name: &str, encrypt_key: EncryptKey) -> Result<Handle, Error> {
    let policy = config.retry_policy();
    let mut last_err = match open(config, name, encrypt_key.clone()) {
        Ok(handle) => return Ok(handle),
        Err(e) if e.is_locked() => e,
        Err(e) => return Err(e),
    };

    for attempt in 0..policy.attempts {
        let delay = policy.delay_for_attempt(attempt);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        match open(config, name, encrypt_key.clone()) {
            Ok(handle) => return Ok(handle),
            Err(e) if e.is_locked() => last_err = e,
            Err(e) => return Err(e),
        }
    }

    tracing::warn!(db = %name, error = %last_err, "open: falling back to read-only after exhausting retries");
    open_read_only(config, name, encrypt_key)
}

/// Open read-write, run `f`, then close — releasing the file lock
/// regardless of `f`'s outcome.
pub fn with_handle<R>(
    config: &Config,
    name: &str,
    encrypt_key: EncryptKey,
    f: impl FnOnce(&Handle) -> Result<R, Error>,
) -> Result<R, Error> {
    let handle = open(config, name, encrypt_key)?;
    f(&handle)
}

/// Read-only equivalent of [`with_handle`].
pub fn with_handle_read_only<R>(
    config: &Config,
    name: &str,
    encrypt_key: EncryptKey,
    f: impl FnOnce(&Handle) -> Result<R, Error>,
) -> Result<R, Error> {
    let handle = open_read_only(config, name, encrypt_key)?;
    f(&handle)
}

/// Fallback equivalent of [`with_handle`].
pub fn with_handle_fallback<R>(
    config: &Config,
    name: &str,
    encrypt_key: EncryptKey,
    f: impl FnOnce(&Handle) -> Result<R, Error>,
) -> Result<R, Error> {
    let handle = open_with_fallback(config, name, encrypt_key)?;
    f(&handle)
}
