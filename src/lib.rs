//! `kvault` — a single-user, cloud-synced, encrypted key-value store over an
//! embedded SQLite engine.
//!
//! Component order (leaf to root): [`hlc`] → [`store`] (C1) → [`oplog`] (C4)
//! → [`lock`] (C3) → [`sync`] (C2) → [`doctor`] (C6) → [`open`] (C7).

pub mod collaborators;
pub mod config;
pub mod crypto;
pub mod doctor;
pub mod error;
pub mod hlc;
pub mod lock;
pub mod manifest;
pub mod oplog;
pub mod open;
pub mod store;
pub mod sync;

pub use collaborators::{AuthClient, AuthInfo, HttpAuthClient, HttpClientConfig, HttpObjectFs, ObjectFs};
pub use config::{Config, RetryPolicy};
pub use crypto::EncryptKey;
pub use doctor::{DoctorReport, RepairReport};
pub use error::{is_locked, is_read_only, Error, Result, WriteOp};
pub use hlc::{Clock, HlcTimestamp};
pub use lock::{Lease, DEFAULT_LEASE_TIMEOUT_SECS};
pub use manifest::{content_hash, BackupEntry, Manifest, MANIFEST_VERSION};
pub use oplog::{OpType, RemoteOp};
pub use open::{
    open, open_read_only, open_with_fallback, with_handle, with_handle_fallback,
    with_handle_read_only, Handle,
};
pub use store::LocalStore;
pub use sync::SyncEngine;
