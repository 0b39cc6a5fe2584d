use thiserror::Error;

pub type Result<T> = std::result::Result<T, self::Error>;

/// Operations that can be rejected while a handle is in read-only mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Set,
    Delete,
    Reset,
    Sync,
}

impl std::fmt::Display for WriteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WriteOp::Set => "Set",
            WriteOp::Delete => "Delete",
            WriteOp::Reset => "Reset",
            WriteOp::Sync => "Sync",
        };
        f.write_str(s)
    }
}

/// Substrings the underlying SQLite engine is known to emit for a locked
/// database file. Checked lowercase, in addition to a wrapped `DatabaseLocked`.
const LOCK_INDICATOR_SUBSTRINGS: &[&str] = &[
    "cannot acquire directory lock",
    "resource temporarily unavailable",
    "lock",
    "another process",
];

#[derive(Error, Debug)]
pub enum Error {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("key not found")]
    MissingKey,

    #[error("database at {path} is locked by another process: {source}")]
    DatabaseLocked {
        path: String,
        #[source]
        source: Box<Error>,
    },

    #[error("operation {op} rejected: handle is read-only")]
    ReadOnlyMode { op: WriteOp },

    #[error("sync lock is held by another process")]
    SyncLockHeld,

    #[error("remote blob is not a valid SQLite file (foreign format)")]
    NotSqlite,

    #[error("database integrity check failed: {0}")]
    Integrity(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported manifest version {found}, expected at most {max}")]
    UnsupportedManifestVersion { found: u32, max: u32 },

    #[error("repair failed and integrity is still compromised; retry with force")]
    RepairFailed,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Classify whether this error represents the database being locked by
    /// another process — either a structured `DatabaseLocked`, or an
    /// underlying engine error whose message contains one of a small
    /// allowlist of substrings.
    pub fn is_locked(&self) -> bool {
        match self {
            Error::DatabaseLocked { .. } => true,
            Error::Sqlite(e) => message_indicates_lock(&e.to_string()),
            Error::Other(msg) => message_indicates_lock(msg),
            _ => false,
        }
    }

    /// Classify whether this error represents a read-only rejection.
    pub fn is_read_only(&self) -> bool {
        matches!(self, Error::ReadOnlyMode { .. })
    }
}

fn message_indicates_lock(message: &str) -> bool {
    let lower = message.to_lowercase();
    LOCK_INDICATOR_SUBSTRINGS
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Free-function equivalents of [`Error::is_locked`] and [`Error::is_read_only`].
pub fn is_locked(err: &Error) -> bool {
    err.is_locked()
}

pub fn is_read_only(err: &Error) -> bool {
    err.is_read_only()
}
