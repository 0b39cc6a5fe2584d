use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retry schedule for [`crate::open::open_with_fallback`]'s write-path retry.
///
/// `delay_i = min(base_delay * 2^i, max_delay)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_ATTEMPTS: u32 = 3;
    pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(2);

    pub fn default_schedule() -> Self {
        Self {
            attempts: Self::DEFAULT_ATTEMPTS,
            base_delay: Self::DEFAULT_BASE_DELAY,
            max_delay: Self::DEFAULT_MAX_DELAY,
        }
    }

    /// Suppresses retry entirely. Distinct from `default_schedule` with
    /// zeroed fields: once set, [`Config::apply_defaults`] must not
    /// overwrite it.
    pub fn no_retry() -> Self {
        Self {
            attempts: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// The delay before retry attempt `i` (0-indexed).
    pub fn delay_for_attempt(&self, i: u32) -> Duration {
        let scaled = self.base_delay.saturating_mul(1u32.checked_shl(i).unwrap_or(u32::MAX));
        scaled.min(self.max_delay)
    }
}

/// Top-level configuration for a [`crate::open::Handle`].
///
/// `retry` distinguishes "not set" from "zero" by wrapping in an `Option`:
/// only an unset `retry` gets [`RetryPolicy::default_schedule`] injected by
/// [`Config::apply_defaults`]. `with_no_write_retry` sets `retry` to
/// `Some(RetryPolicy::no_retry())`, which survives default application.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory root; the database lives at `<path>/kv/<name>.db`.
    pub path: PathBuf,
    pub retry: Option<RetryPolicy>,
}

impl Config {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retry: None,
        }
    }

    /// Suppress write-path retry on `OpenWithFallback`. Preserved through
    /// [`Config::apply_defaults`].
    pub fn with_no_write_retry(mut self) -> Self {
        self.retry = Some(RetryPolicy::no_retry());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Fill in the default retry schedule if none was set. Idempotent.
    pub fn apply_defaults(mut self) -> Self {
        if self.retry.is_none() {
            self.retry = Some(RetryPolicy::default_schedule());
        }
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.unwrap_or_else(RetryPolicy::default_schedule)
    }

    /// Path to the database file for a given database name.
    pub fn db_path(&self, name: &str) -> PathBuf {
        self.path.join("kv").join(format!("{name}.db"))
    }

    pub fn kv_dir(&self) -> PathBuf {
        self.path.join("kv")
    }
}

/// Validate a path for use as a temp file target in `Backup`: reject NUL,
/// newline/CR, and double any embedded quote per SQL identifier escaping.
pub fn sanitize_sql_path_literal(path: &Path) -> crate::error::Result<String> {
    let raw = path.to_string_lossy();
    if raw.contains('\0') || raw.contains('\n') || raw.contains('\r') {
        return Err(crate::Error::InvalidConfig(
            "path contains a forbidden control character".to_string(),
        ));
    }
    Ok(raw.replace('\'', "''"))
}
