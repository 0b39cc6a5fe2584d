//! The two external seams the core composes against (`spec.md` §6, §9 design
//! notes): identity/sequence numbers from *auth*, and blob storage from
//! *object fs*. Both are object-safe traits; a blocking `reqwest`-based
//! default implementation of each is provided so the crate is runnable end
//! to end, not just pluggable.

use std::io::Read;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

/// Identity and keys returned by the auth collaborator. `encrypt_keys`
/// supplies the at-rest key described in SPEC_FULL.md §9.
#[derive(Debug, Clone)]
pub struct AuthInfo {
    pub id: String,
    pub jwt: String,
    pub encrypt_keys: Vec<Vec<u8>>,
    pub public_key: Vec<u8>,
}

pub trait AuthClient: Send + Sync {
    /// Monotonically increasing sequence number per `(user, name)`.
    fn next_seq(&self, encrypted_name: &str) -> Result<u64, Error>;
    fn auth(&self) -> Result<AuthInfo, Error>;
}

pub trait ObjectFs: Send + Sync {
    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>, Error>;
    /// Writes the exact bytes under `path`.
    fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), Error>;
    /// Empty (not an error) when `path` does not exist.
    fn read_dir(&self, path: &str) -> Result<Vec<String>, Error>;
    /// Idempotent.
    fn remove(&self, path: &str) -> Result<(), Error>;
    fn encrypt_path(&self, path: &str) -> Result<String, Error>;
}

/// Retry/backoff configuration for the HTTP-backed collaborators.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub bearer_token: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            bearer_token: None,
        }
    }
}

fn build_client(cfg: &HttpClientConfig) -> Result<reqwest::blocking::Client, Error> {
    reqwest::blocking::Client::builder()
        .timeout(cfg.timeout)
        .gzip(true)
        .build()
        .map_err(Error::from)
}

/// Unified retry loop for a request-issuing closure. Retries network errors
/// and 5xx responses with doubling backoff; 4xx responses fail fast.
fn with_retry<T>(
    cfg: &HttpClientConfig,
    mut attempt_fn: impl FnMut() -> Result<T, Error>,
) -> Result<T, Error> {
    let mut backoff = cfg.initial_backoff;
    let mut last_err = None;

    for attempt in 0..=cfg.max_retries {
        if attempt > 0 {
            tracing::debug!(attempt, ?backoff, "http: retrying after backoff");
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(cfg.max_backoff);
        }
        match attempt_fn() {
            Ok(v) => return Ok(v),
            Err(e) => {
                if let Error::Http(inner) = &e {
                    if inner.status().is_some_and(|s| s.is_client_error()) {
                        return Err(e);
                    }
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::Other("all retries exhausted".to_string())))
}

/// Default `AuthClient` backed by blocking `reqwest` calls against the
/// account service.
pub struct HttpAuthClient {
    config: HttpClientConfig,
}

impl HttpAuthClient {
    pub fn new(config: HttpClientConfig) -> Self {
        Self { config }
    }
}

#[derive(Deserialize)]
struct SeqResponse {
    seq: u64,
}

impl AuthClient for HttpAuthClient {
    fn next_seq(&self, encrypted_name: &str) -> Result<u64, Error> {
        let client = build_client(&self.config)?;
        let url = format!("{}/v1/seq/{}", self.config.base_url, encrypted_name);
        with_retry(&self.config, || {
            let mut req = client.post(&url);
            if let Some(token) = &self.config.bearer_token {
                req = req.bearer_auth(token);
            }
            let resp: SeqResponse = req.send()?.error_for_status()?.json()?;
            Ok(resp.seq)
        })
    }

    fn auth(&self) -> Result<AuthInfo, Error> {
        #[derive(Deserialize)]
        struct AuthResponse {
            id: String,
            jwt: String,
            #[serde(default)]
            encrypt_keys: Vec<String>,
            #[serde(default)]
            public_key: String,
        }

        let client = build_client(&self.config)?;
        let url = format!("{}/v1/auth", self.config.base_url);
        let resp: AuthResponse = with_retry(&self.config, || {
            let mut req = client.post(&url);
            if let Some(token) = &self.config.bearer_token {
                req = req.bearer_auth(token);
            }
            Ok(req.send()?.error_for_status()?.json()?)
        })?;

        Ok(AuthInfo {
            id: resp.id,
            jwt: resp.jwt,
            encrypt_keys: resp
                .encrypt_keys
                .iter()
                .map(|s| hex::decode(s).unwrap_or_default())
                .collect(),
            public_key: hex::decode(&resp.public_key).unwrap_or_default(),
        })
    }
}

/// Default `ObjectFs` backed by blocking `reqwest` calls against an HTTP
/// blob-storage frontend. Paths are joined onto `base_url` verbatim; the
/// caller is expected to have already run them through `encrypt_path`.
pub struct HttpObjectFs {
    config: HttpClientConfig,
}

impl HttpObjectFs {
    pub fn new(config: HttpClientConfig) -> Self {
        Self { config }
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

#[derive(Deserialize, Default)]
struct DirListing {
    #[serde(default)]
    entries: Vec<String>,
}

impl ObjectFs for HttpObjectFs {
    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>, Error> {
        let client = build_client(&self.config)?;
        let url = self.url_for(path);
        let bytes = with_retry(&self.config, || {
            let mut req = client.get(&url);
            if let Some(token) = &self.config.bearer_token {
                req = req.bearer_auth(token);
            }
            Ok(req.send()?.error_for_status()?.bytes()?.to_vec())
        })?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), Error> {
        let client = build_client(&self.config)?;
        let url = self.url_for(path);
        with_retry(&self.config, || {
            let mut req = client.put(&url).body(bytes.to_vec());
            if let Some(token) = &self.config.bearer_token {
                req = req.bearer_auth(token);
            }
            req.send()?.error_for_status()?;
            Ok(())
        })
    }

    fn read_dir(&self, path: &str) -> Result<Vec<String>, Error> {
        let client = build_client(&self.config)?;
        let url = self.url_for(path);
        let result = with_retry(&self.config, || {
            let mut req = client.get(&url);
            if let Some(token) = &self.config.bearer_token {
                req = req.bearer_auth(token);
            }
            let resp = req.send()?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Ok(DirListing::default());
            }
            let listing: DirListing = resp.error_for_status()?.json()?;
            Ok(listing)
        })?;
        Ok(result.entries)
    }

    fn remove(&self, path: &str) -> Result<(), Error> {
        let client = build_client(&self.config)?;
        let url = self.url_for(path);
        with_retry(&self.config, || {
            let mut req = client.delete(&url);
            if let Some(token) = &self.config.bearer_token {
                req = req.bearer_auth(token);
            }
            let resp = req.send()?;
            if resp.status() != reqwest::StatusCode::NOT_FOUND {
                resp.error_for_status()?;
            }
            Ok(())
        })
    }

    fn encrypt_path(&self, path: &str) -> Result<String, Error> {
        // The object-fs collaborator's own path encryption is outside this
        // core's responsibility (SPEC_FULL.md §6); identity is a placeholder
        // until a real Encrypt-keys collaborator is wired in by the host.
        Ok(path.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_teacher_style_backoff_schedule() {
        let cfg = HttpClientConfig::default();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.initial_backoff, Duration::from_millis(500));
        assert_eq!(cfg.max_backoff, Duration::from_secs(30));
    }
}
