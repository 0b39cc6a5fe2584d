//! Remote manifest schema (`spec.md` §3): the authoritative, version-tagged
//! index of known snapshot blobs for one database name.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupEntry {
    pub seq: u64,
    /// Hex-encoded first 128 bits of the blob's SHA-256.
    pub hash: String,
    pub created_at: String,
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub version: u32,
    pub latest_seq: u64,
    pub backups: Vec<BackupEntry>,
}

impl Manifest {
    pub fn empty() -> Self {
        Manifest {
            version: MANIFEST_VERSION,
            latest_seq: 0,
            backups: Vec::new(),
        }
    }

    /// Parse manifest bytes. Absent remote data is handled by the caller
    /// (treated as empty) before this is ever invoked; this only validates
    /// what's actually present.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let manifest: Manifest = serde_json::from_slice(bytes)?;
        if manifest.version > MANIFEST_VERSION {
            return Err(Error::UnsupportedManifestVersion {
                found: manifest.version,
                max: MANIFEST_VERSION,
            });
        }
        Ok(manifest)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Idempotent: a no-op when `(seq, hash)` is already present. Keeps
    /// `backups` sorted by `seq` descending and `latest_seq` in sync.
    pub fn add_backup(&mut self, entry: BackupEntry) {
        let already_present = self
            .backups
            .iter()
            .any(|b| b.seq == entry.seq && b.hash == entry.hash);
        if already_present {
            return;
        }
        self.latest_seq = self.latest_seq.max(entry.seq);
        self.backups.push(entry);
        self.backups.sort_by(|a, b| b.seq.cmp(&a.seq));
    }

    pub fn latest(&self) -> Option<&BackupEntry> {
        self.backups.first()
    }
}

/// First 128 bits of SHA-256 of `blob`, hex-encoded. Used as the content
/// address for a snapshot upload.
pub fn content_hash(blob: &[u8]) -> String {
    let digest = Sha256::digest(blob);
    hex::encode(&digest[..16])
}
