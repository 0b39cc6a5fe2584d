//! Shared fakes for the end-to-end scenarios in `spec.md` §8. These stand in
//! for a real account service and object-storage backend.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

use kvault::{AuthClient, AuthInfo, Error, ObjectFs};

/// Sequence numbers come from a single account service shared by every
/// device, never per-device state — `AuthHandle` models that by wrapping a
/// shared counter.
pub struct SharedAuth {
    next: Mutex<u64>,
}

impl SharedAuth {
    pub fn new_shared() -> Arc<SharedAuth> {
        Arc::new(SharedAuth { next: Mutex::new(0) })
    }
}

pub struct AuthHandle(pub Arc<SharedAuth>);

impl AuthClient for AuthHandle {
    fn next_seq(&self, _encrypted_name: &str) -> Result<u64, Error> {
        let mut n = self.0.next.lock().unwrap();
        *n += 1;
        Ok(*n)
    }

    fn auth(&self) -> Result<AuthInfo, Error> {
        Ok(AuthInfo {
            id: "test-user".to_string(),
            jwt: "test-jwt".to_string(),
            encrypt_keys: vec![],
            public_key: vec![],
        })
    }
}

#[derive(Default)]
pub struct InMemoryRemote {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

/// A handle onto a shared [`InMemoryRemote`], implementing `ObjectFs`. Each
/// simulated device gets its own `RemoteHandle` over the same backing store.
pub struct RemoteHandle(pub Arc<InMemoryRemote>);

impl RemoteHandle {
    pub fn new_remote() -> Arc<InMemoryRemote> {
        Arc::new(InMemoryRemote::default())
    }

    pub fn blob_count(remote: &Arc<InMemoryRemote>) -> usize {
        remote.blobs.lock().unwrap().len()
    }
}

impl ObjectFs for RemoteHandle {
    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>, Error> {
        let blobs = self.0.blobs.lock().unwrap();
        match blobs.get(path) {
            Some(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            None => Ok(Box::new(Cursor::new(Vec::new()))),
        }
    }

    fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), Error> {
        self.0.blobs.lock().unwrap().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read_dir(&self, prefix: &str) -> Result<Vec<String>, Error> {
        let blobs = self.0.blobs.lock().unwrap();
        Ok(blobs
            .keys()
            .filter_map(|k| k.strip_prefix(&format!("{prefix}/")))
            .filter(|rest| !rest.contains('/'))
            .map(|s| s.to_string())
            .collect())
    }

    fn remove(&self, path: &str) -> Result<(), Error> {
        self.0.blobs.lock().unwrap().remove(path);
        Ok(())
    }

    fn encrypt_path(&self, path: &str) -> Result<String, Error> {
        Ok(path.to_string())
    }
}

pub fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}
