mod common;

use kvault::{EncryptKey, Error, LocalStore};

use common::init_tracing;

fn key() -> EncryptKey {
    EncryptKey::from_bytes([13u8; kvault::crypto::KEY_LEN])
}

#[test]
fn read_only_handle_allows_reads_and_rejects_every_write() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("ro.db");

    {
        let store = LocalStore::open(&db_path, key(), false).unwrap();
        store.set(b"test-key", b"test-value").unwrap();
    }

    let store = LocalStore::open(&db_path, key(), true).unwrap();
    assert!(store.is_read_only());
    assert_eq!(store.get(b"test-key").unwrap(), b"test-value");
    assert!(matches!(store.set(b"new-key", b"new-value"), Err(Error::ReadOnlyMode { .. })));
    assert!(matches!(store.delete(b"test-key"), Err(Error::ReadOnlyMode { .. })));
    assert_eq!(store.keys().unwrap(), vec![b"test-key".to_vec()]);
}
