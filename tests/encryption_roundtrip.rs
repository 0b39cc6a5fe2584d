mod common;

use std::fs;

use kvault::{EncryptKey, LocalStore};

use common::init_tracing;

fn key() -> EncryptKey {
    EncryptKey::from_bytes([14u8; kvault::crypto::KEY_LEN])
}

#[test]
fn literal_unicode_and_binary_values_never_appear_in_the_raw_file_but_roundtrip_exactly() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("enc.db");

    let binary_value: &[u8] = &[0x00, 0x01, 0x02, 0xFF, 0xFE, 0xFD, 0x00, 0x00];
    let unicode_value = "Hello \u{4e16}\u{754c} \u{1f30d} \u{041f}\u{0440}\u{0438}\u{0432}\u{0435}\u{0442} \u{0645}\u{0631}\u{062d}\u{0628}\u{0627}";
    let special_value = r#"!@#$%^&*()_+-={}[]|\:";'<>?,./"#;

    {
        let store = LocalStore::open(&db_path, key(), false).unwrap();
        store.set(b"binary-key", binary_value).unwrap();
        store.set(b"unicode-key", unicode_value.as_bytes()).unwrap();
        store.set(b"special-key", special_value.as_bytes()).unwrap();
    }

    let raw = fs::read(&db_path).unwrap();
    let haystack = String::from_utf8_lossy(&raw);
    assert!(!haystack.contains(unicode_value));
    assert!(!haystack.contains(special_value));
    assert!(!raw.windows(binary_value.len()).any(|w| w == binary_value));

    let store = LocalStore::open(&db_path, key(), false).unwrap();
    assert_eq!(store.get(b"binary-key").unwrap(), binary_value);
    assert_eq!(store.get(b"unicode-key").unwrap(), unicode_value.as_bytes());
    assert_eq!(store.get(b"special-key").unwrap(), special_value.as_bytes());
}
