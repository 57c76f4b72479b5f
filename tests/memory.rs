//! Memory store integration tests
//!
//! Exercise the on-disk store: key files, reopening, and encryption at rest.

use arc_agent::MemoryStore;
use arc_agent::config::MemoryConfig;
use secrecy::SecretString;
use tempfile::TempDir;
use tokio_test::assert_ok;

mod common;

fn config(dir: &TempDir) -> MemoryConfig {
    MemoryConfig {
        db_path: dir.path().join("arc.db"),
        key_path: dir.path().join("keys").join("memory.key"),
        passphrase: None,
        decay_days: 0,
    }
}

#[test]
fn facts_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);

    {
        let store = MemoryStore::open(&config).unwrap();
        store.put("user_name", "Sam", Some("turn_1")).unwrap();
        store.put("favorite_color", "green", None).unwrap();
    }

    assert!(config.key_path.exists());

    let store = assert_ok!(MemoryStore::open(&config));
    let fact = assert_ok!(store.get("user_name")).unwrap();
    assert_eq!(fact.value, "Sam");
    assert_eq!(fact.source_turn_ref.as_deref(), Some("turn_1"));
    assert_eq!(store.count().unwrap(), 2);
}

#[cfg(unix)]
#[test]
fn key_file_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    MemoryStore::open(&config).unwrap();

    let mode = std::fs::metadata(&config.key_path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn values_are_not_on_disk_in_clear() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);

    let store = MemoryStore::open(&config).unwrap();
    store.put("secret_word", "xylophone-magenta", None).unwrap();
    drop(store);

    // Includes any write-ahead log still beside the database
    for entry in std::fs::read_dir(dir.path()).unwrap() {
        let path = entry.unwrap().path();
        if !path.is_file() {
            continue;
        }
        let bytes = std::fs::read(&path).unwrap();
        let haystack = String::from_utf8_lossy(&bytes);
        assert!(!haystack.contains("xylophone-magenta"), "{}", path.display());
        assert!(!haystack.contains("secret_word"), "{}", path.display());
    }
}

#[test]
fn other_passphrase_reads_nothing() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir);
    config.passphrase = Some(SecretString::from("correct horse battery staple".to_string()));

    let store = MemoryStore::open(&config).unwrap();
    store.put("user_name", "Sam", None).unwrap();
    drop(store);

    config.passphrase = Some(SecretString::from("wrong passphrase".to_string()));
    let store = MemoryStore::open(&config).unwrap();
    assert!(store.get("user_name").unwrap().is_none());
    assert!(store.list().unwrap().is_empty());
    assert!(store.relevant("user name", 5).unwrap().is_empty());
}

#[test]
fn shared_store_sees_writes_from_clones() {
    let store = common::setup_test_store();
    let other = store.clone();

    store.put("city", "Lisbon", None).unwrap();
    let fact = other.put("city", "Porto", None).unwrap();

    assert_eq!(fact.value, "Porto");
    assert_eq!(store.get("city").unwrap().unwrap().value, "Porto");
    assert_eq!(store.count().unwrap(), 1);
}
