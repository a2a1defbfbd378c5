//! Database integration helpers

mod common;

use async_trait::async_trait;
use common::{manager_with_key, test_manager};
use exptrac_config::{BiometricConfig, KeyVaultConfig, StorageConfig};
use exptrac_keys::{
    init_key_manager, open_or_create_key, rotate_and_rekey, KeyError, KeyMaterial, MockBiometrics,
    Rekeyer,
};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Records the keys it was asked to re-encrypt with
struct RecordingRekeyer {
    keys: Mutex<Vec<KeyMaterial>>,
    fail: bool,
}

impl RecordingRekeyer {
    fn new(fail: bool) -> Self {
        Self {
            keys: Mutex::new(Vec::new()),
            fail,
        }
    }
}

#[async_trait]
impl Rekeyer for RecordingRekeyer {
    async fn rekey(&self, new_key: &KeyMaterial) -> Result<(), String> {
        self.keys.lock().unwrap().push(new_key.duplicate());
        if self.fail {
            Err("database is locked".to_string())
        } else {
            Ok(())
        }
    }
}

fn vault_config(dir: &TempDir) -> KeyVaultConfig {
    KeyVaultConfig {
        storage: StorageConfig {
            path: dir.path().to_string_lossy().to_string(),
            master_key: Some("integration test passphrase".to_string()),
        },
        biometric: BiometricConfig::default(),
        log_level: None,
        log_format: None,
    }
}

#[tokio::test]
async fn test_open_or_create_key_is_stable() {
    let (manager, _store, _bio) = test_manager().await;

    let first = open_or_create_key(&manager).await.unwrap();
    let second = open_or_create_key(&manager).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(manager.current_version().await, 1);
}

#[tokio::test]
async fn test_rotate_and_rekey_hands_new_key_to_database() {
    let (manager, _store, _bio) = manager_with_key().await;
    let rekeyer = RecordingRekeyer::new(false);

    let version = rotate_and_rekey(&manager, &rekeyer, None).await.unwrap();

    assert_eq!(version, 2);
    let current = manager.get_key().await.unwrap().unwrap();
    let keys = rekeyer.keys.lock().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0], current);
}

#[tokio::test]
async fn test_failed_rekey_reports_rotated_version() {
    let (manager, _store, _bio) = manager_with_key().await;
    let rekeyer = RecordingRekeyer::new(true);

    match rotate_and_rekey(&manager, &rekeyer, None).await {
        Err(KeyError::Rekey(message)) => assert!(message.contains("version 2")),
        other => panic!("expected Rekey error, got {:?}", other),
    }

    // The rotated key stays current so the rekey can be retried
    assert_eq!(manager.current_version().await, 2);
    let attempted = rekeyer.keys.lock().unwrap()[0].duplicate();
    assert_eq!(manager.get_key().await.unwrap().unwrap(), attempted);
}

#[tokio::test]
async fn test_init_key_manager_uses_file_store() {
    let temp_dir = TempDir::new().unwrap();
    let config = vault_config(&temp_dir);

    let key = {
        let manager = init_key_manager(&config, Arc::new(MockBiometrics::available()))
            .await
            .unwrap();
        open_or_create_key(&manager).await.unwrap()
    };
    assert!(std::fs::read_dir(temp_dir.path()).unwrap().count() > 0);

    let manager = init_key_manager(&config, Arc::new(MockBiometrics::available()))
        .await
        .unwrap();
    assert_eq!(open_or_create_key(&manager).await.unwrap(), key);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rekeys_report_their_own_versions() {
    let (manager, _store, _bio) = manager_with_key().await;
    let manager = Arc::new(manager);
    let rekeyer = Arc::new(RecordingRekeyer::new(false));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let manager = manager.clone();
        let rekeyer = rekeyer.clone();
        tasks.push(tokio::spawn(async move {
            rotate_and_rekey(&manager, rekeyer.as_ref(), None).await
        }));
    }

    let mut versions = Vec::new();
    for task in tasks {
        versions.push(task.await.unwrap().unwrap());
    }
    versions.sort();
    assert_eq!(versions, vec![2, 3, 4, 5]);
    assert_eq!(rekeyer.keys.lock().unwrap().len(), 4);
}
