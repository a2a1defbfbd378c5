//! Key lifecycle tests: store, retrieve, rotate, delete

mod common;

use common::{manager_with, manager_with_key, test_manager, FlakyStore, SteppingClock};
use exptrac_keys::{
    slots, BiometricGate, EntropySource, KeyError, KeyLifecycleManager, KeyMaterial,
    AccessPolicy, MockBiometrics, ProgressObserver, RotationStage, SecureBlobStore,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn test_get_key_before_any_key_is_none() {
    let (manager, _store, _bio) = test_manager().await;

    // No key yet is not an error
    assert!(manager.get_key().await.unwrap().is_none());
    assert!(!manager.has_key().await.unwrap());
    assert!(manager.metadata().await.is_none());
    assert_eq!(manager.current_version().await, 1);
}

#[tokio::test]
async fn test_store_then_get_round_trip() {
    let (manager, _store, _bio) = test_manager().await;
    let key = manager.generate_key().unwrap();

    manager.store_key(&key, false).await.unwrap();

    let loaded = manager.get_key().await.unwrap().unwrap();
    assert_eq!(loaded, key);

    let metadata = manager.metadata().await.unwrap();
    assert_eq!(metadata.version, 1);
    assert_eq!(metadata.algorithm, "AES-256");
    assert_eq!(metadata.key_size, 256);
    assert!(metadata.last_rotated.is_none());
    assert!(!metadata.backup_enabled);
}

#[tokio::test]
async fn test_key_written_device_only_without_auth_by_default() {
    let (manager, store, _bio) = manager_with_key().await;
    let policy = store.policy(slots::PRIMARY_KEY).await.unwrap();
    assert!(policy.device_only);
    assert!(!policy.require_auth);
    assert_eq!(manager.current_version().await, 1);
}

#[tokio::test]
async fn test_rotation_increments_version_by_one() {
    let (manager, _store, _bio) = manager_with_key().await;

    for expected in 2..=5 {
        manager.rotate(None).await.unwrap();
        assert_eq!(manager.current_version().await, expected);
        assert_eq!(manager.metadata().await.unwrap().version, expected);
    }
}

#[tokio::test]
async fn test_rotation_preserves_created_at() {
    let (manager, _store, _bio) = manager_with_key().await;
    let created_at = manager.metadata().await.unwrap().created_at;

    for _ in 0..3 {
        manager.rotate(None).await.unwrap();
    }

    let metadata = manager.metadata().await.unwrap();
    assert_eq!(metadata.created_at, created_at);
    let last_rotated = metadata.last_rotated.unwrap();
    assert!(last_rotated > created_at);
}

#[tokio::test]
async fn test_rotation_returns_the_new_stored_key() {
    let (manager, _store, _bio) = manager_with_key().await;
    let old_key = manager.get_key().await.unwrap().unwrap();

    let new_key = manager.rotate(None).await.unwrap();

    assert_ne!(new_key, old_key);
    assert_eq!(manager.get_key().await.unwrap().unwrap(), new_key);
}

#[tokio::test]
async fn test_rotate_without_key_fails_and_stays_absent() {
    let (manager, _store, _bio) = test_manager().await;

    let result = manager.rotate(None).await;
    assert!(matches!(result, Err(KeyError::NoKey)));

    assert!(!manager.has_key().await.unwrap());
    assert!(manager.metadata().await.is_none());
    assert_eq!(manager.current_version().await, 1);
}

#[tokio::test]
async fn test_rotation_reports_progress_milestones() {
    let (manager, _store, _bio) = manager_with_key().await;
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    let observer: ProgressObserver = &move |stage: RotationStage| {
        sink.lock().unwrap().push(stage.percent());
    };
    manager.rotate(Some(observer)).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![0, 20, 40, 60, 80, 100]);
}

#[tokio::test]
async fn test_rotation_rolls_back_when_metadata_write_fails() {
    let store = Arc::new(FlakyStore::new());
    let manager = manager_with(store.clone(), Arc::new(MockBiometrics::available())).await;
    let key = manager.generate_key().unwrap();
    manager.store_key(&key, false).await.unwrap();
    let before = manager.metadata().await.unwrap();

    store.fail_writes_to(slots::KEY_METADATA);
    let result = manager.rotate(None).await;
    assert!(matches!(result, Err(KeyError::Storage(_))));

    // Old key is still the system of record
    store.heal();
    assert_eq!(manager.get_key().await.unwrap().unwrap(), key);
    assert_eq!(manager.current_version().await, 1);
    assert_eq!(manager.metadata().await.unwrap(), before);

    // Reopening sees the same consistent state
    let reopened = manager_with(store.clone(), Arc::new(MockBiometrics::available())).await;
    assert_eq!(reopened.current_version().await, 1);
    assert_eq!(reopened.get_key().await.unwrap().unwrap(), key);
}

#[tokio::test]
async fn test_rotation_fails_cleanly_when_key_write_fails() {
    let store = Arc::new(FlakyStore::new());
    let manager = manager_with(store.clone(), Arc::new(MockBiometrics::available())).await;
    let key = manager.generate_key().unwrap();
    manager.store_key(&key, false).await.unwrap();

    store.fail_writes_to(slots::PRIMARY_KEY);
    assert!(matches!(manager.rotate(None).await, Err(KeyError::Storage(_))));
    store.heal();

    assert_eq!(manager.current_version().await, 1);
    assert_eq!(manager.get_key().await.unwrap().unwrap(), key);
}

/// Entropy source that can be switched off mid-test
struct SwitchableEntropy {
    enabled: AtomicBool,
}

impl EntropySource for SwitchableEntropy {
    fn try_fill(&self, dest: &mut [u8]) -> Result<(), String> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Err("entropy pool unavailable".to_string());
        }
        for (i, byte) in dest.iter_mut().enumerate() {
            *byte = (i as u8).wrapping_mul(7).wrapping_add(1);
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_rotation_with_no_entropy_is_generation_error() {
    let entropy = Arc::new(SwitchableEntropy {
        enabled: AtomicBool::new(true),
    });
    let store = Arc::new(exptrac_keys::MemoryBlobStore::new());
    let manager = KeyLifecycleManager::builder(
        store,
        BiometricGate::new(Arc::new(MockBiometrics::available())),
    )
    .clock(Arc::new(SteppingClock::new()))
    .entropy(entropy.clone())
    .open()
    .await
    .unwrap();

    let key = manager.generate_key().unwrap();
    manager.store_key(&key, false).await.unwrap();

    entropy.enabled.store(false, Ordering::SeqCst);
    assert!(matches!(manager.generate_key(), Err(KeyError::Generation(_))));
    assert!(matches!(manager.rotate(None).await, Err(KeyError::Generation(_))));

    assert_eq!(manager.current_version().await, 1);
    assert_eq!(manager.get_key().await.unwrap().unwrap(), key);
}

#[tokio::test]
async fn test_delete_key_resets_state() {
    let (manager, store, _bio) = manager_with_key().await;
    manager.rotate(None).await.unwrap();

    manager.delete_key(false).await.unwrap();

    assert!(manager.get_key().await.unwrap().is_none());
    assert!(manager.metadata().await.is_none());
    assert_eq!(manager.current_version().await, 1);
    assert!(!manager.is_biometric_enabled().await);
    assert!(!store.contains(slots::PRIMARY_KEY).await);
    assert!(!store.contains(slots::KEY_VERSION).await);
    assert!(!store.contains(slots::KEY_METADATA).await);
    assert!(!store.contains(slots::BIOMETRIC_PREFERENCE).await);

    // A new key starts over at version 1
    let key = manager.generate_key().unwrap();
    manager.store_key(&key, false).await.unwrap();
    assert_eq!(manager.metadata().await.unwrap().version, 1);
}

#[tokio::test]
async fn test_partial_delete_still_reports_absent() {
    let store = Arc::new(FlakyStore::new());
    let manager = manager_with(store.clone(), Arc::new(MockBiometrics::available())).await;
    let key = manager.generate_key().unwrap();
    manager.store_key(&key, false).await.unwrap();
    manager.rotate(None).await.unwrap();

    store.fail_deletes_to(slots::KEY_METADATA);
    assert!(matches!(manager.delete_key(false).await, Err(KeyError::Storage(_))));
    store.heal();

    // Primary slot is gone, so in-memory state is back to defaults
    assert!(!manager.has_key().await.unwrap());
    assert!(manager.get_key().await.unwrap().is_none());
    assert!(manager.metadata().await.is_none());
    assert_eq!(manager.current_version().await, 1);
    assert!(matches!(manager.rotate(None).await, Err(KeyError::NoKey)));

    // Storing again starts over at version 1
    manager.store_key(&key, false).await.unwrap();
    assert_eq!(manager.metadata().await.unwrap().version, 1);
}

#[tokio::test]
async fn test_reopen_loads_persisted_state() {
    let (manager, store, bio) = manager_with_key().await;
    manager.rotate(None).await.unwrap();
    manager.rotate(None).await.unwrap();
    let key = manager.get_key().await.unwrap().unwrap();
    let metadata = manager.metadata().await.unwrap();
    drop(manager);

    let reopened = manager_with(store, bio).await;
    assert_eq!(reopened.current_version().await, 3);
    assert_eq!(reopened.metadata().await.unwrap(), metadata);
    assert_eq!(reopened.get_key().await.unwrap().unwrap(), key);
}

#[tokio::test]
async fn test_open_tolerates_corrupt_records() {
    let (manager, store, bio) = manager_with_key().await;
    drop(manager);

    store
        .put(slots::KEY_VERSION, b"not-a-number", AccessPolicy::device_only())
        .await
        .unwrap();

    // Falls back to the version recorded in metadata
    let reopened = manager_with(store, bio).await;
    assert_eq!(reopened.current_version().await, 1);
    assert!(reopened.get_key().await.unwrap().is_some());
}

#[test]
fn test_wrong_sized_key_material_is_rejected() {
    assert!(KeyMaterial::from_slice(&[0u8; 31]).is_err());
    assert!(KeyMaterial::from_slice(&[0u8; 33]).is_err());
}
