//! Shared test fixtures

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use exptrac_keys::{
    AccessPolicy, BiometricGate, Clock, KeyError, KeyLifecycleManager, KeyResult, MemoryBlobStore,
    MockBiometrics, SecureBlobStore,
};
use exptrac_logging::init_console_logging;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

/// Clock that moves forward one second every time it is read
pub struct SteppingClock {
    next: AtomicI64,
}

impl SteppingClock {
    pub fn new() -> Self {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        Self {
            next: AtomicI64::new(start.timestamp()),
        }
    }
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let secs = self.next.fetch_add(1, Ordering::SeqCst);
        Utc.timestamp_opt(secs, 0).unwrap()
    }
}

/// Memory store whose writes or deletes on chosen slots can be made to fail
pub struct FlakyStore {
    inner: MemoryBlobStore,
    failing_slots: Mutex<HashSet<String>>,
    failing_deletes: Mutex<HashSet<String>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryBlobStore::new(),
            failing_slots: Mutex::new(HashSet::new()),
            failing_deletes: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_writes_to(&self, slot: &str) {
        self.failing_slots.lock().unwrap().insert(slot.to_string());
    }

    pub fn fail_deletes_to(&self, slot: &str) {
        self.failing_deletes.lock().unwrap().insert(slot.to_string());
    }

    pub fn heal(&self) {
        self.failing_slots.lock().unwrap().clear();
        self.failing_deletes.lock().unwrap().clear();
    }

    pub async fn policy(&self, slot: &str) -> Option<AccessPolicy> {
        self.inner.policy(slot).await
    }
}

#[async_trait]
impl SecureBlobStore for FlakyStore {
    async fn put(&self, name: &str, bytes: &[u8], policy: AccessPolicy) -> KeyResult<()> {
        if self.failing_slots.lock().unwrap().contains(name) {
            return Err(KeyError::Storage(format!("simulated write failure on {}", name)));
        }
        self.inner.put(name, bytes, policy).await
    }

    async fn get(&self, name: &str) -> KeyResult<Option<Zeroizing<Vec<u8>>>> {
        self.inner.get(name).await
    }

    async fn delete(&self, name: &str) -> KeyResult<()> {
        if self.failing_deletes.lock().unwrap().contains(name) {
            return Err(KeyError::Storage(format!("simulated delete failure on {}", name)));
        }
        self.inner.delete(name).await
    }
}

pub async fn manager_with(
    store: Arc<dyn SecureBlobStore>,
    biometrics: Arc<MockBiometrics>,
) -> KeyLifecycleManager {
    init_console_logging("exptrac-keys-tests", "warn");
    KeyLifecycleManager::builder(store, BiometricGate::new(biometrics))
        .clock(Arc::new(SteppingClock::new()))
        .open()
        .await
        .unwrap()
}

/// Manager over a fresh memory store with biometrics available
pub async fn test_manager() -> (KeyLifecycleManager, Arc<MemoryBlobStore>, Arc<MockBiometrics>) {
    let store = Arc::new(MemoryBlobStore::new());
    let biometrics = Arc::new(MockBiometrics::available());
    let manager = manager_with(store.clone(), biometrics.clone()).await;
    (manager, store, biometrics)
}

/// Manager that already holds a generated key (version 1)
pub async fn manager_with_key() -> (KeyLifecycleManager, Arc<MemoryBlobStore>, Arc<MockBiometrics>) {
    let (manager, store, biometrics) = test_manager().await;
    let key = manager.generate_key().unwrap();
    manager.store_key(&key, false).await.unwrap();
    (manager, store, biometrics)
}
