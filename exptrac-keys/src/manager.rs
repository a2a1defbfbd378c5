//! Database key lifecycle manager
//!
//! Owns the single primary key slot and its in-memory state (version,
//! metadata, biometric preference). Lifecycle of the slot:
//!
//! ```text
//! Absent --store_key--> Present --rotate--> Present (version + 1)
//!                          |
//!                          +--delete_key--> Absent
//! ```
//!
//! Operations that change the slot hold the slot's write lock for their whole
//! sequence, so a rotation is never observed half-done. `get_key` only needs
//! the read lock and runs concurrently with other reads. The biometric prompt
//! always happens before a lock is taken.
// Copyright 2025 Exptrac Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::backup::BackupVault;
use crate::biometric::{BiometricGate, AUTHENTICATION_FAILED};
use crate::blob_store::{AccessPolicy, SecureBlobStore};
use crate::clock::{Clock, SystemClock};
use crate::error::{KeyError, KeyResult};
use crate::generator::{EntropySource, KeyMaterialGenerator, OsEntropy};
use crate::key_types::{slots, BackupId, BackupSummary, KeyMaterial, KeyMetadata, RotationStage};
use crate::metadata_store::KeyMetadataStore;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

/// Observer for rotation milestones. Purely informational.
pub type ProgressObserver<'a> = &'a (dyn Fn(RotationStage) + Send + Sync);

/// A committed rotation
#[derive(Debug)]
pub struct Rotation {
    /// The new current key
    pub key: KeyMaterial,
    /// Metadata committed with `key`
    pub metadata: KeyMetadata,
    /// Snapshot of the previous key, when one was taken
    pub backup_id: Option<BackupId>,
}

/// In-memory view of the key slot
#[derive(Debug, Clone)]
struct SlotState {
    version: u32,
    metadata: Option<KeyMetadata>,
    biometric_enabled: bool,
}

impl Default for SlotState {
    fn default() -> Self {
        Self {
            version: 1,
            metadata: None,
            biometric_enabled: false,
        }
    }
}

/// Builder for [`KeyLifecycleManager`]
pub struct KeyLifecycleManagerBuilder {
    store: Arc<dyn SecureBlobStore>,
    gate: BiometricGate,
    clock: Arc<dyn Clock>,
    entropy: Arc<dyn EntropySource>,
}

impl KeyLifecycleManagerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn entropy(mut self, entropy: Arc<dyn EntropySource>) -> Self {
        self.entropy = entropy;
        self
    }

    /// Build the manager and load persisted state
    pub async fn open(self) -> KeyResult<KeyLifecycleManager> {
        let manager = KeyLifecycleManager {
            metadata_store: KeyMetadataStore::new(self.store.clone()),
            vault: BackupVault::new(self.store.clone(), self.clock.clone()),
            generator: KeyMaterialGenerator::new(self.entropy),
            store: self.store,
            gate: self.gate,
            clock: self.clock,
            slot: RwLock::new(SlotState::default()),
        };
        manager.load_configuration().await;
        Ok(manager)
    }
}

/// Manages generation, storage, gated retrieval, rotation, backup and
/// deletion of the database encryption key
pub struct KeyLifecycleManager {
    store: Arc<dyn SecureBlobStore>,
    metadata_store: KeyMetadataStore,
    vault: BackupVault,
    gate: BiometricGate,
    generator: KeyMaterialGenerator,
    clock: Arc<dyn Clock>,
    slot: RwLock<SlotState>,
}

impl KeyLifecycleManager {
    /// Start building a manager over `store`, gated by `gate`.
    /// Defaults to the system clock and the OS CSPRNG.
    pub fn builder(store: Arc<dyn SecureBlobStore>, gate: BiometricGate) -> KeyLifecycleManagerBuilder {
        KeyLifecycleManagerBuilder {
            store,
            gate,
            clock: Arc::new(SystemClock),
            entropy: Arc::new(OsEntropy),
        }
    }

    /// Load version, biometric preference and metadata.
    /// Unreadable records fall back to defaults.
    async fn load_configuration(&self) {
        let mut state = self.slot.write().await;

        let metadata = match self.metadata_store.load().await {
            Ok(metadata) => metadata,
            Err(e) => {
                error!(error = %e, "Failed to load key metadata");
                None
            }
        };

        let version = match self.metadata_store.load_version().await {
            Ok(version) => version,
            Err(e) => {
                error!(error = %e, "Failed to load key version");
                None
            }
        };

        state.biometric_enabled = match self.store.get(slots::BIOMETRIC_PREFERENCE).await {
            Ok(Some(bytes)) => bytes.as_slice() == b"true",
            Ok(None) => false,
            Err(e) => {
                error!(error = %e, "Failed to load biometric preference");
                false
            }
        };

        state.version = version
            .or_else(|| metadata.as_ref().map(|m| m.version))
            .unwrap_or(1);
        state.metadata = metadata;

        debug!(
            version = state.version,
            biometric_enabled = state.biometric_enabled,
            has_metadata = state.metadata.is_some(),
            "Key configuration loaded"
        );
    }

    /// Generate a fresh key without storing it
    pub fn generate_key(&self) -> KeyResult<KeyMaterial> {
        self.generator.generate()
    }

    /// Retrieve the current key.
    ///
    /// `Ok(None)` means no key has been stored yet; a failed or dismissed
    /// biometric prompt is [`KeyError::Authentication`].
    pub async fn get_key(&self) -> KeyResult<Option<KeyMaterial>> {
        info!("Retrieving encryption key");

        let _state = self.authorized_read().await?;
        let key = self.read_primary().await?;

        match &key {
            Some(_) => info!("Encryption key retrieved"),
            None => warn!("No encryption key found"),
        }
        Ok(key)
    }

    /// Store `key` as the current key.
    ///
    /// The key is written first, then the version record, then metadata.
    /// `created_at` survives every store; `last_rotated` is only stamped when
    /// `is_rotation` is set.
    pub async fn store_key(&self, key: &KeyMaterial, is_rotation: bool) -> KeyResult<()> {
        info!(is_rotation, "Storing encryption key");

        let mut state = self.slot.write().await;
        let version = state.version;
        let metadata = self.persist_key(&state, key, version, is_rotation).await?;
        state.metadata = Some(metadata);

        info!(version, "Encryption key stored");
        Ok(())
    }

    /// Replace the current key with a new one and return it.
    ///
    /// The caller re-encrypts its store with the returned key. When backups are
    /// enabled the old key is snapshotted first. The in-memory version only
    /// moves once the new key, version and metadata are all persisted; if the
    /// version or metadata write fails the old key is written back.
    pub async fn rotate(&self, on_progress: Option<ProgressObserver<'_>>) -> KeyResult<KeyMaterial> {
        Ok(self.rotate_committed(on_progress).await?.key)
    }

    /// Like [`rotate`](Self::rotate), returning the committed metadata and the
    /// id of the snapshot taken of the old key, if backups are enabled
    pub async fn rotate_committed(
        &self,
        on_progress: Option<ProgressObserver<'_>>,
    ) -> KeyResult<Rotation> {
        self.rotate_inner(on_progress, false).await
    }

    /// Rotate, always snapshotting the old key first (which also enables
    /// backups). The old key stays recoverable until the caller has
    /// re-encrypted its store.
    pub async fn rotate_with_backup(
        &self,
        on_progress: Option<ProgressObserver<'_>>,
    ) -> KeyResult<Rotation> {
        self.rotate_inner(on_progress, true).await
    }

    async fn rotate_inner(
        &self,
        on_progress: Option<ProgressObserver<'_>>,
        force_backup: bool,
    ) -> KeyResult<Rotation> {
        let report = |stage: RotationStage| {
            if let Some(observer) = on_progress {
                observer(stage);
            }
        };

        info!(force_backup, "Starting key rotation");
        report(RotationStage::Started);

        let mut state = self.authorized_write().await?;
        let old_key = self.read_primary().await?.ok_or(KeyError::NoKey)?;

        report(RotationStage::GeneratingKey);
        let new_key = self.generator.generate()?;

        report(RotationStage::BackingUpOldKey);
        let live = match state.metadata.clone() {
            Some(metadata) => metadata,
            None => KeyMetadata::successor(None, state.version, self.clock.now(), false),
        };
        let mut backup_id = None;
        if force_backup || live.backup_enabled {
            let (id, updated) = self.vault.create_backup(&old_key, &live).await?;
            debug!(backup_id = %id, "Old key backed up before rotation");
            state.metadata = Some(updated);
            backup_id = Some(id);
        }

        report(RotationStage::StoringNewKey);
        let new_version = state.version + 1;
        let metadata = self
            .commit_rotation(&mut state, &old_key, &new_key, new_version)
            .await?;

        report(RotationStage::CleaningUp);
        drop(old_key);

        report(RotationStage::Completed);
        info!(version = new_version, "Key rotation completed");
        Ok(Rotation {
            key: new_key,
            metadata,
            backup_id,
        })
    }

    async fn commit_rotation(
        &self,
        state: &mut SlotState,
        old_key: &KeyMaterial,
        new_key: &KeyMaterial,
        new_version: u32,
    ) -> KeyResult<KeyMetadata> {
        let policy = self.key_policy(state.biometric_enabled);
        self.store
            .put(slots::PRIMARY_KEY, new_key.as_bytes(), policy)
            .await?;

        let metadata =
            KeyMetadata::successor(state.metadata.as_ref(), new_version, self.clock.now(), true);
        let committed = async {
            self.metadata_store.store_version(new_version).await?;
            self.metadata_store.store(&metadata).await
        };

        if let Err(e) = committed.await {
            error!(error = %e, version = new_version, "Rotation commit failed, restoring previous key");
            self.roll_back(state, Some(old_key)).await;
            return Err(e);
        }

        state.version = new_version;
        state.metadata = Some(metadata.clone());
        Ok(metadata)
    }

    /// Put the previous key, version and metadata back after a failed commit.
    /// `state` still describes the previous key; `None` means the slot was
    /// empty.
    async fn roll_back(&self, state: &SlotState, old_key: Option<&KeyMaterial>) {
        let restored = match old_key {
            Some(key) => {
                let policy = self.key_policy(state.biometric_enabled);
                self.store.put(slots::PRIMARY_KEY, key.as_bytes(), policy).await
            }
            None => self.store.delete(slots::PRIMARY_KEY).await,
        };
        if let Err(e) = restored {
            error!(error = %e, "Failed to restore previous key");
        }

        if old_key.is_none() && state.metadata.is_none() {
            if let Err(e) = self.metadata_store.clear().await {
                error!(error = %e, "Failed to clear key records");
            }
            return;
        }
        if let Err(e) = self.metadata_store.store_version(state.version).await {
            error!(error = %e, "Failed to restore previous key version");
        }
        if let Some(metadata) = &state.metadata {
            if let Err(e) = self.metadata_store.store(metadata).await {
                error!(error = %e, "Failed to restore previous key metadata");
            }
        }
    }

    /// Turn biometric gating on or off.
    ///
    /// Turning it on requires available biometrics and a successful live
    /// challenge. Turning it off does not prompt.
    /// The current key is re-stored so its access policy matches.
    pub async fn set_biometric_authentication(&self, enable: bool) -> KeyResult<()> {
        info!(enable, "Updating biometric authentication preference");

        if enable {
            if !self.gate.is_available().await {
                warn!("Biometric authentication is not available on this device");
                return Err(KeyError::BiometricUnavailable);
            }
            self.challenge().await?;
        }

        let mut state = self.slot.write().await;
        let previous = state.biometric_enabled;

        self.write_preference(enable).await?;
        state.biometric_enabled = enable;

        if let Err(e) = self.restore_current_key(&mut state).await {
            error!(error = %e, "Failed to re-store key under new policy, reverting preference");
            state.biometric_enabled = previous;
            if let Err(revert) = self.write_preference(previous).await {
                error!(error = %revert, "Failed to revert biometric preference");
            }
            return Err(e);
        }

        info!(enable, "Biometric authentication preference updated");
        Ok(())
    }

    async fn restore_current_key(&self, state: &mut SlotState) -> KeyResult<()> {
        if let Some(key) = self.read_primary().await? {
            let version = state.version;
            let metadata = self.persist_key(state, &key, version, false).await?;
            state.metadata = Some(metadata);
        }
        Ok(())
    }

    async fn write_preference(&self, enable: bool) -> KeyResult<()> {
        let value = if enable { "true" } else { "false" };
        self.store
            .put(
                slots::BIOMETRIC_PREFERENCE,
                value.as_bytes(),
                AccessPolicy::device_only(),
            )
            .await
    }

    /// Destroy the key, its version record, metadata and the biometric
    /// preference. With `include_backups`, every indexed backup goes too.
    pub async fn delete_key(&self, include_backups: bool) -> KeyResult<()> {
        info!(include_backups, "Deleting encryption key");

        let mut state = self.slot.write().await;

        self.store.delete(slots::PRIMARY_KEY).await?;
        // Slot is Absent from here on, whatever happens to the other records
        *state = SlotState::default();

        self.metadata_store.clear().await?;
        self.store.delete(slots::BIOMETRIC_PREFERENCE).await?;

        if include_backups {
            self.vault.delete_all().await?;
        }

        info!("Encryption key deleted");
        Ok(())
    }

    /// Back up the current key; returns the backup id
    pub async fn create_backup(&self) -> KeyResult<BackupId> {
        info!("Creating key backup");

        let mut state = self.authorized_write().await?;
        let key = self.read_primary().await?.ok_or(KeyError::NoKey)?;

        let live = match state.metadata.clone() {
            Some(metadata) => metadata,
            None => KeyMetadata::successor(None, state.version, self.clock.now(), false),
        };

        let (backup_id, updated) = self.vault.create_backup(&key, &live).await?;
        state.metadata = Some(updated);
        Ok(backup_id)
    }

    /// Backups recorded in the backup index; empty when none can be found
    pub async fn list_backups(&self) -> Vec<BackupSummary> {
        let _state = self.slot.read().await;
        self.vault.list_backups().await
    }

    /// Make a verified backup the current key.
    ///
    /// The version is set to the backup's, which may move it backwards.
    pub async fn restore_backup(&self, backup_id: &str) -> KeyResult<()> {
        info!(backup_id, "Restoring key from backup");

        let mut state = self.slot.write().await;
        let restored = self.vault.restore_backup(backup_id).await?;
        let restored_version = restored.metadata.version;

        if restored_version <= state.version {
            warn!(
                restored_version,
                current_version = state.version,
                "Restored key version is not newer than the current version"
            );
        }

        let previous_key = self.read_primary().await?;
        let policy = self.key_policy(state.biometric_enabled);
        self.store
            .put(slots::PRIMARY_KEY, restored.key.as_bytes(), policy)
            .await?;

        let committed = async {
            self.metadata_store.store_version(restored_version).await?;
            self.metadata_store.store(&restored.metadata).await
        };
        if let Err(e) = committed.await {
            error!(error = %e, backup_id, "Restore commit failed, putting the previous key back");
            self.roll_back(&state, previous_key.as_ref()).await;
            return Err(e);
        }

        state.version = restored_version;
        state.metadata = Some(restored.metadata.clone());

        info!(version = restored_version, "Key restored from backup");
        Ok(())
    }

    pub async fn metadata(&self) -> Option<KeyMetadata> {
        self.slot.read().await.metadata.clone()
    }

    pub async fn current_version(&self) -> u32 {
        self.slot.read().await.version
    }

    pub async fn is_biometric_enabled(&self) -> bool {
        self.slot.read().await.biometric_enabled
    }

    pub async fn is_biometric_available(&self) -> bool {
        self.gate.is_available().await
    }

    /// Whether the primary slot holds a key (no biometric prompt)
    pub async fn has_key(&self) -> KeyResult<bool> {
        let _state = self.slot.read().await;
        Ok(self.store.get(slots::PRIMARY_KEY).await?.is_some())
    }

    fn key_policy(&self, biometric_enabled: bool) -> AccessPolicy {
        AccessPolicy::device_only().with_auth(biometric_enabled)
    }

    async fn persist_key(
        &self,
        state: &SlotState,
        key: &KeyMaterial,
        version: u32,
        is_rotation: bool,
    ) -> KeyResult<KeyMetadata> {
        self.store
            .put(
                slots::PRIMARY_KEY,
                key.as_bytes(),
                self.key_policy(state.biometric_enabled),
            )
            .await?;

        let metadata =
            KeyMetadata::successor(state.metadata.as_ref(), version, self.clock.now(), is_rotation);
        self.metadata_store.store_version(version).await?;
        self.metadata_store.store(&metadata).await?;
        Ok(metadata)
    }

    async fn read_primary(&self) -> KeyResult<Option<KeyMaterial>> {
        match self.store.get(slots::PRIMARY_KEY).await? {
            Some(bytes) => Ok(Some(KeyMaterial::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// One biometric challenge, mapped to [`KeyError::Authentication`]
    async fn challenge(&self) -> KeyResult<()> {
        let outcome = self.gate.authenticate().await;
        if outcome.success {
            Ok(())
        } else {
            warn!(error_code = ?outcome.error_code, "Biometric authentication failed");
            Err(KeyError::Authentication(
                outcome
                    .error_code
                    .unwrap_or_else(|| AUTHENTICATION_FAILED.to_string()),
            ))
        }
    }

    /// Read guard on the slot, prompting first if gating is on
    async fn authorized_read(&self) -> KeyResult<RwLockReadGuard<'_, SlotState>> {
        let mut authorized = false;
        loop {
            let guard = self.slot.read().await;
            if !guard.biometric_enabled || authorized {
                return Ok(guard);
            }
            drop(guard);
            self.challenge().await?;
            authorized = true;
        }
    }

    /// Write guard on the slot, prompting first if gating is on
    async fn authorized_write(&self) -> KeyResult<RwLockWriteGuard<'_, SlotState>> {
        let mut authorized = false;
        loop {
            let guard = self.slot.write().await;
            if !guard.biometric_enabled || authorized {
                return Ok(guard);
            }
            drop(guard);
            self.challenge().await?;
            authorized = true;
        }
    }
}
