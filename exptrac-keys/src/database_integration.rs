//! Helpers for the encrypted database layer that consumes the key manager
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


use crate::biometric::{BiometricAuthenticator, BiometricGate};
use crate::error::{KeyError, KeyResult};
use crate::key_types::KeyMaterial;
use crate::local_store::FileBlobStore;
use crate::manager::{KeyLifecycleManager, ProgressObserver};
use async_trait::async_trait;
use exptrac_config::KeyVaultConfig;
use std::sync::Arc;
use tracing::{error, info};
use zeroize::Zeroizing;

/// Re-encrypts the database under a new key (e.g. SQLCipher `PRAGMA rekey`)
#[async_trait]
pub trait Rekeyer: Send + Sync {
    async fn rekey(&self, new_key: &KeyMaterial) -> Result<(), String>;
}

/// Initialize a key manager backed by the file blob store described in `config`
pub async fn init_key_manager(
    config: &KeyVaultConfig,
    authenticator: Arc<dyn BiometricAuthenticator>,
) -> KeyResult<Arc<KeyLifecycleManager>> {
    info!(path = %config.storage_path(), "Initializing key manager");

    let store = match &config.storage.master_key {
        Some(value) => {
            let master_key = FileBlobStore::master_key_from_str(value);
            FileBlobStore::new(config.storage_path(), Some(&master_key[..])).await?
        }
        None => FileBlobStore::new(config.storage_path(), None).await?,
    };

    let gate = BiometricGate::from_config(authenticator, &config.biometric);
    let manager = KeyLifecycleManager::builder(Arc::new(store), gate)
        .open()
        .await?;
    Ok(Arc::new(manager))
}

/// Key to open the database with, generating and storing one on first run
pub async fn open_or_create_key(manager: &KeyLifecycleManager) -> KeyResult<KeyMaterial> {
    if let Some(key) = manager.get_key().await? {
        return Ok(key);
    }

    info!("No existing key found, generating new one");
    let key = manager.generate_key()?;
    manager.store_key(&key, false).await?;
    Ok(key)
}

/// Rotate the key and re-encrypt the database with it; returns the new version.
///
/// If re-keying fails the new key is already the stored key. The error carries
/// that version so the caller can retry the rekey or restore a backup.
pub async fn rotate_and_rekey(
    manager: &KeyLifecycleManager,
    rekeyer: &dyn Rekeyer,
    on_progress: Option<ProgressObserver<'_>>,
) -> KeyResult<u32> {
    let rotation = manager.rotate_committed(on_progress).await?;
    let version = rotation.metadata.version;
    let new_key = rotation.key;

    if let Err(e) = rekeyer.rekey(&new_key).await {
        error!(version, error = %e, "Database re-key failed after rotation");
        return Err(KeyError::Rekey(format!("version {}: {}", version, e)));
    }

    info!(version, "Database re-keyed");
    Ok(version)
}

/// SQLCipher statement opening a database with a raw 256-bit key
pub fn sqlcipher_key_pragma(key: &KeyMaterial) -> Zeroizing<String> {
    Zeroizing::new(format!("PRAGMA key = \"x'{}'\";", key.to_hex().as_str()))
}

/// SQLCipher statement re-encrypting an open database under a new raw key
pub fn sqlcipher_rekey_pragma(key: &KeyMaterial) -> Zeroizing<String> {
    Zeroizing::new(format!("PRAGMA rekey = \"x'{}'\";", key.to_hex().as_str()))
}
