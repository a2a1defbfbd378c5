//! File-backed secure blob store
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


use crate::blob_store::{AccessPolicy, SecureBlobStore};
use crate::error::{KeyError, KeyResult};
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Environment variable holding the master key
pub const MASTER_KEY_ENV: &str = "EXPTRAC_MASTER_KEY";

const NONCE_LEN: usize = 12;

/// Master key sealing every blob on disk
pub type MasterKey = Zeroizing<[u8; 32]>;

/// On-disk envelope of a blob
#[derive(Serialize, Deserialize)]
struct SealedBlob {
    policy: AccessPolicy,
    /// hex(nonce || ciphertext)
    sealed: String,
}

/// Blob store that keeps one AES-256-GCM sealed file per slot
pub struct FileBlobStore {
    /// Storage directory
    storage_path: PathBuf,
    master_key: MasterKey,
}

impl FileBlobStore {
    /// Create a file blob store
    ///
    /// # Arguments
    /// * `storage_path` - Directory where sealed blobs will be stored
    /// * `master_key` - Optional 32-byte master key (if None, read from `EXPTRAC_MASTER_KEY`)
    pub async fn new<P: AsRef<Path>>(
        storage_path: P,
        master_key: Option<&[u8]>,
    ) -> KeyResult<Self> {
        let storage_path = storage_path.as_ref().to_path_buf();

        fs::create_dir_all(&storage_path).await?;

        let master_key = match master_key {
            Some(key) => {
                if key.len() != 32 {
                    return Err(KeyError::Configuration(
                        "Master key must be exactly 32 bytes".to_string(),
                    ));
                }
                let mut mk = Zeroizing::new([0u8; 32]);
                mk.copy_from_slice(key);
                mk
            }
            None => {
                let value = std::env::var(MASTER_KEY_ENV).map_err(|_| {
                    KeyError::Configuration(format!("{} is not set", MASTER_KEY_ENV))
                })?;
                Self::master_key_from_str(&value)
            }
        };

        info!(path = %storage_path.display(), "Opened file blob store");

        Ok(Self {
            storage_path,
            master_key,
        })
    }

    /// Parse a configured master key: 64 hex chars are taken as raw bytes,
    /// anything else is hashed with SHA-256
    pub fn master_key_from_str(value: &str) -> MasterKey {
        let mut mk = Zeroizing::new([0u8; 32]);
        if let Ok(bytes) = hex::decode(value.trim()) {
            let bytes = Zeroizing::new(bytes);
            if bytes.len() == 32 {
                mk.copy_from_slice(&bytes);
                return mk;
            }
        }
        let hash = Sha256::digest(value.as_bytes());
        mk.copy_from_slice(&hash);
        mk
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    fn cipher(&self) -> KeyResult<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.master_key[..])
            .map_err(|e| KeyError::Configuration(format!("Invalid master key: {}", e)))
    }

    /// Encrypt blob bytes
    fn seal(&self, plaintext: &[u8]) -> KeyResult<Vec<u8>> {
        let cipher = self.cipher()?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| KeyError::Encryption(format!("Encryption failed: {}", e)))?;

        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt blob bytes
    fn unseal(&self, sealed: &[u8]) -> KeyResult<Zeroizing<Vec<u8>>> {
        if sealed.len() < NONCE_LEN {
            return Err(KeyError::Decryption("Sealed data too short".to_string()));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let cipher = self.cipher()?;

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| KeyError::Decryption(format!("Decryption failed: {}", e)))?;

        Ok(Zeroizing::new(plaintext))
    }

    /// Get path for a slot's file
    fn blob_path(&self, name: &str) -> PathBuf {
        // Sanitize slot name for filesystem
        let sanitized: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.storage_path.join(format!("{}.blob", sanitized))
    }

    async fn read_envelope(&self, name: &str) -> KeyResult<Option<SealedBlob>> {
        let path = self.blob_path(name);
        match fs::read(&path).await {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(KeyError::Storage(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Policy a blob was written with, if it exists
    pub async fn policy(&self, name: &str) -> KeyResult<Option<AccessPolicy>> {
        Ok(self.read_envelope(name).await?.map(|envelope| envelope.policy))
    }
}

#[async_trait]
impl SecureBlobStore for FileBlobStore {
    async fn put(&self, name: &str, bytes: &[u8], policy: AccessPolicy) -> KeyResult<()> {
        if policy.require_auth {
            debug!(slot = name, "Auth requirement recorded; a plain filesystem cannot enforce it");
        }

        let envelope = SealedBlob {
            policy,
            sealed: hex::encode(self.seal(bytes)?),
        };
        let json = serde_json::to_vec(&envelope)?;

        // Write to a sibling temp file and rename so a crash never leaves a torn blob
        let path = self.blob_path(name);
        let tmp_path = path.with_extension("blob.tmp");
        fs::write(&tmp_path, json)
            .await
            .map_err(|e| KeyError::Storage(format!("Failed to write {}: {}", tmp_path.display(), e)))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| KeyError::Storage(format!("Failed to commit {}: {}", path.display(), e)))?;

        debug!(slot = name, "Blob stored");
        Ok(())
    }

    async fn get(&self, name: &str) -> KeyResult<Option<Zeroizing<Vec<u8>>>> {
        let envelope = match self.read_envelope(name).await? {
            Some(envelope) => envelope,
            None => return Ok(None),
        };

        let sealed = hex::decode(&envelope.sealed)
            .map_err(|e| KeyError::Decryption(format!("Corrupt blob {}: {}", name, e)))?;
        Ok(Some(self.unseal(&sealed)?))
    }

    async fn delete(&self, name: &str) -> KeyResult<()> {
        let path = self.blob_path(name);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(slot = name, "Blob deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeyError::Storage(format!(
                "Failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }
}
