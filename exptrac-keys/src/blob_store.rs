//! Secure blob store interface
//!
//! The key manager never talks to a platform keychain directly. Everything it
//! persists goes through [`SecureBlobStore`], which can be implemented by:
//! - the platform keychain / keystore of a mobile host (via FFI)
//! - [`FileBlobStore`](crate::local_store::FileBlobStore) for desktop and dev hosts
//! - [`MemoryBlobStore`] for tests and embedding
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


use crate::error::KeyResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

/// Access requirements attached to a blob when it is written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessPolicy {
    /// Never leaves this device (no cloud keychain sync, no device backups)
    pub device_only: bool,
    /// Platform must authenticate the user before releasing the blob
    pub require_auth: bool,
}

impl AccessPolicy {
    pub fn device_only() -> Self {
        Self {
            device_only: true,
            require_auth: false,
        }
    }

    pub fn with_auth(mut self, require_auth: bool) -> Self {
        self.require_auth = require_auth;
        self
    }
}

/// Trait for secure named-blob storage backends
///
/// No enumeration: most platform keychains cannot list
/// their entries.
#[async_trait]
pub trait SecureBlobStore: Send + Sync {
    /// Write (or overwrite) a blob
    async fn put(&self, name: &str, bytes: &[u8], policy: AccessPolicy) -> KeyResult<()>;

    /// Read a blob, `None` if nothing is stored under `name`
    async fn get(&self, name: &str) -> KeyResult<Option<Zeroizing<Vec<u8>>>>;

    /// Remove a blob; removing a missing blob succeeds
    async fn delete(&self, name: &str) -> KeyResult<()>;
}

/// Stored entry in [`MemoryBlobStore`]
struct MemoryEntry {
    bytes: Zeroizing<Vec<u8>>,
    policy: AccessPolicy,
}

/// In-process blob store
#[derive(Default)]
pub struct MemoryBlobStore {
    entries: RwLock<HashMap<String, MemoryEntry>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy a blob was last written with
    pub async fn policy(&self, name: &str) -> Option<AccessPolicy> {
        self.entries.read().await.get(name).map(|e| e.policy)
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.entries.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SecureBlobStore for MemoryBlobStore {
    async fn put(&self, name: &str, bytes: &[u8], policy: AccessPolicy) -> KeyResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(
            name.to_string(),
            MemoryEntry {
                bytes: Zeroizing::new(bytes.to_vec()),
                policy,
            },
        );
        Ok(())
    }

    async fn get(&self, name: &str) -> KeyResult<Option<Zeroizing<Vec<u8>>>> {
        let entries = self.entries.read().await;
        Ok(entries.get(name).map(|e| e.bytes.clone()))
    }

    async fn delete(&self, name: &str) -> KeyResult<()> {
        self.entries.write().await.remove(name);
        Ok(())
    }
}
