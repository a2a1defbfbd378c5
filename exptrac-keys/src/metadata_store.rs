//! Persistence of key metadata and the version record
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
use crate::key_types::{slots, KeyMetadata};
use std::sync::Arc;
use tracing::debug;

/// Reads and writes the metadata and version slots.
///
/// Callers write metadata only after the key bytes it describes have been
/// persisted.
#[derive(Clone)]
pub struct KeyMetadataStore {
    store: Arc<dyn SecureBlobStore>,
}

impl KeyMetadataStore {
    pub fn new(store: Arc<dyn SecureBlobStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self) -> KeyResult<Option<KeyMetadata>> {
        match self.store.get(slots::KEY_METADATA).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Last write wins
    pub async fn store(&self, metadata: &KeyMetadata) -> KeyResult<()> {
        let json = serde_json::to_vec(metadata)?;
        self.store
            .put(slots::KEY_METADATA, &json, AccessPolicy::device_only())
            .await?;
        debug!(version = metadata.version, "Key metadata stored");
        Ok(())
    }

    pub async fn load_version(&self) -> KeyResult<Option<u32>> {
        let bytes = match self.store.get(slots::KEY_VERSION).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let text = std::str::from_utf8(&bytes)
            .map_err(|e| KeyError::InvalidFormat(format!("Version record is not UTF-8: {}", e)))?;
        let version = text
            .trim()
            .parse::<u32>()
            .map_err(|e| KeyError::InvalidFormat(format!("Invalid version record '{}': {}", text, e)))?;
        Ok(Some(version))
    }

    pub async fn store_version(&self, version: u32) -> KeyResult<()> {
        self.store
            .put(
                slots::KEY_VERSION,
                version.to_string().as_bytes(),
                AccessPolicy::device_only(),
            )
            .await
    }

    /// Remove both the metadata and version records
    pub async fn clear(&self) -> KeyResult<()> {
        self.store.delete(slots::KEY_VERSION).await?;
        self.store.delete(slots::KEY_METADATA).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::MemoryBlobStore;
    use chrono::Utc;

    #[tokio::test]
    async fn test_metadata_round_trip() {
        let store = KeyMetadataStore::new(Arc::new(MemoryBlobStore::new()));
        assert!(store.load().await.unwrap().is_none());

        let metadata = KeyMetadata::new(4, Utc::now());
        store.store(&metadata).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(metadata));
    }

    #[tokio::test]
    async fn test_version_record() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let store = KeyMetadataStore::new(blobs.clone());
        assert_eq!(store.load_version().await.unwrap(), None);

        store.store_version(7).await.unwrap();
        assert_eq!(store.load_version().await.unwrap(), Some(7));

        blobs
            .put(slots::KEY_VERSION, b"seven", AccessPolicy::device_only())
            .await
            .unwrap();
        assert!(matches!(
            store.load_version().await,
            Err(KeyError::InvalidFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_metadata_is_an_error() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs
            .put(slots::KEY_METADATA, b"{not json", AccessPolicy::device_only())
            .await
            .unwrap();
        let store = KeyMetadataStore::new(blobs);
        assert!(matches!(store.load().await, Err(KeyError::Serialization(_))));
    }
}
