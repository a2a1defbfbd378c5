//! Key backup snapshots
//!
//! Each backup is an independent blob holding the key, a frozen copy of the
//! metadata at the time, and a checksum over the key bytes. The checksum is a
//! 32-bit rolling hash: it catches torn writes and bit rot, it does not catch
//! someone who can rewrite both the key and the checksum.
//!
//! Backup ids are also appended to an index slot so they can be listed and
//! bulk-deleted; the underlying store cannot enumerate its entries.
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
use crate::clock::Clock;
use crate::error::{KeyError, KeyResult};
use crate::key_types::{slots, BackupId, BackupSummary, KeyBackup, KeyMaterial, KeyMetadata};
use crate::metadata_store::KeyMetadataStore;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Rolling `h * 31 + b` hash over the key bytes, as 8 lower-case hex digits
pub fn checksum(bytes: &[u8]) -> String {
    let hash = bytes.iter().fold(0u32, |hash, &b| {
        (hash << 5).wrapping_sub(hash).wrapping_add(u32::from(b))
    });
    format!("{:08x}", hash)
}

/// A verified backup, ready to become the current key
#[derive(Debug)]
pub struct RestoredBackup {
    pub key: KeyMaterial,
    pub metadata: KeyMetadata,
}

/// Creates, verifies, lists and deletes backup snapshots
#[derive(Clone)]
pub struct BackupVault {
    store: Arc<dyn SecureBlobStore>,
    metadata_store: KeyMetadataStore,
    clock: Arc<dyn Clock>,
}

impl BackupVault {
    pub fn new(store: Arc<dyn SecureBlobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            metadata_store: KeyMetadataStore::new(store.clone()),
            store,
            clock,
        }
    }

    /// Snapshot `key` together with `live` metadata.
    ///
    /// Returns the backup id and the live metadata with `backup_enabled` set,
    /// which has already been persisted.
    pub async fn create_backup(
        &self,
        key: &KeyMaterial,
        live: &KeyMetadata,
    ) -> KeyResult<(BackupId, KeyMetadata)> {
        let now = self.clock.now();
        let id = self.unused_id(live.version, now.timestamp_millis()).await?;

        let backup = KeyBackup {
            key: key.to_hex().to_string(),
            metadata: live.clone(),
            timestamp: now,
            checksum: checksum(key.as_bytes()),
        };
        let json = Zeroizing::new(serde_json::to_vec(&backup)?);

        self.store
            .put(&slots::backup(&id), &json, AccessPolicy::device_only())
            .await?;
        self.append_to_index(&id).await?;

        let mut updated = live.clone();
        updated.backup_enabled = true;
        self.metadata_store.store(&updated).await?;

        info!(backup_id = %id, version = live.version, "Key backup created");
        Ok((id, updated))
    }

    /// Load a backup and verify its checksum
    pub async fn restore_backup(&self, id: &str) -> KeyResult<RestoredBackup> {
        let bytes = self
            .store
            .get(&slots::backup(id))
            .await?
            .ok_or_else(|| KeyError::BackupNotFound(id.to_string()))?;

        let backup: KeyBackup = serde_json::from_slice(&bytes)?;

        let key = KeyMaterial::from_hex(&backup.key).map_err(|e| {
            warn!(backup_id = id, error = %e, "Backup key bytes are unreadable");
            KeyError::Integrity(id.to_string())
        })?;

        if checksum(key.as_bytes()) != backup.checksum {
            warn!(backup_id = id, "Backup checksum mismatch");
            return Err(KeyError::Integrity(id.to_string()));
        }

        debug!(backup_id = id, version = backup.metadata.version, "Backup verified");
        Ok(RestoredBackup {
            key,
            metadata: backup.metadata.clone(),
        })
    }

    /// Best-effort listing from the backup index, oldest first.
    ///
    /// An empty result does not prove that no backups exist: backups written
    /// before the index existed cannot be found.
    pub async fn list_backups(&self) -> Vec<BackupSummary> {
        let ids = match self.load_index().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Backup index unreadable, listing nothing");
                return Vec::new();
            }
        };

        let mut summaries = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load_summary(&id).await {
                Ok(Some(summary)) => summaries.push(summary),
                Ok(None) => debug!(backup_id = %id, "Indexed backup no longer present"),
                Err(e) => warn!(backup_id = %id, error = %e, "Skipping unreadable backup"),
            }
        }
        summaries.sort_by_key(|s| s.timestamp);
        summaries
    }

    /// Delete every indexed backup and the index itself; returns how many
    /// backup slots were removed
    pub async fn delete_all(&self) -> KeyResult<usize> {
        let ids = match self.load_index().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Backup index unreadable, only removing the index");
                Vec::new()
            }
        };

        for id in &ids {
            self.store.delete(&slots::backup(id)).await?;
        }
        self.store.delete(slots::BACKUP_INDEX).await?;

        info!(count = ids.len(), "Key backups deleted");
        Ok(ids.len())
    }

    async fn load_summary(&self, id: &str) -> KeyResult<Option<BackupSummary>> {
        let bytes = match self.store.get(&slots::backup(id)).await? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let backup: KeyBackup = serde_json::from_slice(&bytes)?;
        Ok(Some(BackupSummary {
            id: id.to_string(),
            timestamp: backup.timestamp,
            version: backup.metadata.version,
        }))
    }

    async fn load_index(&self) -> KeyResult<Vec<BackupId>> {
        match self.store.get(slots::BACKUP_INDEX).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    async fn append_to_index(&self, id: &str) -> KeyResult<()> {
        // A corrupt index is rebuilt from this entry rather than blocking backups
        let mut ids = self.load_index().await.unwrap_or_else(|e| {
            warn!(error = %e, "Backup index unreadable, starting a new one");
            Vec::new()
        });
        ids.push(id.to_string());
        let json = serde_json::to_vec(&ids)?;
        self.store
            .put(slots::BACKUP_INDEX, &json, AccessPolicy::device_only())
            .await
    }

    /// `<version>_<millis>`, bumping the millis until the slot is free
    async fn unused_id(&self, version: u32, mut millis: i64) -> KeyResult<BackupId> {
        loop {
            let id = format!("{}_{}", version, millis);
            if self.store.get(&slots::backup(&id)).await?.is_none() {
                return Ok(id);
            }
            millis += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_stable() {
        assert_eq!(checksum(&[]), "00000000");
        assert_eq!(checksum(&[1]), "00000001");
        // 1 * 31 + 2
        assert_eq!(checksum(&[1, 2]), "00000021");
        assert_ne!(checksum(&[1, 2]), checksum(&[2, 1]));
    }

    #[test]
    fn test_checksum_detects_single_byte_change() {
        let mut bytes = [0x5au8; 32];
        let original = checksum(&bytes);
        bytes[17] ^= 0x01;
        assert_ne!(checksum(&bytes), original);
    }
}
