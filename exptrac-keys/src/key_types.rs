//! Key material, metadata and backup record types
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


use crate::error::{KeyError, KeyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of the database key in bytes
pub const KEY_SIZE_BYTES: usize = 32;

/// Length of the database key in bits, as recorded in metadata
pub const KEY_SIZE_BITS: u32 = 256;

/// Algorithm label recorded in metadata
pub const KEY_ALGORITHM: &str = "AES-256";

/// Identifier of a backup snapshot: `<version>_<creationEpochMillis>`
pub type BackupId = String;

/// Logical slot names in the secure blob store
pub mod slots {
    pub const PRIMARY_KEY: &str = "EXPTRAC_DB_ENCRYPTION_KEY";
    pub const KEY_VERSION: &str = "EXPTRAC_DB_KEY_VERSION";
    pub const KEY_METADATA: &str = "EXPTRAC_KEY_METADATA";
    pub const BIOMETRIC_PREFERENCE: &str = "EXPTRAC_USE_BIOMETRIC";
    pub const BACKUP_INDEX: &str = "EXPTRAC_KEY_BACKUP_INDEX";
    pub const BACKUP_PREFIX: &str = "EXPTRAC_KEY_BACKUP_";

    /// Slot holding a single backup snapshot
    pub fn backup(id: &str) -> String {
        format!("{}{}", BACKUP_PREFIX, id)
    }
}

/// The 256-bit database key.
///
/// Lives in a fixed-size buffer that is overwritten when dropped. There is no
/// `Clone`; a second copy must be asked for with [`KeyMaterial::duplicate`].
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_SIZE_BYTES]);

impl KeyMaterial {
    /// Take ownership of raw key bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE_BYTES]) -> Self {
        Self(bytes)
    }

    /// Copy key bytes out of a slice of exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> KeyResult<Self> {
        if bytes.len() != KEY_SIZE_BYTES {
            return Err(KeyError::InvalidFormat(format!(
                "Invalid key length: {} (expected {})",
                bytes.len(),
                KEY_SIZE_BYTES
            )));
        }
        let mut key = [0u8; KEY_SIZE_BYTES];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Decode a 64-character hex string
    pub fn from_hex(encoded: &str) -> KeyResult<Self> {
        let decoded = Zeroizing::new(
            hex::decode(encoded.trim())
                .map_err(|e| KeyError::InvalidFormat(format!("Invalid key hex: {}", e)))?,
        );
        Self::from_slice(&decoded)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_BYTES] {
        &self.0
    }

    /// Hex form, e.g. for a SQLCipher `PRAGMA key`
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.0))
    }

    /// Explicit second copy of the key
    pub fn duplicate(&self) -> Self {
        Self(self.0)
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        // No early exit on the first differing byte
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl Eq for KeyMaterial {}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial([REDACTED])")
    }
}

/// Metadata describing the key in the primary slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyMetadata {
    /// Version of the key currently stored in the primary slot
    pub version: u32,
    /// When the first key was stored; never changes afterwards
    pub created_at: DateTime<Utc>,
    /// When the key was last rotated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rotated: Option<DateTime<Utc>>,
    pub algorithm: String,
    pub key_size: u32,
    /// Set once a backup has been created; rotations then snapshot the old key
    pub backup_enabled: bool,
}

impl KeyMetadata {
    pub fn new(version: u32, now: DateTime<Utc>) -> Self {
        Self {
            version,
            created_at: now,
            last_rotated: None,
            algorithm: KEY_ALGORITHM.to_string(),
            key_size: KEY_SIZE_BITS,
            backup_enabled: false,
        }
    }

    /// Metadata for the next write of the primary slot.
    ///
    /// `created_at` and `backup_enabled` are carried over from `previous`;
    /// `last_rotated` is only stamped for rotations.
    pub fn successor(
        previous: Option<&KeyMetadata>,
        version: u32,
        now: DateTime<Utc>,
        is_rotation: bool,
    ) -> Self {
        let mut next = Self::new(version, now);
        if let Some(previous) = previous {
            next.created_at = previous.created_at;
            next.last_rotated = previous.last_rotated;
            next.backup_enabled = previous.backup_enabled;
        }
        if is_rotation {
            next.last_rotated = Some(now);
        }
        next
    }
}

/// Persisted backup snapshot of a key and its metadata
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyBackup {
    /// Hex-encoded key bytes
    pub key: String,
    pub metadata: KeyMetadata,
    pub timestamp: DateTime<Utc>,
    pub checksum: String,
}

impl fmt::Debug for KeyBackup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyBackup")
            .field("key", &"[REDACTED]")
            .field("metadata", &self.metadata)
            .field("timestamp", &self.timestamp)
            .field("checksum", &self.checksum)
            .finish()
    }
}

impl Drop for KeyBackup {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Listing entry for a backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSummary {
    pub id: BackupId,
    pub timestamp: DateTime<Utc>,
    pub version: u32,
}

/// Milestones reported while a rotation runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationStage {
    Started,
    GeneratingKey,
    BackingUpOldKey,
    StoringNewKey,
    CleaningUp,
    Completed,
}

impl RotationStage {
    pub fn percent(&self) -> u8 {
        match self {
            RotationStage::Started => 0,
            RotationStage::GeneratingKey => 20,
            RotationStage::BackingUpOldKey => 40,
            RotationStage::StoringNewKey => 60,
            RotationStage::CleaningUp => 80,
            RotationStage::Completed => 100,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            RotationStage::Started => "Starting key rotation...",
            RotationStage::GeneratingKey => "Generating new key...",
            RotationStage::BackingUpOldKey => "Creating backup of old key...",
            RotationStage::StoringNewKey => "Storing new key...",
            RotationStage::CleaningUp => "Cleaning up old key...",
            RotationStage::Completed => "Key rotation completed",
        }
    }
}
