//! Encryption key lifecycle management for the Exptrac encrypted database
//!
//! Generates, stores, rotates, backs up, restores and destroys the 256-bit key
//! the local database is encrypted with. Access can be gated behind a
//! biometric or device-passcode challenge.
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


pub mod backup;
pub mod biometric;
pub mod blob_store;
pub mod clock;
pub mod database_integration;
pub mod error;
pub mod generator;
pub mod key_types;
pub mod local_store;
pub mod manager;
pub mod metadata_store;

pub use backup::{checksum, BackupVault, RestoredBackup};
pub use biometric::{
    AuthOutcome, AuthPrompt, BiometricAuthenticator, BiometricGate, BiometricType, MockBiometrics,
    PlatformAuthResult,
};
pub use blob_store::{AccessPolicy, MemoryBlobStore, SecureBlobStore};
pub use clock::{Clock, SystemClock};
pub use database_integration::*;
pub use error::{KeyError, KeyResult};
pub use generator::{EntropySource, KeyMaterialGenerator, OsEntropy};
pub use key_types::{
    slots, BackupId, BackupSummary, KeyBackup, KeyMaterial, KeyMetadata, RotationStage,
};
pub use local_store::FileBlobStore;
pub use manager::{KeyLifecycleManager, KeyLifecycleManagerBuilder, ProgressObserver, Rotation};
pub use metadata_store::KeyMetadataStore;
