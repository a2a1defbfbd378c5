//! Error types for key lifecycle management
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


use thiserror::Error;

/// Key lifecycle errors
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Secure key generation failed: {0}")]
    Generation(String),

    #[error("Secure storage error: {0}")]
    Storage(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Biometric authentication is not available on this device")]
    BiometricUnavailable,

    #[error("No existing key found")]
    NoKey,

    #[error("Backup integrity check failed for {0}")]
    Integrity(String),

    #[error("Backup not found: {0}")]
    BackupNotFound(String),

    #[error("Invalid key format: {0}")]
    InvalidFormat(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database re-key failed: {0}")]
    Rekey(String),
}

impl KeyError {
    /// True for failures the user caused by declining or failing a prompt
    pub fn is_access_denied(&self) -> bool {
        matches!(self, KeyError::Authentication(_))
    }
}

/// Result type for key operations
pub type KeyResult<T> = Result<T, KeyError>;
