//! Random key material generation
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
use crate::key_types::{KeyMaterial, KEY_SIZE_BYTES};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;
use tracing::{debug, error};
use zeroize::Zeroize;

/// Source of cryptographically secure random bytes
pub trait EntropySource: Send + Sync {
    /// Fill `dest` completely or fail; never substitute weaker randomness
    fn try_fill(&self, dest: &mut [u8]) -> Result<(), String>;
}

/// Operating system CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn try_fill(&self, dest: &mut [u8]) -> Result<(), String> {
        OsRng.try_fill_bytes(dest).map_err(|e| e.to_string())
    }
}

/// Produces fresh 256-bit database keys
#[derive(Clone)]
pub struct KeyMaterialGenerator {
    entropy: Arc<dyn EntropySource>,
}

impl Default for KeyMaterialGenerator {
    fn default() -> Self {
        Self::new(Arc::new(OsEntropy))
    }
}

impl KeyMaterialGenerator {
    pub fn new(entropy: Arc<dyn EntropySource>) -> Self {
        Self { entropy }
    }

    /// Generate a new key, failing with [`KeyError::Generation`] when the
    /// entropy source is unavailable
    pub fn generate(&self) -> KeyResult<KeyMaterial> {
        debug!("Generating new secure key");

        let mut bytes = [0u8; KEY_SIZE_BYTES];
        if let Err(e) = self.entropy.try_fill(&mut bytes) {
            bytes.zeroize();
            error!(error = %e, "Entropy source unavailable");
            return Err(KeyError::Generation(e));
        }

        let key = KeyMaterial::from_bytes(bytes);
        bytes.zeroize();
        Ok(key)
    }
}
