//! Biometric / device-passcode gate
//!
//! [`BiometricAuthenticator`] is the platform capability (fingerprint, face,
//! passcode fallback). [`BiometricGate`] sits on top of it and is what the key
//! manager consults: it ANDs the availability checks together and turns every
//! platform failure into a plain [`AuthOutcome`] instead of an error.
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


use async_trait::async_trait;
use exptrac_config::BiometricConfig;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Error code reported when the platform challenge errors out
pub const AUTHENTICATION_FAILED: &str = "authentication_failed";

/// Error code reported when the configured prompt bound elapses
pub const AUTHENTICATION_TIMEOUT: &str = "authentication_timeout";

/// Biometric modality offered by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BiometricType {
    Fingerprint,
    FacialRecognition,
    Iris,
}

/// Text and fallback behaviour of an authentication prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPrompt {
    pub message: String,
    pub fallback_label: String,
    /// Let the user fall back to the device passcode
    pub allow_device_fallback: bool,
}

impl Default for AuthPrompt {
    fn default() -> Self {
        Self::from(&BiometricConfig::default())
    }
}

impl From<&BiometricConfig> for AuthPrompt {
    fn from(config: &BiometricConfig) -> Self {
        Self {
            message: config.prompt_message.clone(),
            fallback_label: config.fallback_label.clone(),
            allow_device_fallback: config.allow_device_fallback,
        }
    }
}

/// What the platform reported for one challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformAuthResult {
    pub success: bool,
    /// Platform error code, e.g. `user_cancel`, `lockout`
    pub error: Option<String>,
}

impl PlatformAuthResult {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failure(code: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(code.into()),
        }
    }
}

/// Platform biometric capability
#[async_trait]
pub trait BiometricAuthenticator: Send + Sync {
    async fn has_hardware(&self) -> Result<bool, String>;

    async fn is_enrolled(&self) -> Result<bool, String>;

    async fn supported_types(&self) -> Result<Vec<BiometricType>, String>;

    /// Run one interactive challenge. Bounded by the platform's own UI timeout.
    async fn authenticate(&self, prompt: &AuthPrompt) -> Result<PlatformAuthResult, String>;
}

/// Result of a gate challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub success: bool,
    pub error_code: Option<String>,
}

impl AuthOutcome {
    fn failed(code: impl Into<String>) -> Self {
        Self {
            success: false,
            error_code: Some(code.into()),
        }
    }
}

/// Gate consulted before gated key operations
#[derive(Clone)]
pub struct BiometricGate {
    platform: Arc<dyn BiometricAuthenticator>,
    prompt: AuthPrompt,
    timeout: Option<Duration>,
}

impl BiometricGate {
    pub fn new(platform: Arc<dyn BiometricAuthenticator>) -> Self {
        Self {
            platform,
            prompt: AuthPrompt::default(),
            timeout: None,
        }
    }

    pub fn from_config(platform: Arc<dyn BiometricAuthenticator>, config: &BiometricConfig) -> Self {
        Self::new(platform)
            .with_prompt(AuthPrompt::from(config))
            .with_timeout(config.prompt_timeout())
    }

    pub fn with_prompt(mut self, prompt: AuthPrompt) -> Self {
        self.prompt = prompt;
        self
    }

    /// Extra bound on a single challenge, on top of the platform's own
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn prompt(&self) -> &AuthPrompt {
        &self.prompt
    }

    /// Hardware present AND biometrics enrolled AND at least one supported
    /// type. Any platform error counts as unavailable.
    pub async fn is_available(&self) -> bool {
        let checks = async {
            let has_hardware = self.platform.has_hardware().await?;
            let is_enrolled = self.platform.is_enrolled().await?;
            let supported_types = self.platform.supported_types().await?;
            Ok::<_, String>((has_hardware, is_enrolled, supported_types))
        };

        match checks.await {
            Ok((has_hardware, is_enrolled, supported_types)) => {
                debug!(
                    has_hardware,
                    is_enrolled,
                    supported_types = ?supported_types,
                    "Biometric availability"
                );
                has_hardware && is_enrolled && !supported_types.is_empty()
            }
            Err(e) => {
                error!(error = %e, "Error checking biometric availability");
                false
            }
        }
    }

    /// Run a single challenge. Never retries and never returns an error.
    pub async fn authenticate(&self) -> AuthOutcome {
        info!("Requesting biometric authentication");

        let challenge = self.platform.authenticate(&self.prompt);
        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, challenge).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(timeout_secs = limit.as_secs(), "Biometric prompt timed out");
                    return AuthOutcome::failed(AUTHENTICATION_TIMEOUT);
                }
            },
            None => challenge.await,
        };

        match result {
            Ok(result) if result.success => {
                info!("Biometric authentication successful");
                AuthOutcome {
                    success: true,
                    error_code: None,
                }
            }
            Ok(result) => {
                warn!(error = ?result.error, "Biometric authentication failed");
                AuthOutcome {
                    success: false,
                    error_code: result.error,
                }
            }
            Err(e) => {
                error!(error = %e, "Biometric authentication error");
                AuthOutcome::failed(AUTHENTICATION_FAILED)
            }
        }
    }
}

/// Scriptable authenticator for tests and hosts without biometric hardware
pub struct MockBiometrics {
    has_hardware: AtomicBool,
    is_enrolled: AtomicBool,
    supported_types: Vec<BiometricType>,
    auth_succeeds: AtomicBool,
    platform_error: AtomicBool,
    prompt_delay: Option<Duration>,
    attempts: AtomicUsize,
}

impl MockBiometrics {
    /// Fingerprint hardware, enrolled, every challenge succeeds
    pub fn available() -> Self {
        Self {
            has_hardware: AtomicBool::new(true),
            is_enrolled: AtomicBool::new(true),
            supported_types: vec![BiometricType::Fingerprint],
            auth_succeeds: AtomicBool::new(true),
            platform_error: AtomicBool::new(false),
            prompt_delay: None,
            attempts: AtomicUsize::new(0),
        }
    }

    /// No hardware; challenges fail
    pub fn unavailable() -> Self {
        Self {
            has_hardware: AtomicBool::new(false),
            is_enrolled: AtomicBool::new(false),
            supported_types: Vec::new(),
            auth_succeeds: AtomicBool::new(false),
            platform_error: AtomicBool::new(false),
            prompt_delay: None,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn with_supported_types(mut self, types: Vec<BiometricType>) -> Self {
        self.supported_types = types;
        self
    }

    /// Make every challenge take this long before answering
    pub fn with_prompt_delay(mut self, delay: Duration) -> Self {
        self.prompt_delay = Some(delay);
        self
    }

    pub fn set_has_hardware(&self, value: bool) {
        self.has_hardware.store(value, Ordering::SeqCst);
    }

    pub fn set_enrolled(&self, value: bool) {
        self.is_enrolled.store(value, Ordering::SeqCst);
    }

    pub fn set_auth_succeeds(&self, value: bool) {
        self.auth_succeeds.store(value, Ordering::SeqCst);
    }

    /// Make the platform calls error out instead of answering
    pub fn set_platform_error(&self, value: bool) {
        self.platform_error.store(value, Ordering::SeqCst);
    }

    /// Number of challenges presented so far
    pub fn auth_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn check_platform(&self) -> Result<(), String> {
        if self.platform_error.load(Ordering::SeqCst) {
            Err("biometric service unavailable".to_string())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BiometricAuthenticator for MockBiometrics {
    async fn has_hardware(&self) -> Result<bool, String> {
        self.check_platform()?;
        Ok(self.has_hardware.load(Ordering::SeqCst))
    }

    async fn is_enrolled(&self) -> Result<bool, String> {
        self.check_platform()?;
        Ok(self.is_enrolled.load(Ordering::SeqCst))
    }

    async fn supported_types(&self) -> Result<Vec<BiometricType>, String> {
        self.check_platform()?;
        Ok(self.supported_types.clone())
    }

    async fn authenticate(&self, _prompt: &AuthPrompt) -> Result<PlatformAuthResult, String> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.prompt_delay {
            tokio::time::sleep(delay).await;
        }
        self.check_platform()?;
        if self.auth_succeeds.load(Ordering::SeqCst) {
            Ok(PlatformAuthResult::success())
        } else {
            Ok(PlatformAuthResult::failure("user_cancel"))
        }
    }
}
