//! Configuration management for the Exptrac key services

use serde::Deserialize;
use std::env;
use std::time::Duration;

/// Where and how sealed key blobs are stored
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub path: String,
    /// Hex or passphrase form of the file store master key
    pub master_key: Option<String>,
}

/// Biometric prompt presented before gated key access
#[derive(Debug, Clone, Deserialize)]
pub struct BiometricConfig {
    pub prompt_message: String,
    pub fallback_label: String,
    pub allow_device_fallback: bool,
    /// Upper bound on a single prompt, on top of the platform's own timeout
    pub prompt_timeout_secs: Option<u64>,
}

impl Default for BiometricConfig {
    fn default() -> Self {
        Self {
            prompt_message: "Authenticate to access your encrypted expenses".to_string(),
            fallback_label: "Use device passcode".to_string(),
            allow_device_fallback: true,
            prompt_timeout_secs: None,
        }
    }
}

impl BiometricConfig {
    pub fn prompt_timeout(&self) -> Option<Duration> {
        self.prompt_timeout_secs.map(Duration::from_secs)
    }
}

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KeyVaultConfig {
    pub storage: StorageConfig,
    pub biometric: BiometricConfig,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
}

impl KeyVaultConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        let path = env::var("KEY_STORAGE_PATH").unwrap_or_else(|_| "./keys".to_string());
        let master_key = env::var("EXPTRAC_MASTER_KEY").ok();

        let defaults = BiometricConfig::default();
        let biometric = BiometricConfig {
            prompt_message: env::var("BIOMETRIC_PROMPT_MESSAGE")
                .unwrap_or(defaults.prompt_message),
            fallback_label: env::var("BIOMETRIC_FALLBACK_LABEL")
                .unwrap_or(defaults.fallback_label),
            allow_device_fallback: match env::var("BIOMETRIC_ALLOW_DEVICE_FALLBACK") {
                Ok(value) => parse_bool("BIOMETRIC_ALLOW_DEVICE_FALLBACK", &value)?,
                Err(_) => defaults.allow_device_fallback,
            },
            prompt_timeout_secs: match env::var("BIOMETRIC_PROMPT_TIMEOUT_SECS") {
                Ok(value) => Some(value.trim().parse::<u64>().map_err(|e| {
                    config::ConfigError::Message(format!(
                        "BIOMETRIC_PROMPT_TIMEOUT_SECS must be a whole number of seconds: {}",
                        e
                    ))
                })?),
                Err(_) => None,
            },
        };

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_format = env::var("LOG_FORMAT").ok();

        Ok(Self {
            storage: StorageConfig { path, master_key },
            biometric,
            log_level: Some(log_level),
            log_format,
        })
    }

    /// Get key storage directory
    pub fn storage_path(&self) -> &str {
        &self.storage.path
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    /// Get log format name, defaulting to "console"
    pub fn log_format(&self) -> &str {
        self.log_format.as_deref().unwrap_or("console")
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, config::ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(config::ConfigError::Message(format!(
            "{} must be a boolean, got '{}'",
            name, other
        ))),
    }
}
