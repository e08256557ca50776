//! Configuration types for the engine.

use crate::error::{CovalError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Comprehensive engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Read-path defaults.
    #[serde(default)]
    pub read: ReadConfig,

    /// Cache cleanup configuration.
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Inbox processing configuration.
    #[serde(default)]
    pub inbox: InboxConfig,

    /// Registry schema keys routed to the account registries.
    #[serde(default)]
    pub registries: RegistryConfig,
}

impl Config {
    /// Load configuration from `config.toml` in a directory, falling back
    /// to defaults when absent.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join("config.toml");
        if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| CovalError::ConfigError(format!("failed to read config: {}", e)))?;
            toml::from_str(&content)
                .map_err(|e| CovalError::ConfigError(format!("failed to parse config: {}", e)))
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to `config.toml` in a directory.
    pub fn save(&self, root: &Path) -> Result<()> {
        let path = root.join("config.toml");
        let content = toml::to_string_pretty(self)
            .map_err(|e| CovalError::ConfigError(format!("failed to serialize config: {}", e)))?;
        fs::write(&path, content)
            .map_err(|e| CovalError::ConfigError(format!("failed to write config: {}", e)))?;
        Ok(())
    }
}

/// Read-path defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadConfig {
    /// Whether reads deep-resolve references by default.
    pub deep_resolve: bool,

    /// Default reference resolution depth bound.
    pub max_depth: usize,

    /// Default availability budget in milliseconds.
    pub timeout_ms: u64,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            deep_resolve: true,
            max_depth: 15,
            timeout_ms: 5_000,
        }
    }
}

/// Cache cleanup configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Grace period in milliseconds before an unsubscribed store is
    /// evicted. Clamped to (0, 60000].
    pub grace_ms: i64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { grace_ms: 3_000 }
    }
}

/// Inbox processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxConfig {
    /// Budget for loading one message (default: 2000).
    pub message_timeout_ms: u64,

    /// Budget for the processed-flag verification re-read (default: 1000).
    pub verify_timeout_ms: u64,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            message_timeout_ms: 2_000,
            verify_timeout_ms: 1_000,
        }
    }
}

/// Registry schema keys routed to the account registries rather than an
/// index list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Normalized key of the sparks registry schema.
    pub sparks: String,

    /// Normalized key of the humans registry schema.
    pub humans: String,

    /// Co-id of the system spark. Records attributed to it are exempt
    /// from update validation, like `@account` and `@group` records.
    #[serde(default)]
    pub system_spark: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sparks: "sparks".to_string(),
            humans: "humans".to_string(),
            system_spark: None,
        }
    }
}
