//! Configuration file parser for ~/.config/letterbox/config.toml.
//!
//! The file is optional: a missing or empty file yields `Config::default()`.
//! Unknown keys are accepted but logged, since they are usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::engine::{EngineConfig, DEFAULT_MAX_BULK_IDS, DEFAULT_REORDER_DEBOUNCE};

/// Environment variable that overrides `user_id`
pub const USER_ID_ENV: &str = "LETTERBOX_USER_ID";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid LETTERBOX_USER_ID value: {0:?}")]
    InvalidUserId(String),
}

// ============================================================================
// Configuration
// ============================================================================

/// Top-level configuration. Every key is optional.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite file; defaults to `letterbox.db` next to the config file.
    pub database_path: Option<PathBuf>,

    /// User to sign in as.
    pub user_id: i64,

    /// Debounce before a queue reorder is submitted, in milliseconds.
    pub reorder_debounce_ms: u64,

    /// Refetch stale queries after every mutation.
    pub refetch_after_mutation: bool,

    /// Upper bound on ids accepted by one bulk action.
    pub max_bulk_ids: usize,

    /// Column width for titles in `list` output.
    pub title_width: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            user_id: 1,
            reorder_debounce_ms: DEFAULT_REORDER_DEBOUNCE.as_millis() as u64,
            refetch_after_mutation: true,
            max_bulk_ids: DEFAULT_MAX_BULK_IDS,
            title_width: 60,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 6] = [
        "database_path",
        "user_id",
        "reorder_debounce_ms",
        "refetch_after_mutation",
        "max_bulk_ids",
        "title_width",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing or empty file → `Ok(Config::default())`
    /// - Larger than 1 MB → `Err(ConfigError::TooLarge)`
    /// - Invalid TOML → `Err(ConfigError::Parse)`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Self::parse(&content)
    }

    /// Parse TOML text, warning about keys this version does not know.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        tracing::info!(
            user_id = config.user_id,
            reorder_debounce_ms = config.reorder_debounce_ms,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Apply a `LETTERBOX_USER_ID` value, if one is set.
    pub fn with_user_override(mut self, value: Option<&str>) -> Result<Self, ConfigError> {
        if let Some(raw) = value {
            self.user_id = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidUserId(raw.to_string()))?;
        }
        Ok(self)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            reorder_debounce: Duration::from_millis(self.reorder_debounce_ms),
            refetch_after_mutation: self.refetch_after_mutation,
            max_bulk_ids: self.max_bulk_ids,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
