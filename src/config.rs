// ABOUTME: Configuration loading and validation for the tally binary.
// ABOUTME: Reads TALLY_* environment variables and refuses to start without a secret key.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("TALLY_SECRET_KEY is not set; refusing to persist state without an encryption key")]
    MissingSecretKey,

    #[error("TALLY_PERSIST_KEY must not be empty")]
    EmptyPersistKey,

    #[error("TALLY_PERSIST_VERSION is not a valid version number: {0}")]
    InvalidVersion(String),
}

/// Runtime configuration loaded from environment variables.
#[derive(Clone)]
pub struct TallyConfig {
    pub home: PathBuf,
    pub secret_key: String,
    pub persist_key: String,
    pub persist_version: u32,
}

impl std::fmt::Debug for TallyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TallyConfig")
            .field("home", &self.home)
            .field("secret_key", &"<redacted>")
            .field("persist_key", &self.persist_key)
            .field("persist_version", &self.persist_version)
            .finish()
    }
}

impl TallyConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - TALLY_HOME: data directory (default: ~/.tally)
    /// - TALLY_SECRET_KEY: passphrase for state encryption (required)
    /// - TALLY_PERSIST_KEY: persist key namespace (default: count)
    /// - TALLY_PERSIST_VERSION: envelope version (default: 1)
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = std::env::var("TALLY_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("/tmp"))
                    .join(".tally")
            });

        let secret_key = std::env::var("TALLY_SECRET_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or(ConfigError::MissingSecretKey)?;

        let persist_key = std::env::var("TALLY_PERSIST_KEY").unwrap_or_else(|_| "count".to_string());
        if persist_key.is_empty() {
            return Err(ConfigError::EmptyPersistKey);
        }

        let persist_version = match std::env::var("TALLY_PERSIST_VERSION") {
            Ok(v) => v
                .trim()
                .parse::<u32>()
                .map_err(|_| ConfigError::InvalidVersion(v))?,
            Err(_) => tally_persist::persistor::DEFAULT_VERSION,
        };

        Ok(Self {
            home,
            secret_key,
            persist_key,
            persist_version,
        })
    }

    /// Directory holding persisted state files.
    pub fn state_dir(&self) -> PathBuf {
        self.home.join("state")
    }
}
