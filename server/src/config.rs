//! Configuration management for the server.

use std::env;
use std::path::PathBuf;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Directory holding one `<project>.json` document per project
    pub storage_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            storage_path: PathBuf::from("./data"),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = lookup("HOST").unwrap_or(defaults.host);

        let port = match lookup("PORT") {
            Some(port) => port
                .parse()
                .map_err(|_| ConfigError::InvalidPort(port))?,
            None => defaults.port,
        };

        let storage_path = match lookup("STORAGE_PATH") {
            Some(path) if path.is_empty() => return Err(ConfigError::EmptyStoragePath),
            Some(path) => PathBuf::from(path),
            None => defaults.storage_path,
        };

        Ok(Self {
            host,
            port,
            storage_path,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value: {0}")]
    InvalidPort(String),

    #[error("STORAGE_PATH must not be empty")]
    EmptyStoragePath,
}
