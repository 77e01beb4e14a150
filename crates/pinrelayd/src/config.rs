//! Daemon configuration.
//!
//! The TOML file is optional and every field in it is optional; missing
//! fields keep their defaults. `PINRELAY_LISTEN` overrides `listen`.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::dispatch::{DispatchConfig, DEFAULT_POLL_TIMEOUT};
use crate::registry::{RegistryConfig, CLEANUP_INTERVAL, STALE_THRESHOLD};

/// Default listen address for node and control connections.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:7465";

/// Environment variable overriding the listen address.
pub const LISTEN_ENV: &str = "PINRELAY_LISTEN";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config file {path}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid listen address {value:?}: {error}")]
    InvalidListen { value: String, error: String },

    #[error("Invalid {field}: must be greater than zero")]
    ZeroDuration { field: &'static str },
}

/// On-disk schema.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DaemonConfigFile {
    listen: Option<String>,
    #[serde(default)]
    authorized_chats: Vec<i64>,
    poll_timeout_ms: Option<u64>,
    stale_threshold_secs: Option<u64>,
    /// Zero disables the background sweep.
    cleanup_interval_secs: Option<u64>,
}

/// Resolved daemon settings.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub listen: SocketAddr,
    /// Chats allowed to send text commands; empty allows all.
    pub authorized_chats: Vec<i64>,
    pub dispatch: DispatchConfig,
    pub registry: RegistryConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 7465)),
            authorized_chats: Vec::new(),
            dispatch: DispatchConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Loads the file at `path` if given, then applies the environment override.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                })?;
                Self::parse_file(&text, path)?
            }
            None => DaemonConfigFile::default(),
        };

        let env_listen = std::env::var(LISTEN_ENV).ok();
        Self::resolve(file, env_listen)
    }

    /// Parses TOML text without consulting the environment.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Self::resolve(Self::parse_file(text, Path::new("<inline>"))?, None)
    }

    fn parse_file(text: &str, path: &Path) -> Result<DaemonConfigFile, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    fn resolve(file: DaemonConfigFile, env_listen: Option<String>) -> Result<Self, ConfigError> {
        let listen = env_listen
            .or(file.listen)
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen = listen
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidListen {
                value: listen.clone(),
                error: e.to_string(),
            })?;

        let poll_timeout = match file.poll_timeout_ms {
            Some(0) => return Err(ConfigError::ZeroDuration { field: "poll_timeout_ms" }),
            Some(ms) => Duration::from_millis(ms),
            None => DEFAULT_POLL_TIMEOUT,
        };
        let stale_threshold = match file.stale_threshold_secs {
            Some(0) => {
                return Err(ConfigError::ZeroDuration {
                    field: "stale_threshold_secs",
                })
            }
            Some(secs) => Duration::from_secs(secs),
            None => STALE_THRESHOLD,
        };
        let cleanup_interval = match file.cleanup_interval_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(CLEANUP_INTERVAL),
        };

        Ok(Self {
            listen,
            authorized_chats: file.authorized_chats,
            dispatch: DispatchConfig { poll_timeout },
            registry: RegistryConfig {
                stale_threshold,
                cleanup_interval,
            },
        })
    }
}
