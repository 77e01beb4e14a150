//! Node configuration.
//!
//! ```toml
//! server = "127.0.0.1:7465"
//! pins = ["light", "fan"]
//!
//! [[schedule]]
//! pin = "light"
//! state = true
//! time = "07:30:00"
//!
//! [client]
//! reconnect_attempts = 30
//! ```
//!
//! Everything is validated after parsing, so a node never registers pins
//! the dispatcher would reject.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use serde::Deserialize;
use thiserror::Error;

use pinrelay_core::{validate_pin_name, DomainError, PinCommand, ScheduledCommand, TimeOfDay};

use crate::client::ClientConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("Failed to parse config file {path}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Server address is empty")]
    NoServer,

    #[error("The pins array is empty")]
    NoPins,

    #[error(transparent)]
    InvalidPin(#[from] DomainError),

    #[error("Pin {0} is listed twice")]
    DuplicatePin(String),

    #[error("Schedule entry {index}: {pin} is not one of the configured pins")]
    UnknownSchedulePin { index: usize, pin: String },

    #[error("Invalid {field}: must be greater than zero")]
    Zero { field: &'static str },
}

/// One `[[schedule]]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleEntry {
    pub pin: String,
    pub state: bool,
    /// Entries from the config file repeat daily unless told otherwise
    #[serde(default = "default_repeat")]
    pub repeat: bool,
    pub time: TimeOfDay,
}

fn default_repeat() -> bool {
    true
}

impl ScheduleEntry {
    /// Builds the queued command, due at the next occurrence of `time`.
    pub fn to_scheduled(&self, now: DateTime<Local>) -> ScheduledCommand {
        ScheduledCommand::at_time_of_day(
            PinCommand::new(self.pin.clone(), self.state),
            self.time,
            self.repeat,
            now,
        )
    }
}

/// Optional `[client]` table; missing fields keep the client defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ClientSection {
    connect_timeout_ms: Option<u64>,
    reconnect_grace_ms: Option<u64>,
    reconnect_delay_secs: Option<u64>,
    reconnect_attempts: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeConfigFile {
    server: String,
    pins: Vec<String>,
    #[serde(default)]
    schedule: Vec<ScheduleEntry>,
    #[serde(default)]
    client: ClientSection,
}

/// Validated node settings.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Dispatcher address, `host:port`
    pub server: String,
    pub pins: Vec<String>,
    pub schedule: Vec<ScheduleEntry>,
    pub client: ClientConfig,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::parse(&text, path)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Self::parse(text, Path::new("<inline>"))
    }

    fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let file: NodeConfigFile = toml::from_str(text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::validate(file)
    }

    fn validate(file: NodeConfigFile) -> Result<Self, ConfigError> {
        let server = file.server.trim().to_string();
        if server.is_empty() {
            return Err(ConfigError::NoServer);
        }

        if file.pins.is_empty() {
            return Err(ConfigError::NoPins);
        }
        let mut seen = HashSet::new();
        for pin in &file.pins {
            validate_pin_name(pin)?;
            if !seen.insert(pin.as_str()) {
                return Err(ConfigError::DuplicatePin(pin.clone()));
            }
        }

        for (index, entry) in file.schedule.iter().enumerate() {
            if !seen.contains(entry.pin.as_str()) {
                return Err(ConfigError::UnknownSchedulePin {
                    index,
                    pin: entry.pin.clone(),
                });
            }
        }

        Ok(Self {
            server,
            pins: file.pins,
            schedule: file.schedule,
            client: client_config(file.client)?,
        })
    }

    /// The configured schedule as queued commands relative to `now`.
    pub fn initial_schedule(&self, now: DateTime<Local>) -> Vec<ScheduledCommand> {
        self.schedule
            .iter()
            .map(|entry| entry.to_scheduled(now))
            .collect()
    }
}

fn client_config(section: ClientSection) -> Result<ClientConfig, ConfigError> {
    let mut config = ClientConfig::default();

    if let Some(ms) = section.connect_timeout_ms {
        if ms == 0 {
            return Err(ConfigError::Zero {
                field: "connect_timeout_ms",
            });
        }
        config.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = section.reconnect_grace_ms {
        config.reconnect_grace = Duration::from_millis(ms);
    }
    if let Some(secs) = section.reconnect_delay_secs {
        config.reconnect_delay = Duration::from_secs(secs);
    }
    if let Some(attempts) = section.reconnect_attempts {
        if attempts == 0 {
            return Err(ConfigError::Zero {
                field: "reconnect_attempts",
            });
        }
        config.reconnect_attempts = attempts;
    }

    Ok(config)
}
