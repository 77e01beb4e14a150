//! Error types for the pinrelay node.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use thiserror::Error;

use crate::config::ConfigError;

// ============================================================================
// Node Error Type
// ============================================================================

/// Errors raised while talking to the dispatcher or running the node.
///
/// Startup errors (`Connect`, `ConnectTimeout`, `Registration`) are fatal:
/// a rejected registration will be rejected again with the same pins.
/// Transport errors during polling (`Io`, `Closed`, `Timeout`) send the
/// client into its reconnect loop instead.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Failed to connect to dispatcher at {addr}: {error}")]
    Connect { addr: String, error: String },

    #[error("Timed out connecting to dispatcher at {0}")]
    ConnectTimeout(String),

    /// Handshake refused by the dispatcher
    #[error("Dispatcher rejected the connection: {0}")]
    Rejected(String),

    #[error("Registration rejected: {0}")]
    Registration(String),

    /// Dispatcher answered a request with an error frame
    #[error("Dispatcher error: {message}")]
    Remote {
        message: String,
        code: Option<String>,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse message: {0}")]
    ParseError(#[from] serde_json::Error),

    /// Dispatcher closed the connection
    #[error("Connection closed by dispatcher")]
    Closed,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// Every reconnect attempt failed; the node has to stop.
    #[error("Gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Scheduler is not running")]
    SchedulerStopped,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl NodeError {
    /// True for failures of the transport itself, the ones a reconnect can fix.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Closed | Self::Timeout(_) | Self::ParseError(_) | Self::Protocol(_)
        )
    }
}

// ============================================================================
// Result Type Alias
// ============================================================================

pub type Result<T> = std::result::Result<T, NodeError>;
