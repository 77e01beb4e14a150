//! pinrelay Protocol - Wire protocol for dispatcher communication
//!
//! This crate provides the newline-delimited JSON messages exchanged
//! between the dispatcher daemon, the nodes that poll it and the control
//! clients that submit commands, plus the grammar of chat-style text
//! commands.

pub mod command;
pub mod message;
pub mod version;

pub use command::{parse_duration, ChatCommand, CommandError};
pub use message::{ClientMessage, DaemonMessage, MessageType};
pub use version::ProtocolVersion;
