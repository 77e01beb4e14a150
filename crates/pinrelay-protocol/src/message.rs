//! Protocol message types for dispatcher communication.
//!
//! Every frame is one JSON object terminated by `\n`. Client frames carry
//! `protocol_version` next to the `type` tag; the dispatcher answers each
//! request with exactly one [`DaemonMessage`], and pushes feed events
//! (`text_message`, `node_registered`, `node_removed`) to subscribed
//! connections.

use crate::version::ProtocolVersion;
use pinrelay_core::{
    ActionBatch, NodeView, PinCommand, RegistrationResult, ScheduleOperation, ScheduledCommand,
    SessionId, TextMessage,
};
use serde::{Deserialize, Serialize};

/// Message types that can be sent by nodes and control clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Handshake; must be the first frame on a connection
    Connect {
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    // ------------------------------------------------------------------
    // Node surface
    // ------------------------------------------------------------------
    /// Claim pins for this connection
    Register {
        pins: Vec<String>,
        #[serde(default)]
        schedule: Vec<ScheduledCommand>,
    },

    /// Release the pins claimed by this connection
    Unregister,

    /// Long poll for the next command or schedule operation
    CheckForActions,

    /// Text for a chat (action reports, schedule acknowledgements)
    SubmitMessage { text: String, chat_id: i64 },

    // ------------------------------------------------------------------
    // Control surface
    // ------------------------------------------------------------------
    /// Route a pin command to the owning node
    SubmitAction { command: PinCommand },

    /// Route a schedule create/remove to the owning node, or list schedules
    SubmitScheduleOperation { operation: ScheduleOperation },

    /// Union of the schedules of every registered node
    ListSchedule,

    /// Pins owned by live nodes
    ActivePins,

    /// Registered nodes with their pins and idle time
    ListNodes,

    /// Chat-style text command, answered with a `reply`
    Command { text: String, chat_id: i64 },

    /// Receive text messages and node events on this connection
    Subscribe,

    /// Stop receiving feed events
    Unsubscribe,

    Ping { seq: u64 },

    /// Client closing the connection
    Disconnect,
}

impl MessageType {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Register { .. } => "register",
            Self::Unregister => "unregister",
            Self::CheckForActions => "check_for_actions",
            Self::SubmitMessage { .. } => "submit_message",
            Self::SubmitAction { .. } => "submit_action",
            Self::SubmitScheduleOperation { .. } => "submit_schedule_operation",
            Self::ListSchedule => "list_schedule",
            Self::ActivePins => "active_pins",
            Self::ListNodes => "list_nodes",
            Self::Command { .. } => "command",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Ping { .. } => "ping",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Messages sent from clients to the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn register(pins: Vec<String>, schedule: Vec<ScheduledCommand>) -> Self {
        Self::new(MessageType::Register { pins, schedule })
    }

    pub fn unregister() -> Self {
        Self::new(MessageType::Unregister)
    }

    pub fn check_for_actions() -> Self {
        Self::new(MessageType::CheckForActions)
    }

    pub fn submit_message(message: TextMessage) -> Self {
        Self::new(MessageType::SubmitMessage {
            text: message.text,
            chat_id: message.chat_id,
        })
    }

    pub fn submit_action(command: PinCommand) -> Self {
        Self::new(MessageType::SubmitAction { command })
    }

    pub fn submit_schedule_operation(operation: ScheduleOperation) -> Self {
        Self::new(MessageType::SubmitScheduleOperation { operation })
    }

    pub fn list_schedule() -> Self {
        Self::new(MessageType::ListSchedule)
    }

    pub fn active_pins() -> Self {
        Self::new(MessageType::ActivePins)
    }

    pub fn list_nodes() -> Self {
        Self::new(MessageType::ListNodes)
    }

    pub fn command(text: impl Into<String>, chat_id: i64) -> Self {
        Self::new(MessageType::Command {
            text: text.into(),
            chat_id,
        })
    }

    pub fn subscribe() -> Self {
        Self::new(MessageType::Subscribe)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Messages sent from the dispatcher to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Handshake accepted
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Handshake refused (version mismatch, connection limit)
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    /// Answer to `register`
    RegistrationResult { result: RegistrationResult },

    /// Answer to `unregister`; sent whether or not a session existed
    Unregistered,

    /// Answer to `check_for_actions`; the batch is empty when the poll timed out
    Actions { batch: ActionBatch },

    /// A submitted action or schedule operation was handed to its node
    Accepted { message: String },

    Schedule { entries: Vec<ScheduledCommand> },

    ActivePins { pins: Vec<String> },

    NodeList { nodes: Vec<NodeView> },

    /// Answer to a chat-style `command`
    Reply { chat_id: i64, text: String },

    // ------------------------------------------------------------------
    // Feed events (subscribers only)
    // ------------------------------------------------------------------
    TextMessage { chat_id: i64, text: String },

    NodeRegistered {
        session_id: SessionId,
        pins: Vec<String>,
    },

    NodeRemoved { session_id: SessionId, reason: String },

    Pong { seq: u64 },

    /// Generic success without payload
    Ok,

    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn registration_result(result: RegistrationResult) -> Self {
        Self::RegistrationResult { result }
    }

    pub fn actions(batch: ActionBatch) -> Self {
        Self::Actions { batch }
    }

    pub fn accepted(message: impl Into<String>) -> Self {
        Self::Accepted {
            message: message.into(),
        }
    }

    pub fn reply(chat_id: i64, text: impl Into<String>) -> Self {
        Self::Reply {
            chat_id,
            text: text.into(),
        }
    }

    pub fn text_message(message: TextMessage) -> Self {
        Self::TextMessage {
            chat_id: message.chat_id,
            text: message.text,
        }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }

    /// True for frames pushed to subscribers rather than sent as a reply.
    pub fn is_feed_event(&self) -> bool {
        matches!(
            self,
            Self::TextMessage { .. } | Self::NodeRegistered { .. } | Self::NodeRemoved { .. }
        )
    }
}
