//! Registration handshake payloads and the poll result.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{PinCommand, ScheduleOperation, ScheduledCommand, SessionId};

/// A node's claim on a set of pins, with its current schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub pins: Vec<String>,
    #[serde(default)]
    pub schedule: Vec<ScheduledCommand>,
}

impl RegistrationRequest {
    pub fn new(pins: Vec<String>, schedule: Vec<ScheduledCommand>) -> Self {
        Self { pins, schedule }
    }
}

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Ok,
    /// At least one requested pin is owned by another live session.
    PinAlreadyRegistered,
    /// At least one requested pin violates the naming rules.
    InvalidPinName,
    /// The dispatcher already holds its maximum number of sessions.
    RegistryFull,
}

impl fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::PinAlreadyRegistered => write!(f, "pin already registered"),
            Self::InvalidPinName => write!(f, "invalid pin name"),
            Self::RegistryFull => write!(f, "registry full"),
        }
    }
}

/// Reply to a [`RegistrationRequest`]. Registration is all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResult {
    pub status: RegistrationStatus,
    /// Set only when `status` is `Ok`.
    pub session_id: Option<SessionId>,
    /// Offending pin names for `PinAlreadyRegistered` / `InvalidPinName`.
    #[serde(default)]
    pub conflicting_pins: Vec<String>,
}

impl RegistrationResult {
    pub fn ok(session_id: SessionId) -> Self {
        Self {
            status: RegistrationStatus::Ok,
            session_id: Some(session_id),
            conflicting_pins: Vec::new(),
        }
    }

    pub fn rejected(status: RegistrationStatus, conflicting_pins: Vec<String>) -> Self {
        Self {
            status,
            session_id: None,
            conflicting_pins,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == RegistrationStatus::Ok && self.session_id.is_some()
    }

    /// Human-readable reason, e.g. "pin already registered: light, fan".
    pub fn describe(&self) -> String {
        if self.conflicting_pins.is_empty() {
            self.status.to_string()
        } else {
            format!("{}: {}", self.status, self.conflicting_pins.join(", "))
        }
    }
}

/// Result of one long poll: nothing, one pin command, or one schedule operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionBatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<PinCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_operation: Option<ScheduleOperation>,
}

impl ActionBatch {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn command(command: PinCommand) -> Self {
        Self {
            command: Some(command),
            schedule_operation: None,
        }
    }

    pub fn schedule_operation(operation: ScheduleOperation) -> Self {
        Self {
            command: None,
            schedule_operation: Some(operation),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.command.is_none() && self.schedule_operation.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_result_describe() {
        let ok = RegistrationResult::ok(SessionId::new("session-1"));
        assert!(ok.is_ok());
        assert_eq!(ok.describe(), "ok");

        let rejected = RegistrationResult::rejected(
            RegistrationStatus::PinAlreadyRegistered,
            vec!["light".to_string(), "fan".to_string()],
        );
        assert!(!rejected.is_ok());
        assert_eq!(rejected.describe(), "pin already registered: light, fan");
    }

    #[test]
    fn test_status_wire_format() {
        let json = serde_json::to_string(&RegistrationStatus::PinAlreadyRegistered).unwrap();
        assert_eq!(json, "\"pin_already_registered\"");
    }

    #[test]
    fn test_action_batch_constructors() {
        assert!(ActionBatch::empty().is_empty());

        let batch = ActionBatch::command(PinCommand::new("light", true));
        assert!(!batch.is_empty());
        assert!(batch.schedule_operation.is_none());

        let batch = ActionBatch::schedule_operation(ScheduleOperation::List);
        assert!(batch.command.is_none());
    }

    #[test]
    fn test_empty_batch_serializes_to_empty_object() {
        let json = serde_json::to_string(&ActionBatch::empty()).unwrap();
        assert_eq!(json, "{}");
        let back: ActionBatch = serde_json::from_str("{}").unwrap();
        assert!(back.is_empty());
    }
}
