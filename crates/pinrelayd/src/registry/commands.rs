//! Registry actor commands, errors, and events.
//!
//! This module defines the message types for communicating with the `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `SessionEvent`: Events published by the registry for subscribers

use std::time::Duration;

use pinrelay_core::{
    NodeView, RegistrationRequest, RegistrationResult, ScheduleOperation, ScheduledCommand,
    SessionId,
};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::inbox::{InboxSender, SharedInbox};

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each request carries a oneshot channel for its response. The actor
/// answers every command within one turn and never waits on an inbox.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Claim pins for a new session.
    ///
    /// Stale sessions are swept first. The outcome is always a
    /// `RegistrationResult`; rejections are statuses, not errors.
    Register {
        request: RegistrationRequest,
        respond_to: oneshot::Sender<RegistrationResult>,
    },

    /// Remove a session. Responds `true` if it existed.
    Unregister {
        session_id: SessionId,
        respond_to: oneshot::Sender<bool>,
    },

    /// Which session owns a pin.
    OwnerOf {
        pin: String,
        respond_to: oneshot::Sender<Option<SessionId>>,
    },

    /// Inbox sender of the session owning `pin`.
    ///
    /// # Errors
    /// - `RegistryError::PinNotFound` if no live session owns the pin
    RouteAction {
        pin: String,
        respond_to: oneshot::Sender<Result<(SessionId, InboxSender), RegistryError>>,
    },

    /// Inbox sender of the session owning the operation's pin.
    ///
    /// The cached schedule is left alone until the node has taken the
    /// operation, see `RecordScheduleOperation`.
    ///
    /// # Errors
    /// - `RegistryError::PinNotFound` if no live session owns the pin
    RouteScheduleOperation {
        operation: ScheduleOperation,
        respond_to: oneshot::Sender<Result<(SessionId, InboxSender), RegistryError>>,
    },

    /// A node took a create/remove; update its cached schedule. Fire-and-forget.
    RecordScheduleOperation {
        session_id: SessionId,
        operation: ScheduleOperation,
    },

    /// Mark the start of a long poll and hand out the session's inbox.
    ///
    /// # Errors
    /// - `RegistryError::SessionNotFound` if the session doesn't exist
    BeginPoll {
        session_id: SessionId,
        respond_to: oneshot::Sender<Result<SharedInbox, RegistryError>>,
    },

    /// Mark the end of a long poll. Fire-and-forget.
    ///
    /// `at` is taken by the caller when the poll finished, not when the
    /// actor gets to the command.
    EndPoll { session_id: SessionId, at: Instant },

    /// Remove sessions idle for longer than `threshold` with no poll in flight.
    SweepStale {
        threshold: Duration,
        respond_to: oneshot::Sender<Vec<SessionId>>,
    },

    /// Pins of live sessions, after a sweep with the configured threshold.
    ActivePins {
        respond_to: oneshot::Sender<Vec<String>>,
    },

    /// Union of the cached schedules, ordered by fire time.
    ListSchedule {
        respond_to: oneshot::Sender<Vec<ScheduledCommand>>,
    },

    /// All sessions as views.
    GetAllSessions {
        respond_to: oneshot::Sender<Vec<NodeView>>,
    },

    /// Periodic sweep with the configured threshold. Fire-and-forget.
    CleanupStale,
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The requested session was not found.
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// No live session owns this pin.
    #[error("Pin does not exist: {0}")]
    PinNotFound(String),

    /// The operation has no pin to route by.
    #[error("schedule operation \"{0}\" can not be routed to a node")]
    Unroutable(String),

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

// ============================================================================
// Session Events
// ============================================================================

/// Events published by the registry to subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A node registered its pins.
    Registered {
        session_id: SessionId,
        pins: Vec<String>,
    },

    /// A session was removed from the registry.
    Removed {
        session_id: SessionId,
        reason: RemovalReason,
    },
}

/// Reason why a session was removed from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// The node unregistered.
    Explicit,

    /// No poll started or finished within the stale threshold.
    Stale,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explicit => write!(f, "unregistered"),
            Self::Stale => write!(f, "stopped polling"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_error_display() {
        let err = RegistryError::SessionNotFound(SessionId::new("session-9"));
        assert_eq!(err.to_string(), "session not found: session-9");

        let err = RegistryError::PinNotFound("garage".to_string());
        assert_eq!(err.to_string(), "Pin does not exist: garage");

        assert_eq!(
            RegistryError::ChannelClosed.to_string(),
            "response channel closed"
        );
    }

    #[test]
    fn test_removal_reason_display() {
        assert_eq!(RemovalReason::Explicit.to_string(), "unregistered");
        assert_eq!(RemovalReason::Stale.to_string(), "stopped polling");
    }
}
