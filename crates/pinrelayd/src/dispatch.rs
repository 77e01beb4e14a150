//! Dispatch of commands and schedule operations to the nodes owning them.
//!
//! The [`Dispatcher`] sits between the connection handlers and the
//! registry actor. Submissions are rendezvous operations: they complete
//! only when a long poll of the owning node has taken the item, or fail
//! once the node goes away.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info};

use pinrelay_core::{
    NodeView, PinCommand, RegistrationRequest, RegistrationResult, ScheduleOperation,
    ScheduledCommand, SessionId, TextMessage,
};

use crate::registry::{Pending, RegistryError, RegistryHandle};

/// How long a `check_for_actions` call waits for an item.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// Buffered text messages per subscriber before it starts lagging.
const MESSAGE_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct DispatchConfig {
    pub poll_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// Outcome of a schedule submission.
#[derive(Debug, Clone)]
pub enum ScheduleSubmission {
    /// A create or remove was handed to the owning node.
    Delivered(SessionId),

    /// A list request, answered from the registry's cached schedules.
    Listed(Vec<ScheduledCommand>),
}

/// Errors returned to the caller of a single dispatch operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Pin does not exist: {0}")]
    PinNotFound(String),

    /// The owning node went away before a poll took the item.
    #[error("node owning {pin} disconnected before taking the request")]
    ClientGone { pin: String },

    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("{0}")]
    Unroutable(String),

    #[error("registry is not running")]
    RegistryClosed,
}

impl DispatchError {
    /// Stable machine-readable code for protocol error frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PinNotFound(_) => "pin_not_found",
            Self::ClientGone { .. } => "client_gone",
            Self::UnknownSession(_) => "unknown_session",
            Self::Unroutable(_) => "unroutable",
            Self::RegistryClosed => "registry_closed",
        }
    }
}

impl From<RegistryError> for DispatchError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::SessionNotFound(id) => Self::UnknownSession(id),
            RegistryError::PinNotFound(pin) => Self::PinNotFound(pin),
            RegistryError::Unroutable(_) => Self::Unroutable(err.to_string()),
            RegistryError::ChannelClosed => Self::RegistryClosed,
        }
    }
}

/// Routes submissions to nodes and serves their long polls.
///
/// Cheap to clone; every clone shares the same registry and message feed.
#[derive(Clone)]
pub struct Dispatcher {
    registry: RegistryHandle,
    config: DispatchConfig,
    messages: broadcast::Sender<TextMessage>,
}

impl Dispatcher {
    pub fn new(registry: RegistryHandle, config: DispatchConfig) -> Self {
        let (messages, _) = broadcast::channel(MESSAGE_BUFFER);
        Self {
            registry,
            config,
            messages,
        }
    }

    pub fn registry(&self) -> &RegistryHandle {
        &self.registry
    }

    pub fn config(&self) -> DispatchConfig {
        self.config
    }

    // ------------------------------------------------------------------
    // Node surface
    // ------------------------------------------------------------------

    pub async fn register(
        &self,
        request: RegistrationRequest,
    ) -> Result<RegistrationResult, DispatchError> {
        let pins = request.pins.clone();
        let result = self.registry.register(request).await?;
        if result.is_ok() {
            info!(session_id = ?result.session_id, pins = ?pins, "Node registered");
        } else {
            info!(pins = ?pins, outcome = %result.describe(), "Registration rejected");
        }
        Ok(result)
    }

    /// Drops a session. Unknown sessions are not an error.
    pub async fn unregister(&self, session_id: SessionId) -> Result<(), DispatchError> {
        let existed = self.registry.unregister(session_id.clone()).await?;
        debug!(session_id = %session_id, existed, "Unregister");
        Ok(())
    }

    /// Waits up to the poll timeout for the next item addressed to the session.
    ///
    /// Returns `None` when nothing arrived in time. The returned item is not
    /// yet handed over: the caller sends [`Pending::batch`] to the node and
    /// then calls [`Pending::accept`]. Dropping it reports the item as
    /// undelivered to its submitter.
    pub async fn check_for_actions(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<Pending>, DispatchError> {
        let inbox = self.registry.begin_poll(session_id.clone()).await?;

        let waited = timeout(self.config.poll_timeout, async {
            let mut inbox = inbox.lock().await;
            inbox.next().await
        })
        .await;

        self.registry.end_poll(session_id.clone()).await;

        Ok(waited.ok())
    }

    /// Text for a chat, fanned out to subscribed front ends.
    pub fn submit_message(&self, message: TextMessage) {
        info!(chat_id = message.chat_id, text = %message.text, "Text message");
        if self.messages.send(message).is_err() {
            debug!("No subscribers for text message");
        }
    }

    pub fn subscribe_messages(&self) -> broadcast::Receiver<TextMessage> {
        self.messages.subscribe()
    }

    // ------------------------------------------------------------------
    // Control surface
    // ------------------------------------------------------------------

    /// Hands a command to the node owning its pin.
    ///
    /// Completes once a poll of that node has taken the command. Submitters
    /// targeting the same node are served in arrival order.
    pub async fn submit_action(&self, command: PinCommand) -> Result<SessionId, DispatchError> {
        let pin = command.pin.clone();
        let (owner, inbox) = self.registry.route_action(&pin).await?;
        debug!(pin = %pin, owner = %owner, "Routing action");

        inbox
            .deliver_action(command)
            .await
            .map_err(|_| DispatchError::ClientGone { pin })?;
        Ok(owner)
    }

    /// Hands a create or remove to the node owning its pin; answers `List` directly.
    ///
    /// The cached schedule follows the operation only once a poll has taken it.
    pub async fn submit_schedule_operation(
        &self,
        operation: ScheduleOperation,
    ) -> Result<ScheduleSubmission, DispatchError> {
        let Some(pin) = operation.target_pin().map(str::to_string) else {
            return Ok(ScheduleSubmission::Listed(self.list_schedule().await));
        };

        let (owner, inbox) = self
            .registry
            .route_schedule_operation(operation.clone())
            .await?;
        debug!(operation = %operation, owner = %owner, "Routing schedule operation");

        inbox
            .deliver_schedule_operation(operation.clone())
            .await
            .map_err(|_| DispatchError::ClientGone { pin })?;
        self.registry
            .record_schedule_operation(owner.clone(), operation)
            .await;
        Ok(ScheduleSubmission::Delivered(owner))
    }

    pub async fn list_schedule(&self) -> Vec<ScheduledCommand> {
        self.registry.list_schedule().await
    }

    pub async fn active_pins(&self) -> Vec<String> {
        self.registry.active_pins().await
    }

    pub async fn nodes(&self) -> Vec<NodeView> {
        self.registry.get_all_sessions().await
    }
}
