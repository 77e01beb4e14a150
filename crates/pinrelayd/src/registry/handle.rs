//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending commands
//! to the registry actor and subscribing to session events.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use pinrelay_core::{
    NodeView, RegistrationRequest, RegistrationResult, ScheduleOperation, ScheduledCommand,
    SessionId,
};

use super::commands::{RegistryCommand, RegistryError, SessionEvent};
use super::inbox::{InboxSender, SharedInbox};

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the registry actor.
///
/// This is a cheap-to-clone handle that can be shared across tasks.
/// All methods are async and communicate with the actor via channels.
///
/// # Usage
///
/// ```ignore
/// let result = handle.register(RegistrationRequest::new(pins, schedule)).await?;
/// let (owner, inbox) = handle.route_action("light").await?;
///
/// let mut rx = handle.subscribe();
/// while let Ok(event) = rx.recv().await {
///     // Handle event
/// }
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    /// Command sender to the actor
    sender: mpsc::Sender<RegistryCommand>,

    /// Event broadcaster for subscribing to updates
    event_sender: broadcast::Sender<SessionEvent>,
}

impl RegistryHandle {
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Sends a command built around a fresh oneshot and awaits the answer.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Claims pins for a new session.
    ///
    /// Rejections (conflict, invalid names, capacity) come back as a
    /// `RegistrationResult` status.
    ///
    /// # Errors
    ///
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn register(
        &self,
        request: RegistrationRequest,
    ) -> Result<RegistrationResult, RegistryError> {
        self.request(|respond_to| RegistryCommand::Register {
            request,
            respond_to,
        })
        .await
    }

    /// Removes a session. Returns whether it existed.
    pub async fn unregister(&self, session_id: SessionId) -> Result<bool, RegistryError> {
        self.request(|respond_to| RegistryCommand::Unregister {
            session_id,
            respond_to,
        })
        .await
    }

    /// Returns the session owning `pin`, if any.
    pub async fn owner_of(&self, pin: &str) -> Option<SessionId> {
        self.request(|respond_to| RegistryCommand::OwnerOf {
            pin: pin.to_string(),
            respond_to,
        })
        .await
        .ok()
        .flatten()
    }

    /// Looks up the inbox of the session owning `pin`.
    ///
    /// # Errors
    ///
    /// - `RegistryError::PinNotFound` if no live session owns the pin
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn route_action(&self, pin: &str) -> Result<(SessionId, InboxSender), RegistryError> {
        self.request(|respond_to| RegistryCommand::RouteAction {
            pin: pin.to_string(),
            respond_to,
        })
        .await?
    }

    /// Looks up the inbox for a create/remove.
    ///
    /// The cached schedule is untouched; call
    /// [`RegistryHandle::record_schedule_operation`] once the node took it.
    ///
    /// # Errors
    ///
    /// - `RegistryError::PinNotFound` if no live session owns the pin
    /// - `RegistryError::Unroutable` for `List`
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn route_schedule_operation(
        &self,
        operation: ScheduleOperation,
    ) -> Result<(SessionId, InboxSender), RegistryError> {
        self.request(|respond_to| RegistryCommand::RouteScheduleOperation {
            operation,
            respond_to,
        })
        .await?
    }

    /// Applies a create/remove the node has taken to its cached schedule.
    pub async fn record_schedule_operation(
        &self,
        session_id: SessionId,
        operation: ScheduleOperation,
    ) {
        // Actor gone means there is no cache left to update.
        let _ = self
            .sender
            .send(RegistryCommand::RecordScheduleOperation {
                session_id,
                operation,
            })
            .await;
    }

    /// Starts a long poll: refreshes last contact and returns the inbox.
    ///
    /// Every successful call must be paired with [`RegistryHandle::end_poll`].
    ///
    /// # Errors
    ///
    /// - `RegistryError::SessionNotFound` if the session doesn't exist
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn begin_poll(&self, session_id: SessionId) -> Result<SharedInbox, RegistryError> {
        self.request(|respond_to| RegistryCommand::BeginPoll {
            session_id,
            respond_to,
        })
        .await?
    }

    /// Ends a long poll started with [`RegistryHandle::begin_poll`].
    pub async fn end_poll(&self, session_id: SessionId) {
        // Actor gone means there is no session left to update.
        let _ = self
            .sender
            .send(RegistryCommand::EndPoll {
                session_id,
                at: Instant::now(),
            })
            .await;
    }

    /// Removes sessions idle for longer than `threshold` with no poll in flight.
    pub async fn sweep_stale(&self, threshold: Duration) -> Result<Vec<SessionId>, RegistryError> {
        self.request(|respond_to| RegistryCommand::SweepStale {
            threshold,
            respond_to,
        })
        .await
    }

    /// Pins of live sessions. Runs a staleness sweep first.
    ///
    /// Returns an empty vector if communication with the actor fails.
    pub async fn active_pins(&self) -> Vec<String> {
        self.request(|respond_to| RegistryCommand::ActivePins { respond_to })
            .await
            .unwrap_or_default()
    }

    /// Union of every session's cached schedule, ordered by fire time.
    pub async fn list_schedule(&self) -> Vec<ScheduledCommand> {
        self.request(|respond_to| RegistryCommand::ListSchedule { respond_to })
            .await
            .unwrap_or_default()
    }

    /// All sessions as views.
    pub async fn get_all_sessions(&self) -> Vec<NodeView> {
        self.request(|respond_to| RegistryCommand::GetAllSessions { respond_to })
            .await
            .unwrap_or_default()
    }

    /// Subscribe to registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{spawn_registry, RegistryConfig};
    use pinrelay_core::{PinCommand, RegistrationStatus};

    fn config() -> RegistryConfig {
        RegistryConfig {
            cleanup_interval: None,
            ..RegistryConfig::default()
        }
    }

    fn request(pins: &[&str]) -> RegistrationRequest {
        RegistrationRequest::new(pins.iter().map(|p| p.to_string()).collect(), Vec::new())
    }

    #[tokio::test]
    async fn test_handle_register_and_lookup() {
        let handle = spawn_registry(config());

        let result = handle.register(request(&["light", "fan"])).await.unwrap();
        assert!(result.is_ok());
        let id = result.session_id.unwrap();

        assert_eq!(handle.owner_of("light").await, Some(id.clone()));
        assert_eq!(handle.owner_of("pump").await, None);

        let mut pins = handle.active_pins().await;
        pins.sort();
        assert_eq!(pins, vec!["fan", "light"]);

        let nodes = handle.get_all_sessions().await;
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].session_id, id);
    }

    #[tokio::test]
    async fn test_handle_conflict() {
        let handle = spawn_registry(config());
        handle.register(request(&["light"])).await.unwrap();

        let result = handle.register(request(&["light"])).await.unwrap();
        assert_eq!(result.status, RegistrationStatus::PinAlreadyRegistered);
        assert_eq!(result.conflicting_pins, vec!["light"]);
    }

    #[tokio::test]
    async fn test_handle_route_and_deliver() {
        let handle = spawn_registry(config());
        let id = handle
            .register(request(&["light"]))
            .await
            .unwrap()
            .session_id
            .unwrap();

        let (owner, sender) = handle.route_action("light").await.unwrap();
        assert_eq!(owner, id);

        let inbox = handle.begin_poll(id.clone()).await.unwrap();
        let submit = tokio::spawn(async move {
            sender.deliver_action(PinCommand::new("light", true)).await
        });
        let batch = inbox.lock().await.next().await.accept();
        handle.end_poll(id).await;

        assert!(batch.command.is_some());
        assert!(submit.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_handle_unregister_releases_waiting_submitter() {
        let handle = spawn_registry(config());
        let id = handle
            .register(request(&["light"]))
            .await
            .unwrap()
            .session_id
            .unwrap();

        let (_, sender) = handle.route_action("light").await.unwrap();
        let submit = tokio::spawn(async move {
            sender.deliver_action(PinCommand::new("light", true)).await
        });
        tokio::task::yield_now().await;

        assert!(handle.unregister(id.clone()).await.unwrap());
        assert!(submit.await.unwrap().is_err());
        assert!(!handle.unregister(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_handle_events() {
        let handle = spawn_registry(config());
        let mut events = handle.subscribe();

        let id = handle
            .register(request(&["light"]))
            .await
            .unwrap()
            .session_id
            .unwrap();
        handle.unregister(id).await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Registered { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SessionEvent::Removed { .. }
        ));
    }
}
