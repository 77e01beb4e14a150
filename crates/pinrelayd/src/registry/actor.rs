//! Registry actor - owns all session state and processes commands.
//!
//! The RegistryActor is the single owner of session state in the system.
//! It receives commands via an mpsc channel and publishes events via broadcast.
//! Every command is handled to completion in one turn, so a register's
//! conflict check and insert can never interleave with another register.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are logged but don't panic

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use pinrelay_core::{
    validate_pin_name, NodeView, RegistrationRequest, RegistrationResult, RegistrationStatus,
    ScheduleOperation, ScheduledCommand, SessionId,
};

use super::commands::{RegistryCommand, RegistryError, RemovalReason, SessionEvent};
use super::inbox::{inbox, InboxSender, SharedInbox};

// ============================================================================
// Resource Limits
// ============================================================================

/// Maximum number of sessions the registry can hold.
pub const MAX_SESSIONS: usize = 100;

/// A session is stale after this long without a poll starting or finishing.
pub const STALE_THRESHOLD: Duration = Duration::from_secs(6);

// ============================================================================
// Client Session
// ============================================================================

/// Everything the dispatcher knows about one registered node.
struct ClientSession {
    pins: Vec<String>,
    /// Node's schedule as of registration, kept current by routed operations.
    schedule: Vec<ScheduledCommand>,
    last_contact: Instant,
    polls_in_flight: usize,
    sender: InboxSender,
    inbox: SharedInbox,
}

impl ClientSession {
    fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        self.polls_in_flight == 0 && now.saturating_duration_since(self.last_contact) > threshold
    }

    fn touch(&mut self, at: Instant) {
        self.last_contact = self.last_contact.max(at);
    }

    fn apply_schedule_operation(&mut self, operation: &ScheduleOperation, now: DateTime<Local>) {
        match operation {
            ScheduleOperation::Create(entry) => self.schedule.push(entry.clone().normalized(now)),
            ScheduleOperation::Remove(entry) => {
                if let Some(position) = self.schedule.iter().position(|e| e.matches(entry)) {
                    self.schedule.remove(position);
                }
            }
            ScheduleOperation::List => {}
        }
    }

    /// Entries still pending on the node at `now`: one-shot entries that
    /// already fired are gone, repeating ones have rolled to their next day.
    fn pending_schedule(&self, now: DateTime<Local>) -> Vec<ScheduledCommand> {
        self.schedule
            .iter()
            .filter_map(|entry| {
                if entry.repeat_daily {
                    Some(entry.clone().normalized(now))
                } else if entry.fire_at >= now {
                    Some(entry.clone())
                } else {
                    None
                }
            })
            .collect()
    }
}

// ============================================================================
// Registry Actor
// ============================================================================

/// The registry actor - owns all session state.
///
/// Implements the actor pattern: receives commands via mpsc channel,
/// processes them sequentially, and publishes events to subscribers.
///
/// # Ownership
///
/// The actor owns:
/// - `sessions`: session data keyed by `SessionId` (ordered, so listings are stable)
/// - `pin_owners`: index for pin → session lookups
///
/// Inbox receivers are shared with in-flight polls through `SharedInbox`;
/// the actor never locks them.
pub struct RegistryActor {
    /// Command receiver
    receiver: mpsc::Receiver<RegistryCommand>,

    sessions: BTreeMap<SessionId, ClientSession>,

    pin_owners: HashMap<String, SessionId>,

    /// Monotonic counter behind `SessionId::from_sequence`
    next_session: u64,

    stale_threshold: Duration,

    /// Event publisher for node registrations and removals
    event_publisher: broadcast::Sender<SessionEvent>,
}

impl RegistryActor {
    /// Creates a new registry actor.
    ///
    /// # Arguments
    ///
    /// * `receiver` - Channel for receiving commands
    /// * `event_publisher` - Broadcast channel for publishing events
    /// * `stale_threshold` - Idle time after which a session may be swept
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<SessionEvent>,
        stale_threshold: Duration,
    ) -> Self {
        Self {
            receiver,
            sessions: BTreeMap::new(),
            pin_owners: HashMap::new(),
            next_session: 1,
            stale_threshold,
            event_publisher,
        }
    }

    /// Runs the actor event loop.
    ///
    /// Processes commands until the channel closes (all senders dropped).
    pub async fn run(mut self) {
        info!(
            stale_threshold_ms = self.stale_threshold.as_millis() as u64,
            "Registry actor starting"
        );

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(sessions = self.sessions.len(), "Registry actor stopped");
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        // Ignore send errors below: the requester may have dropped the receiver.
        match cmd {
            RegistryCommand::Register {
                request,
                respond_to,
            } => {
                let result = self.handle_register(request);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Unregister {
                session_id,
                respond_to,
            } => {
                let removed = self.remove_session(&session_id, RemovalReason::Explicit);
                if !removed {
                    debug!(session_id = %session_id, "Unregister for unknown session");
                }
                let _ = respond_to.send(removed);
            }
            RegistryCommand::OwnerOf { pin, respond_to } => {
                let _ = respond_to.send(self.pin_owners.get(&pin).cloned());
            }
            RegistryCommand::RouteAction { pin, respond_to } => {
                let _ = respond_to.send(self.handle_route(&pin));
            }
            RegistryCommand::RouteScheduleOperation {
                operation,
                respond_to,
            } => {
                let result = self.handle_route_schedule_operation(operation);
                let _ = respond_to.send(result);
            }
            RegistryCommand::RecordScheduleOperation {
                session_id,
                operation,
            } => {
                self.handle_record_schedule_operation(&session_id, &operation);
            }
            RegistryCommand::BeginPoll {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_begin_poll(session_id));
            }
            RegistryCommand::EndPoll { session_id, at } => {
                self.handle_end_poll(&session_id, at);
            }
            RegistryCommand::SweepStale {
                threshold,
                respond_to,
            } => {
                let _ = respond_to.send(self.sweep_stale(threshold));
            }
            RegistryCommand::ActivePins { respond_to } => {
                self.sweep_stale(self.stale_threshold);
                let _ = respond_to.send(self.handle_active_pins());
            }
            RegistryCommand::ListSchedule { respond_to } => {
                let _ = respond_to.send(self.handle_list_schedule());
            }
            RegistryCommand::GetAllSessions { respond_to } => {
                let _ = respond_to.send(self.handle_get_all_sessions());
            }
            RegistryCommand::CleanupStale => {
                self.sweep_stale(self.stale_threshold);
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    /// Handles pin registration. All-or-nothing.
    fn handle_register(&mut self, request: RegistrationRequest) -> RegistrationResult {
        self.sweep_stale(self.stale_threshold);

        let mut pins: Vec<String> = Vec::with_capacity(request.pins.len());
        for pin in request.pins {
            if !pins.contains(&pin) {
                pins.push(pin);
            }
        }

        let invalid: Vec<String> = pins
            .iter()
            .filter(|pin| validate_pin_name(pin).is_err())
            .cloned()
            .collect();
        if pins.is_empty() || !invalid.is_empty() {
            warn!(invalid = ?invalid, "Registration rejected: invalid pin names");
            return RegistrationResult::rejected(RegistrationStatus::InvalidPinName, invalid);
        }

        if self.sessions.len() >= MAX_SESSIONS {
            warn!(
                current = self.sessions.len(),
                max = MAX_SESSIONS,
                "Registry is full, rejecting registration"
            );
            return RegistrationResult::rejected(RegistrationStatus::RegistryFull, Vec::new());
        }

        let conflicting: Vec<String> = pins
            .iter()
            .filter(|pin| self.pin_owners.contains_key(*pin))
            .cloned()
            .collect();
        if !conflicting.is_empty() {
            info!(conflicting = ?conflicting, "Registration rejected: pins already registered");
            return RegistrationResult::rejected(
                RegistrationStatus::PinAlreadyRegistered,
                conflicting,
            );
        }

        let session_id = SessionId::from_sequence(self.next_session);
        self.next_session = self.next_session.saturating_add(1);

        let (sender, inbox) = inbox();
        for pin in &pins {
            self.pin_owners.insert(pin.clone(), session_id.clone());
        }
        self.sessions.insert(
            session_id.clone(),
            ClientSession {
                pins: pins.clone(),
                schedule: request.schedule,
                last_contact: Instant::now(),
                polls_in_flight: 0,
                sender,
                inbox,
            },
        );

        info!(
            session_id = %session_id,
            pins = ?pins,
            total_sessions = self.sessions.len(),
            "Node registered"
        );

        // Publish event (ignore if no subscribers)
        let _ = self.event_publisher.send(SessionEvent::Registered {
            session_id: session_id.clone(),
            pins,
        });

        RegistrationResult::ok(session_id)
    }

    fn handle_route(&self, pin: &str) -> Result<(SessionId, InboxSender), RegistryError> {
        let session_id = self
            .pin_owners
            .get(pin)
            .ok_or_else(|| RegistryError::PinNotFound(pin.to_string()))?;
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| RegistryError::PinNotFound(pin.to_string()))?;
        Ok((session_id.clone(), session.sender.clone()))
    }

    fn handle_route_schedule_operation(
        &self,
        operation: ScheduleOperation,
    ) -> Result<(SessionId, InboxSender), RegistryError> {
        let pin = operation
            .target_pin()
            .ok_or_else(|| RegistryError::Unroutable(operation.kind().to_string()))?;
        let (session_id, sender) = self.handle_route(pin)?;

        debug!(
            session_id = %session_id,
            operation = %operation,
            "Schedule operation routed"
        );
        Ok((session_id, sender))
    }

    /// Applies an operation the node has taken to its cached schedule.
    fn handle_record_schedule_operation(
        &mut self,
        session_id: &SessionId,
        operation: &ScheduleOperation,
    ) {
        match self.sessions.get_mut(session_id) {
            Some(session) => session.apply_schedule_operation(operation, Local::now()),
            None => debug!(
                session_id = %session_id,
                operation = %operation,
                "Schedule operation recorded for removed session"
            ),
        }
    }

    fn handle_begin_poll(&mut self, session_id: SessionId) -> Result<SharedInbox, RegistryError> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| RegistryError::SessionNotFound(session_id.clone()))?;
        session.touch(Instant::now());
        session.polls_in_flight = session.polls_in_flight.saturating_add(1);
        Ok(session.inbox.clone())
    }

    fn handle_end_poll(&mut self, session_id: &SessionId, at: Instant) {
        match self.sessions.get_mut(session_id) {
            Some(session) => {
                session.touch(at);
                session.polls_in_flight = session.polls_in_flight.saturating_sub(1);
            }
            None => debug!(session_id = %session_id, "Poll ended for removed session"),
        }
    }

    /// Removes every stale session, returning their IDs.
    fn sweep_stale(&mut self, threshold: Duration) -> Vec<SessionId> {
        let now = Instant::now();
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, session)| session.is_stale(now, threshold))
            .map(|(id, _)| id.clone())
            .collect();

        for session_id in &stale {
            self.remove_session(session_id, RemovalReason::Stale);
        }
        stale
    }

    fn handle_active_pins(&self) -> Vec<String> {
        self.sessions
            .values()
            .flat_map(|session| session.pins.iter().cloned())
            .collect()
    }

    fn handle_list_schedule(&self) -> Vec<ScheduledCommand> {
        let now = Local::now();
        let mut entries: Vec<ScheduledCommand> = self
            .sessions
            .values()
            .flat_map(|session| session.pending_schedule(now))
            .collect();
        entries.sort_by_key(|entry| entry.fire_at);
        entries
    }

    fn handle_get_all_sessions(&self) -> Vec<NodeView> {
        let now = Instant::now();
        let wall_clock = Local::now();
        self.sessions
            .iter()
            .map(|(session_id, session)| NodeView {
                session_id: session_id.clone(),
                pins: session.pins.clone(),
                scheduled: session.pending_schedule(wall_clock),
                idle_secs: now.saturating_duration_since(session.last_contact).as_secs(),
                polling: session.polls_in_flight > 0,
            })
            .collect()
    }

    /// Removes a session and its pins. Dropping the session drops its
    /// inbox senders, which releases any submitter still waiting on it.
    fn remove_session(&mut self, session_id: &SessionId, reason: RemovalReason) -> bool {
        let Some(session) = self.sessions.remove(session_id) else {
            return false;
        };
        for pin in &session.pins {
            self.pin_owners.remove(pin);
        }

        match reason {
            RemovalReason::Stale => warn!(
                session_id = %session_id,
                pins = ?session.pins,
                reason = %reason,
                "Session removed by sweep"
            ),
            RemovalReason::Explicit => info!(
                session_id = %session_id,
                remaining_sessions = self.sessions.len(),
                "Node unregistered"
            ),
        }

        let _ = self.event_publisher.send(SessionEvent::Removed {
            session_id: session_id.clone(),
            reason,
        });
        true
    }

    // ========================================================================
    // Accessors (for testing)
    // ========================================================================

    #[cfg(test)]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}
