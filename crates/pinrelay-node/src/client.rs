//! Reconnecting poll client.
//!
//! ```text
//! Disconnected ─▶ Connecting ─▶ Registered ─▶ Polling ─▶ Unregistering ─▶ Disconnected
//!                                               │  ▲
//!                                               ▼  │
//!                                           Reconnecting ──(N failures)──▶ fatal
//! ```
//!
//! Startup failures are fatal: an unreachable dispatcher or a rejected
//! registration is returned to the caller without retrying. Once polling,
//! a transport failure is retried with a fixed delay, re-registering the
//! scheduler's current entries on every attempt. Running out of attempts
//! returns [`NodeError::ReconnectExhausted`].
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()`.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pinrelay_core::ActionBatch;

use crate::dispatch::{LocalDispatch, ReportReceiver};
use crate::error::{NodeError, Result};
use crate::rpc::{DaemonConnection, REQUEST_TIMEOUT};
use crate::scheduler::SchedulerHandle;

// ============================================================================
// Configuration
// ============================================================================

/// Timings for the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Startup and reconnect connect timeout, handshake included.
    pub connect_timeout: Duration,

    /// Pause after a transport error before the first reconnect attempt.
    pub reconnect_grace: Duration,

    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,

    /// Attempts before giving up.
    pub reconnect_attempts: u32,

    /// Timeout for register, unregister and message reports.
    pub request_timeout: Duration,

    /// Client-side bound on one long poll; well above the dispatcher's wait.
    pub poll_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(1),
            reconnect_grace: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(10),
            reconnect_attempts: 30,
            request_timeout: REQUEST_TIMEOUT,
            poll_timeout: Duration::from_secs(10),
        }
    }
}

// ============================================================================
// State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Registered,
    Polling,
    Reconnecting { attempt: u32 },
    Unregistering,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Registered => write!(f, "registered"),
            Self::Polling => write!(f, "polling"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            Self::Unregistering => write!(f, "unregistering"),
        }
    }
}

/// How the poll loop ended.
enum PollOutcome {
    Shutdown,
    /// Transport failure, or the dispatcher no longer knows our session
    Lost(NodeError),
}

// ============================================================================
// Client
// ============================================================================

pub struct ReconnectingClient {
    server: String,
    pins: Vec<String>,
    config: ClientConfig,
    dispatch: LocalDispatch,
    scheduler: SchedulerHandle,
    reports: ReportReceiver,
    connection: Option<DaemonConnection>,
    state: watch::Sender<ClientState>,
    cancel_token: CancellationToken,
}

impl ReconnectingClient {
    /// Connects and registers `pins` with the scheduler's current entries.
    ///
    /// Any failure here is final.
    pub async fn start(
        server: impl Into<String>,
        pins: Vec<String>,
        config: ClientConfig,
        dispatch: LocalDispatch,
        scheduler: SchedulerHandle,
        reports: ReportReceiver,
        cancel_token: CancellationToken,
    ) -> Result<Self> {
        let (state, _) = watch::channel(ClientState::Disconnected);
        let mut client = Self {
            server: server.into(),
            pins,
            config,
            dispatch,
            scheduler,
            reports,
            connection: None,
            state,
            cancel_token,
        };

        client.set_state(ClientState::Connecting);
        let connection = client.connect_and_register().await?;
        client.connection = Some(connection);
        info!(server = %client.server, pins = ?client.pins, "Node registered");
        Ok(client)
    }

    /// Observes state transitions.
    pub fn state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ClientState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Client state changed");
        }
    }

    async fn connect_and_register(&self) -> Result<DaemonConnection> {
        let mut connection =
            DaemonConnection::connect(&self.server, self.config.connect_timeout, None).await?;

        let result = connection
            .register(
                self.pins.clone(),
                self.scheduler.snapshot(),
                self.config.request_timeout,
            )
            .await?;
        if !result.is_ok() {
            return Err(NodeError::Registration(result.describe()));
        }

        self.set_state(ClientState::Registered);
        Ok(connection)
    }

    /// Polls until shutdown. Returns an error only when reconnecting failed
    /// for good.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let Some(mut connection) = self.connection.take() else {
                return Ok(());
            };

            match self.poll_loop(&mut connection).await {
                PollOutcome::Shutdown => {
                    self.shutdown(connection).await;
                    return Ok(());
                }
                PollOutcome::Lost(e) => {
                    warn!(error = %e, "Lost connection to dispatcher, reconnecting");
                    drop(connection);
                    self.set_state(ClientState::Disconnected);

                    match self.reconnect().await {
                        Ok(Some(connection)) => {
                            info!("Reconnected to dispatcher");
                            self.connection = Some(connection);
                        }
                        Ok(None) => {
                            info!("Shutdown requested while reconnecting");
                            self.set_state(ClientState::Disconnected);
                            return Ok(());
                        }
                        Err(e) => {
                            error!(error = %e, "Giving up on dispatcher");
                            self.set_state(ClientState::Disconnected);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Reports pending messages, then long-polls, until cancelled or the
    /// transport fails. An in-flight poll is allowed to finish.
    async fn poll_loop(&mut self, connection: &mut DaemonConnection) -> PollOutcome {
        self.set_state(ClientState::Polling);

        loop {
            if let Err(e) = self.flush_reports(connection).await {
                return PollOutcome::Lost(e);
            }
            if self.cancel_token.is_cancelled() {
                return PollOutcome::Shutdown;
            }

            match connection.check_for_actions(self.config.poll_timeout).await {
                Ok(batch) => self.handle_batch(batch).await,
                Err(e) => {
                    if !e.is_transport() {
                        // Swept session: a fresh registration is needed
                        warn!(error = %e, "Poll rejected by dispatcher");
                    }
                    return PollOutcome::Lost(e);
                }
            }
        }
    }

    async fn handle_batch(&mut self, batch: ActionBatch) {
        if let Some(command) = batch.command {
            debug!(command = %command, "Received pin command");
            self.dispatch.apply(&command);
        }

        if let Some(operation) = batch.schedule_operation {
            info!(operation = %operation, "Received schedule operation");
            if let Err(e) = self.scheduler.submit(operation).await {
                warn!(error = %e, "Schedule operation dropped");
            }
        }
    }

    /// Sends every queued report. A report that fails to send is lost with
    /// the connection.
    async fn flush_reports(&mut self, connection: &mut DaemonConnection) -> Result<()> {
        while let Ok(message) = self.reports.try_recv() {
            debug!(chat_id = message.chat_id, text = %message.text, "Reporting to dispatcher");
            connection
                .submit_message(message, self.config.request_timeout)
                .await?;
        }
        Ok(())
    }

    /// Waits out the grace period, then tries up to `reconnect_attempts`
    /// times. `Ok(None)` means shutdown was requested meanwhile.
    async fn reconnect(&self) -> Result<Option<DaemonConnection>> {
        if !self.pause(self.config.reconnect_grace).await {
            return Ok(None);
        }

        let attempts = self.config.reconnect_attempts;
        for attempt in 1..=attempts {
            self.set_state(ClientState::Reconnecting { attempt });

            match self.connect_and_register().await {
                Ok(connection) => return Ok(Some(connection)),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Reconnect attempt failed");
                }
            }

            if attempt < attempts && !self.pause(self.config.reconnect_delay).await {
                return Ok(None);
            }
        }

        Err(NodeError::ReconnectExhausted { attempts })
    }

    /// Sleeps unless cancelled first. Returns false on cancellation.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel_token.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    async fn shutdown(&mut self, mut connection: DaemonConnection) {
        self.set_state(ClientState::Unregistering);

        if let Err(e) = self.flush_reports(&mut connection).await {
            debug!(error = %e, "Failed to flush reports before unregistering");
        }
        match connection.unregister(self.config.request_timeout).await {
            Ok(()) => info!("Unregistered from dispatcher"),
            Err(e) => warn!(error = %e, "Failed to unregister, dispatcher will sweep the session"),
        }

        connection.close().await;
        self.set_state(ClientState::Disconnected);
    }
}
