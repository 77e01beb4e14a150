//! Session registry using Actor pattern.
//!
//! The registry is the single serialization point for node sessions: pin
//! ownership, last contact, in-flight polls, inboxes and cached schedules.
//! It receives commands via a tokio mpsc channel and publishes node
//! registrations and removals on a broadcast channel.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │   Dispatcher    │────▶│  RegistryActor  │────▶│ Broadcast Channel│
//! └─────────────────┘     └─────────────────┘     └──────────────────┘
//!         │                       │                       │
//!         │   RegistryCommand     │   SessionEvent        │
//!         │   (mpsc channel)      │   (broadcast)         │
//!         ▼                       ▼                       ▼
//!    Register/Route/        BTreeMap<SessionId,      Subscribed
//!    Poll begin+end         ClientSession>           control clients
//! ```
//!
//! Long-poll waits happen outside the actor, on the session's
//! [`SharedInbox`], so the actor never blocks.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::debug;

mod actor;
mod commands;
mod handle;
mod inbox;

pub use actor::{RegistryActor, MAX_SESSIONS, STALE_THRESHOLD};
pub use commands::{RegistryCommand, RegistryError, RemovalReason, SessionEvent};
pub use handle::RegistryHandle;
pub use inbox::{Delivery, Inbox, InboxSender, Pending, SharedInbox, Undelivered};

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Default interval between periodic sweeps.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(2);

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Idle time after which a session without a poll in flight is removed.
    pub stale_threshold: Duration,

    /// Period of the background sweep; `None` leaves sweeping to
    /// registrations and active-pin queries.
    pub cleanup_interval: Option<Duration>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            stale_threshold: STALE_THRESHOLD,
            cleanup_interval: Some(CLEANUP_INTERVAL),
        }
    }
}

/// Spawn the registry actor and return a handle for interaction.
///
/// This function:
/// 1. Creates command and event channels
/// 2. Spawns the RegistryActor on a tokio task
/// 3. Spawns a background cleanup task (if configured)
/// 4. Returns a RegistryHandle for client use
///
/// The actor stops once every handle is dropped.
///
/// # Example
///
/// ```no_run
/// use pinrelayd::registry::{spawn_registry, RegistryConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let handle = spawn_registry(RegistryConfig::default());
///     let pins = handle.active_pins().await;
/// }
/// ```
pub fn spawn_registry(config: RegistryConfig) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = RegistryActor::new(cmd_rx, event_tx.clone(), config.stale_threshold);
    tokio::spawn(actor.run());

    if let Some(period) = config.cleanup_interval {
        spawn_cleanup_task(cmd_tx.downgrade(), period);
    }

    RegistryHandle::new(cmd_tx, event_tx)
}

/// Spawn a background task that triggers periodic stale session cleanup.
///
/// Holds only a weak sender so it does not keep the actor alive.
fn spawn_cleanup_task(sender: mpsc::WeakSender<RegistryCommand>, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = interval(period);

        loop {
            ticker.tick().await;

            let Some(sender) = sender.upgrade() else {
                debug!("Cleanup task stopping: registry dropped");
                break;
            };
            if sender.send(RegistryCommand::CleanupStale).await.is_err() {
                debug!("Cleanup task stopping: registry channel closed");
                break;
            }
        }
    });
}
