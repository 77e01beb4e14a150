//! Per-session inboxes for pin commands and schedule operations.
//!
//! Each inbox is a single-slot channel. A submitter parks its item in the
//! slot and then waits until a poll takes it: the item is only considered
//! handed over once the poll side calls [`Pending::accept`]. Submitters
//! waiting for the slot are served in arrival order.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};

use pinrelay_core::{ActionBatch, PinCommand, ScheduleOperation};

/// Slots per inbox.
const INBOX_CAPACITY: usize = 1;

/// An item waiting in an inbox together with its hand-over acknowledgement.
#[derive(Debug)]
pub struct Delivery<T> {
    item: T,
    ack: oneshot::Sender<()>,
}

impl<T> Delivery<T> {
    pub fn item(&self) -> &T {
        &self.item
    }

    /// Takes the item and releases the waiting submitter.
    pub fn accept(self) -> T {
        // The submitter may have given up; the item is still ours.
        let _ = self.ack.send(());
        self.item
    }
}

/// The inbox was dropped (session removed) before the item was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("inbox closed before the item was taken")]
pub struct Undelivered;

/// Sending side of a session's inboxes. Cheap to clone.
#[derive(Debug, Clone)]
pub struct InboxSender {
    actions: mpsc::Sender<Delivery<PinCommand>>,
    schedule_ops: mpsc::Sender<Delivery<ScheduleOperation>>,
}

impl InboxSender {
    /// Queues a pin command and waits until a poll takes it.
    pub async fn deliver_action(&self, command: PinCommand) -> Result<(), Undelivered> {
        deliver(&self.actions, command).await
    }

    /// Queues a schedule operation and waits until a poll takes it.
    pub async fn deliver_schedule_operation(
        &self,
        operation: ScheduleOperation,
    ) -> Result<(), Undelivered> {
        deliver(&self.schedule_ops, operation).await
    }
}

async fn deliver<T>(slot: &mpsc::Sender<Delivery<T>>, item: T) -> Result<(), Undelivered> {
    let (ack, acked) = oneshot::channel();
    slot.send(Delivery { item, ack })
        .await
        .map_err(|_| Undelivered)?;
    acked.await.map_err(|_| Undelivered)
}

/// Something a poll took out of an inbox, not yet acknowledged.
///
/// Dropping it without [`Pending::accept`] tells the submitter the
/// item never reached its node.
#[derive(Debug)]
pub enum Pending {
    Command(Delivery<PinCommand>),
    ScheduleOperation(Delivery<ScheduleOperation>),
}

impl Pending {
    /// The batch to send to the node.
    pub fn batch(&self) -> ActionBatch {
        match self {
            Self::Command(delivery) => ActionBatch::command(delivery.item().clone()),
            Self::ScheduleOperation(delivery) => {
                ActionBatch::schedule_operation(delivery.item().clone())
            }
        }
    }

    pub fn accept(self) -> ActionBatch {
        match self {
            Self::Command(delivery) => ActionBatch::command(delivery.accept()),
            Self::ScheduleOperation(delivery) => ActionBatch::schedule_operation(delivery.accept()),
        }
    }
}

/// Receiving side of a session's inboxes.
#[derive(Debug)]
pub struct Inbox {
    actions: mpsc::Receiver<Delivery<PinCommand>>,
    schedule_ops: mpsc::Receiver<Delivery<ScheduleOperation>>,
}

impl Inbox {
    /// Waits for the next item from either inbox; pin commands first.
    ///
    /// Cancel safe: nothing is lost if the future is dropped. Never
    /// resolves once every sender is gone.
    pub async fn next(&mut self) -> Pending {
        tokio::select! {
            biased;
            Some(delivery) = self.actions.recv() => Pending::Command(delivery),
            Some(delivery) = self.schedule_ops.recv() => Pending::ScheduleOperation(delivery),
            else => std::future::pending().await,
        }
    }
}

/// Receivers shared between the registry and whichever poll holds them.
pub type SharedInbox = Arc<Mutex<Inbox>>;

/// Creates the inbox pair for a new session.
pub fn inbox() -> (InboxSender, SharedInbox) {
    let (actions_tx, actions_rx) = mpsc::channel(INBOX_CAPACITY);
    let (schedule_tx, schedule_rx) = mpsc::channel(INBOX_CAPACITY);
    (
        InboxSender {
            actions: actions_tx,
            schedule_ops: schedule_tx,
        },
        Arc::new(Mutex::new(Inbox {
            actions: actions_rx,
            schedule_ops: schedule_rx,
        })),
    )
}
