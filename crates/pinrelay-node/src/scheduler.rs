//! Daily pin scheduler.
//!
//! One task owns the [`ScheduleQueue`]. Each turn it takes the earliest
//! entry "in hand" and waits for whichever comes first:
//!
//! ```text
//!   in-hand fire time ──▶ Wake::Fire       apply, reschedule if repeating
//!   operation channel ──▶ Wake::Mutate(op) create/remove, push in-hand back
//!   cancellation      ──▶ Wake::Cancelled  exit, queue is not persisted
//! ```
//!
//! A `Remove` is checked against the in-hand entry first, so a command
//! removed just before its fire time never fires.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Closed channels end the task or disable the branch they feed

use chrono::Local;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pinrelay_core::{ScheduleOperation, ScheduleQueue, ScheduledCommand, TextMessage};

use crate::dispatch::LocalDispatch;
use crate::error::{NodeError, Result};

/// Pending mutations; the sender waits when the scheduler falls behind.
const OPERATION_BUFFER: usize = 32;

/// What ended a wait.
#[derive(Debug)]
enum Wake {
    Fire,
    Mutate(ScheduleOperation),
    /// Every handle is gone; keep firing without mutations
    HandlesDropped,
    Cancelled,
}

/// Acknowledgement text for a schedule mutation.
pub fn acknowledgement(operation: &str, entry: &ScheduledCommand, done: bool) -> String {
    match (operation, done) {
        ("create", _) => format!("Scheduled action {entry} added"),
        (_, true) => format!("Scheduled action {entry} removed"),
        (_, false) => format!("Scheduled action {entry} did not exist"),
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle for submitting operations and reading the schedule.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    operations: mpsc::Sender<ScheduleOperation>,
    snapshot: watch::Receiver<Vec<ScheduledCommand>>,
}

impl SchedulerHandle {
    /// Hands a create/remove to the scheduler.
    pub async fn submit(&self, operation: ScheduleOperation) -> Result<()> {
        self.operations
            .send(operation)
            .await
            .map_err(|_| NodeError::SchedulerStopped)
    }

    /// Pending entries, earliest first, as of the last scheduler turn.
    pub fn snapshot(&self) -> Vec<ScheduledCommand> {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified after every scheduler turn.
    pub fn watch(&self) -> watch::Receiver<Vec<ScheduledCommand>> {
        self.snapshot.clone()
    }
}

/// Starts the scheduler with `initial` entries, each rolled forward past now.
pub fn spawn_scheduler(
    initial: Vec<ScheduledCommand>,
    dispatch: LocalDispatch,
    cancel_token: CancellationToken,
) -> (SchedulerHandle, JoinHandle<()>) {
    let now = Local::now();
    let queue: ScheduleQueue = initial
        .into_iter()
        .map(|entry| entry.normalized(now))
        .collect();

    let (operations_tx, operations_rx) = mpsc::channel(OPERATION_BUFFER);
    let (snapshot_tx, snapshot_rx) = watch::channel(queue.snapshot());

    let scheduler = Scheduler {
        queue,
        operations: operations_rx,
        snapshot: snapshot_tx,
        dispatch,
        cancel_token,
    };
    let task = tokio::spawn(scheduler.run());

    (
        SchedulerHandle {
            operations: operations_tx,
            snapshot: snapshot_rx,
        },
        task,
    )
}

// ============================================================================
// Scheduler task
// ============================================================================

struct Scheduler {
    queue: ScheduleQueue,
    operations: mpsc::Receiver<ScheduleOperation>,
    snapshot: watch::Sender<Vec<ScheduledCommand>>,
    dispatch: LocalDispatch,
    cancel_token: CancellationToken,
}

impl Scheduler {
    async fn run(mut self) {
        info!(entries = self.queue.len(), "Scheduler started");
        let mut operations_open = true;

        loop {
            self.snapshot.send_replace(self.queue.snapshot());

            let in_hand = self.queue.pop_earliest();
            let wait = in_hand.as_ref().map(|entry| {
                (entry.fire_at - Local::now())
                    .to_std()
                    .unwrap_or_default()
            });

            let wake = tokio::select! {
                biased;

                _ = self.cancel_token.cancelled() => Wake::Cancelled,

                op = self.operations.recv(), if operations_open => match op {
                    Some(op) => Wake::Mutate(op),
                    None => Wake::HandlesDropped,
                },

                _ = sleep(wait.unwrap_or_default()), if wait.is_some() => Wake::Fire,
            };

            match wake {
                Wake::Fire => {
                    if let Some(entry) = in_hand {
                        self.fire(entry);
                    }
                }
                Wake::Mutate(op) => {
                    if let Some(entry) = self.mutate(op, in_hand) {
                        self.queue.push(entry);
                    }
                }
                Wake::HandlesDropped => {
                    debug!("All scheduler handles dropped");
                    operations_open = false;
                    if let Some(entry) = in_hand {
                        self.queue.push(entry);
                    }
                }
                Wake::Cancelled => {
                    info!(
                        dropped = self.queue.len() + usize::from(in_hand.is_some()),
                        "Scheduler stopped"
                    );
                    return;
                }
            }
        }
    }

    fn fire(&mut self, entry: ScheduledCommand) {
        debug!(entry = %entry, "Scheduled action due");
        self.dispatch.apply(&entry.command);

        if entry.repeat_daily {
            let next = entry.rescheduled(Local::now());
            debug!(next = %next.fire_at, "Rescheduled repeating action");
            self.queue.push(next);
        }
    }

    /// Applies a mutation. Returns the in-hand entry if it is still scheduled.
    fn mutate(
        &mut self,
        op: ScheduleOperation,
        in_hand: Option<ScheduledCommand>,
    ) -> Option<ScheduledCommand> {
        let origin = op.origin_id();
        let kind = op.kind();

        let (text, in_hand) = match op {
            ScheduleOperation::Create(entry) => {
                let entry = entry.normalized(Local::now());
                let text = acknowledgement(kind, &entry, true);
                self.queue.push(entry);
                (text, in_hand)
            }
            ScheduleOperation::Remove(entry) => {
                let (removed, in_hand) = match in_hand {
                    Some(held) if held.matches(&entry) => (true, None),
                    other => (self.queue.remove_matching(&entry), other),
                };
                (acknowledgement(kind, &entry, removed), in_hand)
            }
            ScheduleOperation::List => {
                warn!("List operations are answered by the dispatcher, ignoring");
                return in_hand;
            }
        };

        info!(operation = kind, "{text}");
        if origin != 0 {
            self.dispatch.report(TextMessage::new(origin, text));
        }
        in_hand
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::DateTime;
    use pinrelay_core::{Actuator, PinCommand, TimeOfDay};
    use tokio::time::timeout;

    use crate::dispatch::{report_channel, ReportReceiver};

    /// Forwards every applied command to the test.
    struct ChannelActuator(mpsc::UnboundedSender<(String, bool)>);

    impl Actuator for ChannelActuator {
        fn apply(&self, pin: &str, state: bool) -> bool {
            let _ = self.0.send((pin.to_string(), state));
            true
        }
    }

    struct Harness {
        handle: SchedulerHandle,
        task: JoinHandle<()>,
        applied: mpsc::UnboundedReceiver<(String, bool)>,
        reports: ReportReceiver,
        cancel_token: CancellationToken,
    }

    fn start(initial: Vec<ScheduledCommand>) -> Harness {
        let (applied_tx, applied) = mpsc::unbounded_channel();
        let (reports_tx, reports) = report_channel();
        let dispatch = LocalDispatch::new(Arc::new(ChannelActuator(applied_tx)), reports_tx);
        let cancel_token = CancellationToken::new();
        let (handle, task) = spawn_scheduler(initial, dispatch, cancel_token.clone());
        Harness {
            handle,
            task,
            applied,
            reports,
            cancel_token,
        }
    }

    fn due_in(pin: &str, state: bool, delay: chrono::Duration, repeat: bool) -> ScheduledCommand {
        ScheduledCommand {
            command: PinCommand::new(pin, state),
            fire_at: Local::now() + delay,
            repeat_daily: repeat,
        }
    }

    fn at(pin: &str, state: bool, hour: u32, origin: i64) -> ScheduledCommand {
        ScheduledCommand::at_time_of_day(
            PinCommand::new(pin, state).with_origin(origin),
            TimeOfDay::from_hms(hour, 0, 0).unwrap(),
            true,
            Local::now(),
        )
    }

    async fn wait_for_snapshot(
        handle: &SchedulerHandle,
        done: impl Fn(&[ScheduledCommand]) -> bool,
    ) -> Vec<ScheduledCommand> {
        let mut watch = handle.watch();
        timeout(Duration::from_secs(2), async {
            loop {
                let snapshot = watch.borrow_and_update().clone();
                if done(&snapshot) {
                    return snapshot;
                }
                watch.changed().await.unwrap();
            }
        })
        .await
        .expect("snapshot in time")
    }

    #[tokio::test]
    async fn test_only_future_entry_fires() {
        let mut h = start(vec![
            due_in("light", true, chrono::Duration::milliseconds(300), true),
            due_in("light", false, chrono::Duration::minutes(-10), false),
        ]);

        // The past entry was rolled to tomorrow instead of firing now
        let first = timeout(Duration::from_secs(2), h.applied.recv())
            .await
            .expect("fired in time")
            .unwrap();
        assert_eq!(first, ("light".to_string(), true));

        let tomorrow = Local::now() + chrono::Duration::hours(23);
        let snapshot =
            wait_for_snapshot(&h.handle, |s| s.iter().all(|e| e.fire_at > tomorrow)).await;
        assert_eq!(snapshot.len(), 2);

        assert!(timeout(Duration::from_millis(300), h.applied.recv())
            .await
            .is_err());
        h.cancel_token.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_fires_in_deadline_order() {
        let mut h = start(vec![
            due_in("b", true, chrono::Duration::milliseconds(300), false),
            due_in("a", true, chrono::Duration::milliseconds(150), false),
            due_in("c", true, chrono::Duration::milliseconds(450), false),
        ]);

        let mut order = Vec::new();
        for _ in 0..3 {
            let (pin, _) = timeout(Duration::from_secs(2), h.applied.recv())
                .await
                .expect("fired in time")
                .unwrap();
            order.push(pin);
        }
        assert_eq!(order, vec!["a", "b", "c"]);

        wait_for_snapshot(&h.handle, |s| s.is_empty()).await;
        h.cancel_token.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_repeating_entry_rescheduled_a_day_after_firing() {
        let entry = due_in("light", true, chrono::Duration::milliseconds(100), true);
        let scheduled_at = entry.fire_at;
        let mut h = start(vec![entry]);

        timeout(Duration::from_secs(2), h.applied.recv())
            .await
            .expect("fired in time")
            .unwrap();
        let fired_by: DateTime<Local> = Local::now();

        let snapshot =
            wait_for_snapshot(&h.handle, |s| s.len() == 1 && s[0].fire_at > scheduled_at).await;
        let next = snapshot[0].fire_at;
        assert!(next >= scheduled_at + chrono::Duration::hours(24));
        assert!(next < fired_by + chrono::Duration::hours(24) + chrono::Duration::seconds(1));
        assert!(snapshot[0].repeat_daily);

        h.cancel_token.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_create_normalizes_and_acknowledges() {
        let mut h = start(Vec::new());
        let mut entry = at("fan", true, 6, 5);
        entry.fire_at -= chrono::Duration::days(2);

        h.handle
            .submit(ScheduleOperation::Create(entry))
            .await
            .unwrap();

        let report = timeout(Duration::from_secs(2), h.reports.recv())
            .await
            .expect("ack in time")
            .unwrap();
        assert_eq!(report.chat_id, 5);
        assert_eq!(report.text, "Scheduled action fan;true;true;06:00:00 added");

        let snapshot = wait_for_snapshot(&h.handle, |s| s.len() == 1).await;
        assert!(snapshot[0].fire_at > Local::now());

        h.cancel_token.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_ignores_date_and_repeat() {
        let mut h = start(vec![at("light", true, 8, 0), at("light", false, 22, 0)]);

        let mut removal = at("light", true, 8, 9);
        removal.repeat_daily = false;
        removal.fire_at += chrono::Duration::days(3);
        h.handle
            .submit(ScheduleOperation::Remove(removal))
            .await
            .unwrap();

        let report = timeout(Duration::from_secs(2), h.reports.recv())
            .await
            .expect("ack in time")
            .unwrap();
        assert_eq!(report.chat_id, 9);
        assert!(report.text.ends_with("removed"), "got {}", report.text);

        let snapshot = wait_for_snapshot(&h.handle, |s| s.len() == 1).await;
        assert!(!snapshot[0].command.state);

        h.cancel_token.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_in_hand_entry_never_fires() {
        let mut h = start(vec![due_in(
            "light",
            true,
            chrono::Duration::milliseconds(600),
            true,
        )]);
        let in_hand = h.handle.snapshot();
        assert_eq!(in_hand.len(), 1);

        let removal = ScheduledCommand {
            command: in_hand[0].command.clone().with_origin(3),
            ..in_hand[0].clone()
        };
        h.handle
            .submit(ScheduleOperation::Remove(removal))
            .await
            .unwrap();

        let report = timeout(Duration::from_secs(2), h.reports.recv())
            .await
            .expect("ack in time")
            .unwrap();
        assert!(report.text.ends_with("removed"), "got {}", report.text);

        // Past the original fire time, nothing was applied
        assert!(timeout(Duration::from_secs(1), h.applied.recv())
            .await
            .is_err());
        assert!(h.handle.snapshot().is_empty());

        h.cancel_token.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_missing_entry() {
        let mut h = start(vec![at("light", true, 8, 0)]);

        h.handle
            .submit(ScheduleOperation::Remove(at("light", true, 9, 4)))
            .await
            .unwrap();

        let report = timeout(Duration::from_secs(2), h.reports.recv())
            .await
            .expect("ack in time")
            .unwrap();
        assert_eq!(
            report.text,
            "Scheduled action light;true;true;09:00:00 did not exist"
        );
        // The in-hand entry went back into the queue next to the new one
        h.handle
            .submit(ScheduleOperation::Create(at("fan", true, 10, 0)))
            .await
            .unwrap();
        let snapshot = wait_for_snapshot(&h.handle, |s| s.len() == 2).await;
        assert!(snapshot.iter().any(|e| e.pin() == "light"));

        h.cancel_token.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_mutation_without_origin_is_not_acknowledged() {
        let mut h = start(Vec::new());
        h.handle
            .submit(ScheduleOperation::Create(at("fan", false, 12, 0)))
            .await
            .unwrap();

        wait_for_snapshot(&h.handle, |s| s.len() == 1).await;
        assert!(h.reports.try_recv().is_err());

        h.cancel_token.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_scheduler() {
        let h = start(Vec::new());
        h.cancel_token.cancel();
        timeout(Duration::from_secs(1), h.task)
            .await
            .expect("stopped in time")
            .unwrap();

        assert!(matches!(
            h.handle
                .submit(ScheduleOperation::Create(at("fan", true, 1, 0)))
                .await,
            Err(NodeError::SchedulerStopped)
        ));
    }

    #[test]
    fn test_acknowledgement_texts() {
        let entry = at("pump", false, 7, 0);
        assert_eq!(
            acknowledgement("remove", &entry, false),
            "Scheduled action pump;false;true;07:00:00 did not exist"
        );
        assert!(acknowledgement("create", &entry, true).ends_with("added"));
    }
}
