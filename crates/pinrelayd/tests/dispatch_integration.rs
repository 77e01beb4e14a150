//! Integration tests for the dispatcher: routing, rendezvous submissions
//! and long polls.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::sync::Arc;
use std::time::Duration;

use pinrelay_core::{
    Actuator, PinCommand, PinRegistry, RegistrationRequest, RegistrationStatus,
    ScheduleOperation, ScheduledCommand, SessionId, SimulatedActuator, TimeOfDay,
};
use pinrelayd::dispatch::{DispatchConfig, DispatchError, Dispatcher, ScheduleSubmission};
use pinrelayd::registry::{spawn_registry, RegistryConfig};
use tokio::time::{sleep, Instant};

// ============================================================================
// Test Helpers
// ============================================================================

/// Lets spawned submitters reach their inbox before the next one starts.
const SETTLE: Duration = Duration::from_millis(20);

fn dispatcher(poll_timeout: Duration) -> Dispatcher {
    let registry = spawn_registry(RegistryConfig {
        cleanup_interval: None,
        ..RegistryConfig::default()
    });
    Dispatcher::new(registry, DispatchConfig { poll_timeout })
}

async fn register(dispatcher: &Dispatcher, pins: &[&str]) -> SessionId {
    let result = dispatcher
        .register(RegistrationRequest::new(
            pins.iter().map(|p| p.to_string()).collect(),
            Vec::new(),
        ))
        .await
        .unwrap();
    assert!(result.is_ok(), "registration failed: {result:?}");
    result.session_id.unwrap()
}

fn submit(
    dispatcher: &Dispatcher,
    command: PinCommand,
) -> tokio::task::JoinHandle<Result<SessionId, DispatchError>> {
    let dispatcher = dispatcher.clone();
    tokio::spawn(async move { dispatcher.submit_action(command).await })
}

/// Polls once and hands the command over, as a connection does after
/// writing the batch.
async fn poll_command(dispatcher: &Dispatcher, id: &SessionId) -> Option<PinCommand> {
    let pending = dispatcher.check_for_actions(id).await.unwrap()?;
    pending.accept().command
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_same_pin_from_two_identities() {
    let dispatcher = dispatcher(Duration::from_millis(100));
    register(&dispatcher, &["light"]).await;

    let second = dispatcher
        .register(RegistrationRequest::new(vec!["light".to_string()], Vec::new()))
        .await
        .unwrap();
    assert_eq!(second.status, RegistrationStatus::PinAlreadyRegistered);
    assert_eq!(second.conflicting_pins, vec!["light"]);
}

// ============================================================================
// Command delivery
// ============================================================================

#[tokio::test]
async fn test_command_reaches_node_and_pin_state() {
    let dispatcher = dispatcher(Duration::from_secs(2));
    let id = register(&dispatcher, &["light"]).await;

    let pins = Arc::new(PinRegistry::new(["light"]));
    let actuator = SimulatedActuator::new(Arc::clone(&pins));

    let submitted = submit(&dispatcher, PinCommand::new("light", true));
    let command = poll_command(&dispatcher, &id).await.expect("command");
    assert!(actuator.apply_command(&command));

    assert_eq!(submitted.await.unwrap(), Ok(id));
    assert_eq!(pins.get("light"), Some(true));
}

#[tokio::test]
async fn test_commands_delivered_in_submission_order() {
    let dispatcher = dispatcher(Duration::from_secs(2));
    let id = register(&dispatcher, &["light", "fan"]).await;

    let first = submit(&dispatcher, PinCommand::new("light", true));
    sleep(SETTLE).await;
    let second = submit(&dispatcher, PinCommand::new("fan", true));
    sleep(SETTLE).await;
    let third = submit(&dispatcher, PinCommand::new("light", false));
    sleep(SETTLE).await;

    let mut received = Vec::new();
    for _ in 0..3 {
        let command = poll_command(&dispatcher, &id).await.expect("command");
        received.push((command.pin, command.state));
    }

    assert_eq!(
        received,
        vec![
            ("light".to_string(), true),
            ("fan".to_string(), true),
            ("light".to_string(), false),
        ]
    );
    for task in [first, second, third] {
        assert!(task.await.unwrap().is_ok());
    }
}

#[tokio::test]
async fn test_commands_for_other_node_not_delivered() {
    let dispatcher = dispatcher(Duration::from_millis(100));
    let light_node = register(&dispatcher, &["light"]).await;
    let fan_node = register(&dispatcher, &["fan"]).await;

    let submitted = submit(&dispatcher, PinCommand::new("fan", true));
    sleep(SETTLE).await;

    assert!(dispatcher
        .check_for_actions(&light_node)
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        poll_command(&dispatcher, &fan_node).await.map(|c| c.pin),
        Some("fan".to_string())
    );
    assert_eq!(submitted.await.unwrap(), Ok(fan_node));
}

#[tokio::test]
async fn test_unknown_pin_rejected() {
    let dispatcher = dispatcher(Duration::from_millis(100));
    register(&dispatcher, &["light"]).await;

    let err = dispatcher
        .submit_action(PinCommand::new("garage", true))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Pin does not exist: garage");
}

#[tokio::test]
async fn test_unregister_releases_waiting_submitter() {
    let dispatcher = dispatcher(Duration::from_millis(100));
    let id = register(&dispatcher, &["light"]).await;

    let submitted = submit(&dispatcher, PinCommand::new("light", true));
    sleep(SETTLE).await;
    dispatcher.unregister(id).await.unwrap();

    assert_eq!(
        submitted.await.unwrap(),
        Err(DispatchError::ClientGone {
            pin: "light".to_string()
        })
    );
}

#[tokio::test]
async fn test_dropped_poll_result_reports_client_gone() {
    let dispatcher = dispatcher(Duration::from_secs(2));
    let id = register(&dispatcher, &["light"]).await;

    let submitted = submit(&dispatcher, PinCommand::new("light", true));
    let pending = dispatcher.check_for_actions(&id).await.unwrap();
    assert!(pending.is_some());
    // Batch never reached the node
    drop(pending);

    assert!(matches!(
        submitted.await.unwrap(),
        Err(DispatchError::ClientGone { .. })
    ));
}

// ============================================================================
// Long-poll timeouts
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_repeated_empty_polls_stay_within_timeout() {
    let timeout = Duration::from_secs(2);
    let dispatcher = dispatcher(timeout);
    let id = register(&dispatcher, &["light"]).await;

    for _ in 0..5 {
        let started = Instant::now();
        let pending = dispatcher.check_for_actions(&id).await.unwrap();
        assert!(pending.is_none());
        let elapsed = started.elapsed();
        assert!(elapsed >= timeout && elapsed < timeout + Duration::from_millis(100));
    }

    // Polling kept the session alive
    assert_eq!(dispatcher.active_pins().await, vec!["light"]);
}

#[tokio::test(start_paused = true)]
async fn test_command_after_timed_out_poll_is_kept() {
    let dispatcher = dispatcher(Duration::from_secs(2));
    let id = register(&dispatcher, &["light"]).await;

    assert!(dispatcher.check_for_actions(&id).await.unwrap().is_none());

    let submitted = submit(&dispatcher, PinCommand::new("light", false));
    sleep(Duration::from_millis(500)).await;
    assert_eq!(
        poll_command(&dispatcher, &id).await.map(|c| c.state),
        Some(false)
    );
    assert!(submitted.await.unwrap().is_ok());
}

// ============================================================================
// Schedule operations
// ============================================================================

fn entry(pin: &str) -> ScheduledCommand {
    ScheduledCommand::at_time_of_day(
        PinCommand::new(pin, true).with_origin(77),
        TimeOfDay::from_hms(8, 0, 0).unwrap(),
        false,
        chrono::Local::now(),
    )
}

#[tokio::test]
async fn test_create_for_unowned_pin_rejected() {
    let dispatcher = dispatcher(Duration::from_millis(100));
    register(&dispatcher, &["light"]).await;

    let err = dispatcher
        .submit_schedule_operation(ScheduleOperation::Create(entry("garage")))
        .await
        .unwrap_err();
    assert_eq!(err, DispatchError::PinNotFound("garage".to_string()));
    assert!(dispatcher.list_schedule().await.is_empty());
}

#[tokio::test]
async fn test_schedule_operation_delivered_to_owner() {
    let dispatcher = dispatcher(Duration::from_secs(2));
    let id = register(&dispatcher, &["light"]).await;

    let submitter = dispatcher.clone();
    let submitted = tokio::spawn(async move {
        submitter
            .submit_schedule_operation(ScheduleOperation::Create(entry("light")))
            .await
    });

    let pending = dispatcher.check_for_actions(&id).await.unwrap().unwrap();
    let batch = pending.accept();
    assert!(batch.command.is_none());
    match batch.schedule_operation {
        Some(ScheduleOperation::Create(entry)) => {
            assert_eq!(entry.pin(), "light");
            assert_eq!(entry.command.origin_id, 77);
        }
        other => panic!("Expected Create, got {other:?}"),
    }

    assert!(matches!(
        submitted.await.unwrap(),
        Ok(ScheduleSubmission::Delivered(owner)) if owner == id
    ));
    assert_eq!(dispatcher.list_schedule().await.len(), 1);
}

#[tokio::test]
async fn test_undelivered_schedule_operation_leaves_cache() {
    let dispatcher = dispatcher(Duration::from_secs(2));
    let id = register(&dispatcher, &["light"]).await;

    let submitter = dispatcher.clone();
    let submitted = tokio::spawn(async move {
        submitter
            .submit_schedule_operation(ScheduleOperation::Create(entry("light")))
            .await
    });

    // The write to the node failed: the poll drops the item unaccepted
    let pending = dispatcher.check_for_actions(&id).await.unwrap().unwrap();
    drop(pending);

    assert_eq!(
        submitted.await.unwrap().unwrap_err(),
        DispatchError::ClientGone {
            pin: "light".to_string()
        }
    );
    assert!(dispatcher.list_schedule().await.is_empty());
}

#[tokio::test]
async fn test_commands_polled_before_schedule_operations() {
    let dispatcher = dispatcher(Duration::from_secs(2));
    let id = register(&dispatcher, &["light"]).await;

    let submitter = dispatcher.clone();
    let schedule = tokio::spawn(async move {
        submitter
            .submit_schedule_operation(ScheduleOperation::Create(entry("light")))
            .await
    });
    let command = submit(&dispatcher, PinCommand::new("light", true));
    sleep(SETTLE).await;

    let first = dispatcher.check_for_actions(&id).await.unwrap().unwrap().accept();
    assert!(first.command.is_some());
    let second = dispatcher.check_for_actions(&id).await.unwrap().unwrap().accept();
    assert!(second.schedule_operation.is_some());

    assert!(command.await.unwrap().is_ok());
    assert!(schedule.await.unwrap().is_ok());
}
