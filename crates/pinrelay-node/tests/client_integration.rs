//! Integration tests for the node: a real dispatcher on an ephemeral port,
//! or a scripted one for failure cases.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use pinrelay_core::{
    PinCommand, PinRegistry, RegistrationResult, ScheduleOperation, ScheduledCommand, SessionId,
    SimulatedActuator,
};
use pinrelay_node::{
    report_channel, run_node, spawn_scheduler, ClientConfig, ClientState, LocalDispatch,
    NodeConfig, NodeError, ReconnectingClient, SchedulerHandle,
};
use pinrelay_protocol::{ClientMessage, DaemonMessage, MessageType};
use pinrelayd::chat::ChatInterpreter;
use pinrelayd::dispatch::{DispatchConfig, Dispatcher, ScheduleSubmission};
use pinrelayd::registry::{spawn_registry, RegistryConfig, RemovalReason, SessionEvent};
use pinrelayd::server::DaemonServer;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Helpers
// ============================================================================

const DAEMON_POLL_TIMEOUT: Duration = Duration::from_millis(200);

fn fast_client() -> ClientConfig {
    ClientConfig {
        connect_timeout: Duration::from_millis(500),
        reconnect_grace: Duration::from_millis(100),
        reconnect_delay: Duration::from_millis(100),
        reconnect_attempts: 3,
        request_timeout: Duration::from_secs(1),
        poll_timeout: Duration::from_secs(5),
    }
}

/// Polls `check` until it holds or two seconds pass.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

struct TestDaemon {
    addr: SocketAddr,
    dispatcher: Dispatcher,
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl TestDaemon {
    async fn spawn() -> Self {
        Self::spawn_on(SocketAddr::from(([127, 0, 0, 1], 0))).await
    }

    async fn spawn_on(addr: SocketAddr) -> Self {
        let registry = spawn_registry(RegistryConfig {
            cleanup_interval: None,
            ..RegistryConfig::default()
        });
        let dispatcher = Dispatcher::new(
            registry,
            DispatchConfig {
                poll_timeout: DAEMON_POLL_TIMEOUT,
            },
        );
        let chat = ChatInterpreter::new(dispatcher.clone(), Vec::new());
        let cancel_token = CancellationToken::new();

        let server = DaemonServer::bind(addr, dispatcher.clone(), chat, cancel_token.clone())
            .await
            .expect("bind dispatcher");
        let addr = server.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let _ = server.run().await;
        });

        Self {
            addr,
            dispatcher,
            cancel_token,
            task,
        }
    }

    fn server(&self) -> String {
        self.addr.to_string()
    }

    async fn stop(self) {
        self.cancel_token.cancel();
        timeout(Duration::from_secs(5), self.task)
            .await
            .expect("dispatcher stops")
            .unwrap();
    }
}

struct TestNode {
    pins: Arc<PinRegistry>,
    scheduler: SchedulerHandle,
    state: watch::Receiver<ClientState>,
    client: JoinHandle<Result<(), NodeError>>,
    cancel_token: CancellationToken,
}

async fn start_node(
    server: &str,
    pins: &[&str],
    config: ClientConfig,
    initial: Vec<ScheduledCommand>,
) -> Result<TestNode, NodeError> {
    let registry = Arc::new(PinRegistry::new(pins.iter().copied()));
    let (reports_tx, reports_rx) = report_channel();
    let dispatch = LocalDispatch::new(
        Arc::new(SimulatedActuator::new(Arc::clone(&registry))),
        reports_tx,
    );
    let cancel_token = CancellationToken::new();
    let (scheduler, _scheduler_task) =
        spawn_scheduler(initial, dispatch.clone(), cancel_token.child_token());

    let client = ReconnectingClient::start(
        server,
        pins.iter().map(|p| p.to_string()).collect(),
        config,
        dispatch,
        scheduler.clone(),
        reports_rx,
        cancel_token.clone(),
    )
    .await?;
    let state = client.state();

    Ok(TestNode {
        pins: registry,
        scheduler,
        state,
        client: tokio::spawn(client.run()),
        cancel_token,
    })
}

impl TestNode {
    async fn stop(self) -> Result<(), NodeError> {
        self.cancel_token.cancel();
        timeout(Duration::from_secs(5), self.client)
            .await
            .expect("client stops")
            .unwrap()
    }
}

/// Answers the handshake and one registration, drops the connection on the
/// first poll, then accepts and drops every later connection.
async fn flaky_daemon() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let later_connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&later_connections);

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                break;
            }
            let request: ClientMessage = serde_json::from_str(&line).unwrap();
            let reply = match request.message {
                MessageType::Connect { .. } => DaemonMessage::connected("flaky".to_string()),
                MessageType::Register { .. } => DaemonMessage::registration_result(
                    RegistrationResult::ok(SessionId::new("session-1")),
                ),
                _ => break,
            };
            let json = serde_json::to_string(&reply).unwrap();
            writer.write_all(json.as_bytes()).await.unwrap();
            writer.write_all(b"\n").await.unwrap();
        }
        drop(writer);
        drop(reader);

        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }
    });

    (addr, later_connections)
}

async fn wait_for_state(
    state: &mut watch::Receiver<ClientState>,
    done: impl Fn(&ClientState) -> bool,
) {
    timeout(Duration::from_secs(2), state.wait_for(|s| done(s)))
        .await
        .expect("state in time")
        .unwrap();
}

// ============================================================================
// Startup
// ============================================================================

#[tokio::test]
async fn test_conflicting_registration_is_fatal() {
    let daemon = TestDaemon::spawn().await;
    let first = start_node(&daemon.server(), &["light"], fast_client(), Vec::new())
        .await
        .unwrap();

    let err = start_node(&daemon.server(), &["light", "fan"], fast_client(), Vec::new())
        .await
        .err()
        .expect("second registration rejected");
    match err {
        NodeError::Registration(reason) => assert!(reason.contains("light"), "got {reason}"),
        other => panic!("Expected Registration, got {other:?}"),
    }

    first.stop().await.unwrap();
    daemon.stop().await;
}

#[tokio::test]
async fn test_unreachable_dispatcher_is_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let started = Instant::now();
    let err = start_node(&addr, &["light"], fast_client(), Vec::new())
        .await
        .err()
        .expect("no dispatcher");
    assert!(matches!(
        err,
        NodeError::Connect { .. } | NodeError::ConnectTimeout(_)
    ));
    // No retries at startup
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_initial_schedule_registered() {
    let daemon = TestDaemon::spawn().await;
    let entry =
        ScheduledCommand::parse_request("light;false;true;23:15:00", 0, Local::now()).unwrap();
    let node = start_node(&daemon.server(), &["light"], fast_client(), vec![entry])
        .await
        .unwrap();

    let listed = daemon.dispatcher.list_schedule().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].to_string(), "light;false;true;23:15:00");

    node.stop().await.unwrap();
    daemon.stop().await;
}

// ============================================================================
// Polling
// ============================================================================

#[tokio::test]
async fn test_polled_command_applied_and_reported() {
    let daemon = TestDaemon::spawn().await;
    let mut messages = daemon.dispatcher.subscribe_messages();
    let node = start_node(&daemon.server(), &["light"], fast_client(), Vec::new())
        .await
        .unwrap();

    daemon
        .dispatcher
        .submit_action(PinCommand::new("light", true).with_origin(42))
        .await
        .unwrap();

    let pins = Arc::clone(&node.pins);
    eventually("light on", || {
        let pins = Arc::clone(&pins);
        async move { pins.get("light") == Some(true) }
    })
    .await;

    let report = timeout(Duration::from_secs(2), messages.recv())
        .await
        .expect("report in time")
        .unwrap();
    assert_eq!(report.chat_id, 42);
    assert_eq!(report.text, "Action light successful");

    node.stop().await.unwrap();
    daemon.stop().await;
}

#[tokio::test]
async fn test_schedule_operation_reaches_scheduler() {
    let daemon = TestDaemon::spawn().await;
    let mut messages = daemon.dispatcher.subscribe_messages();
    let node = start_node(&daemon.server(), &["light"], fast_client(), Vec::new())
        .await
        .unwrap();

    let entry =
        ScheduledCommand::parse_request("light;true;true;06:00:00", 7, Local::now()).unwrap();
    let submitted = daemon
        .dispatcher
        .submit_schedule_operation(ScheduleOperation::Create(entry))
        .await
        .unwrap();
    assert!(matches!(submitted, ScheduleSubmission::Delivered(_)));

    let scheduler = node.scheduler.clone();
    eventually("entry in node schedule", || {
        let scheduler = scheduler.clone();
        async move { scheduler.snapshot().len() == 1 }
    })
    .await;

    let ack = timeout(Duration::from_secs(2), messages.recv())
        .await
        .expect("ack in time")
        .unwrap();
    assert_eq!(ack.chat_id, 7);
    assert_eq!(ack.text, "Scheduled action light;true;true;06:00:00 added");

    node.stop().await.unwrap();
    daemon.stop().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_unregisters() {
    let daemon = TestDaemon::spawn().await;
    let mut events = daemon.dispatcher.registry().subscribe();
    let mut node = start_node(&daemon.server(), &["light"], fast_client(), Vec::new())
        .await
        .unwrap();
    wait_for_state(&mut node.state, |s| *s == ClientState::Polling).await;

    node.stop().await.unwrap();

    // Gone well before the staleness threshold could have removed it
    assert!(daemon.dispatcher.active_pins().await.is_empty());
    loop {
        match events.recv().await.unwrap() {
            SessionEvent::Registered { .. } => continue,
            SessionEvent::Removed { reason, .. } => {
                assert_eq!(reason, RemovalReason::Explicit);
                break;
            }
        }
    }

    daemon.stop().await;
}

// ============================================================================
// Reconnect
// ============================================================================

#[tokio::test]
async fn test_reconnects_after_dispatcher_restart() {
    let daemon = TestDaemon::spawn().await;
    let addr = daemon.addr;
    let config = ClientConfig {
        reconnect_grace: Duration::from_millis(300),
        // A second attempt would land well after the two-second checks below
        reconnect_delay: Duration::from_secs(5),
        ..fast_client()
    };
    let mut node = start_node(&daemon.server(), &["light"], config, Vec::new())
        .await
        .unwrap();
    wait_for_state(&mut node.state, |s| *s == ClientState::Polling).await;

    daemon.stop().await;
    let restarted = TestDaemon::spawn_on(addr).await;

    let dispatcher = restarted.dispatcher.clone();
    eventually("re-registration", || {
        let dispatcher = dispatcher.clone();
        async move { dispatcher.active_pins().await == vec!["light".to_string()] }
    })
    .await;

    restarted
        .dispatcher
        .submit_action(PinCommand::new("light", true))
        .await
        .unwrap();
    let pins = Arc::clone(&node.pins);
    eventually("light on after reconnect", || {
        let pins = Arc::clone(&pins);
        async move { pins.get("light") == Some(true) }
    })
    .await;

    node.stop().await.unwrap();
    restarted.stop().await;
}

#[tokio::test]
async fn test_gives_up_after_bounded_attempts() {
    let (addr, later_connections) = flaky_daemon().await;
    let config = fast_client();
    let started = Instant::now();
    let node = start_node(&addr, &["light"], config.clone(), Vec::new())
        .await
        .unwrap();

    let result = timeout(Duration::from_secs(5), node.client)
        .await
        .expect("client gives up")
        .unwrap();
    assert!(matches!(
        result,
        Err(NodeError::ReconnectExhausted { attempts: 3 })
    ));
    // Grace plus two delays between three attempts
    assert!(started.elapsed() >= config.reconnect_grace + config.reconnect_delay * 2);

    sleep(Duration::from_millis(300)).await;
    assert_eq!(later_connections.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_shutdown_interrupts_reconnect_wait() {
    let (addr, _) = flaky_daemon().await;
    let config = ClientConfig {
        reconnect_grace: Duration::from_millis(50),
        reconnect_delay: Duration::from_secs(10),
        reconnect_attempts: 30,
        ..fast_client()
    };
    let mut node = start_node(&addr, &["light"], config, Vec::new())
        .await
        .unwrap();
    wait_for_state(&mut node.state, |s| {
        matches!(s, ClientState::Reconnecting { .. })
    })
    .await;
    sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    node.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

// ============================================================================
// Node runtime
// ============================================================================

#[tokio::test]
async fn test_run_node_clears_pins_on_exit() {
    let daemon = TestDaemon::spawn().await;
    let config = NodeConfig::from_toml(&format!(
        "server = \"{}\"\npins = [\"light\", \"fan\"]",
        daemon.server()
    ))
    .unwrap();
    let pins = Arc::new(PinRegistry::new(["light", "fan"]));
    let actuator = Arc::new(SimulatedActuator::new(Arc::clone(&pins)));
    let cancel_token = CancellationToken::new();
    let node = tokio::spawn(run_node(config, actuator, cancel_token.clone()));

    let dispatcher = daemon.dispatcher.clone();
    eventually("node registered", || {
        let dispatcher = dispatcher.clone();
        async move { dispatcher.active_pins().await.len() == 2 }
    })
    .await;

    daemon
        .dispatcher
        .submit_action(PinCommand::new("fan", true))
        .await
        .unwrap();
    let observed = Arc::clone(&pins);
    eventually("fan on", || {
        let observed = Arc::clone(&observed);
        async move { observed.get("fan") == Some(true) }
    })
    .await;

    cancel_token.cancel();
    timeout(Duration::from_secs(5), node)
        .await
        .expect("node stops")
        .unwrap()
        .unwrap();
    assert_eq!(pins.get("fan"), Some(false));
    assert_eq!(pins.get("light"), Some(false));

    daemon.stop().await;
}

#[tokio::test]
async fn test_reconnect_exhaustion_cancels_process() {
    let (addr, _) = flaky_daemon().await;
    let config = NodeConfig::from_toml(&format!(
        "server = \"{addr}\"\npins = [\"light\"]\n\n[client]\nreconnect_grace_ms = 50\nreconnect_delay_secs = 0\nreconnect_attempts = 2"
    ))
    .unwrap();
    let pins = Arc::new(PinRegistry::new(["light"]));
    let actuator = Arc::new(SimulatedActuator::new(Arc::clone(&pins)));
    let cancel_token = CancellationToken::new();

    let result = timeout(
        Duration::from_secs(5),
        run_node(config, actuator, cancel_token.clone()),
    )
    .await
    .expect("node gives up");

    assert!(matches!(
        result,
        Err(NodeError::ReconnectExhausted { attempts: 2 })
    ));
    assert!(cancel_token.is_cancelled());
}
