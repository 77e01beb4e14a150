//! pinrelay - node runner and control CLI
//!
//! # Usage
//!
//! ```text
//! pinrelay node --config node.toml        # Serve pins to the dispatcher
//! pinrelay send --chat-id 42 /list        # Chat-style text command
//! pinrelay action light on --origin 42    # Switch a pin directly
//! pinrelay pins                           # Pins currently served
//! pinrelay schedule                       # Every scheduled action
//! pinrelay nodes                          # Registered nodes
//! pinrelay watch                          # Follow the dispatcher feed
//! ```

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pinrelay_core::{Actuator, PinCommand, PinRegistry, SimulatedActuator};
use pinrelay_node::{run_node, DaemonConnection, NodeConfig, REQUEST_TIMEOUT};
use pinrelay_protocol::DaemonMessage;
use pinrelayd::config::DEFAULT_LISTEN;

/// Connect timeout for one-shot control commands.
const CONTROL_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// CLI Arguments
// ============================================================================

/// pinrelay - remote pin control
#[derive(Parser, Debug)]
#[command(name = "pinrelay", version, about)]
struct Args {
    /// Dispatcher address for control commands
    #[arg(long, short = 's', global = true, default_value = DEFAULT_LISTEN)]
    server: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a node serving the pins in its config file
    Node {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Send a chat-style text command and print the reply
    Send {
        #[arg(long)]
        chat_id: i64,

        /// Command text, e.g. `/list` or `light;true;false;07:30:00`
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Switch a pin on the node that owns it
    Action {
        pin: String,
        state: PinState,

        /// Chat to report the outcome to; 0 means no report
        #[arg(long, default_value_t = 0)]
        origin: i64,
    },
    /// List pins currently served by registered nodes
    Pins,
    /// List every scheduled action
    Schedule,
    /// List registered nodes
    Nodes,
    /// Follow node registrations, removals and text messages
    Watch,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PinState {
    On,
    Off,
}

impl PinState {
    fn as_bool(self) -> bool {
        matches!(self, Self::On)
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(matches!(args.command, Command::Node { .. }));

    let result = match args.command {
        Command::Node { config } => node(config).await,
        command => control(&args.server, command).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

/// Node mode logs at info to stderr; control commands stay quiet unless
/// `RUST_LOG` says otherwise.
fn init_logging(node_mode: bool) {
    let default_level = if node_mode { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// Node
// ============================================================================

async fn node(config_path: PathBuf) -> Result<()> {
    let config = NodeConfig::load(&config_path)
        .with_context(|| format!("Failed to load node config {}", config_path.display()))?;

    let pins = Arc::new(PinRegistry::new(config.pins.iter().cloned()));
    let actuator: Arc<dyn Actuator> = Arc::new(SimulatedActuator::new(pins));

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            result = wait_for_shutdown_signal() => {
                if let Err(e) = result {
                    error!(error = %e, "Error waiting for shutdown signal");
                }
                info!("Shutdown signal received");
                shutdown_token.cancel();
            }
            _ = shutdown_token.cancelled() => {}
        }
    });

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %config.server,
        pins = ?config.pins,
        "pinrelay node starting"
    );

    run_node(config, actuator, cancel_token.clone())
        .await
        .context("Node stopped with an error")?;

    info!("pinrelay node stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

// ============================================================================
// Control commands
// ============================================================================

async fn control(server: &str, command: Command) -> Result<()> {
    let mut connection = DaemonConnection::connect(server, CONTROL_CONNECT_TIMEOUT, None)
        .await
        .with_context(|| format!("Failed to reach dispatcher at {server}"))?;

    match command {
        Command::Send { chat_id, text } => {
            let reply = connection
                .command(&text.join(" "), chat_id, REQUEST_TIMEOUT)
                .await?;
            println!("{reply}");
        }
        Command::Action { pin, state, origin } => {
            let command = PinCommand::new(pin, state.as_bool()).with_origin(origin);
            let reply = connection.submit_action(command, REQUEST_TIMEOUT).await?;
            println!("{reply}");
        }
        Command::Pins => {
            let pins = connection.active_pins(REQUEST_TIMEOUT).await?;
            if pins.is_empty() {
                println!("No active pins");
            }
            for pin in pins {
                println!("{pin}");
            }
        }
        Command::Schedule => {
            let entries = connection.list_schedule(REQUEST_TIMEOUT).await?;
            if entries.is_empty() {
                println!("No scheduled actions");
            }
            for entry in entries {
                println!("{entry}");
            }
        }
        Command::Nodes => {
            let nodes = connection.list_nodes(REQUEST_TIMEOUT).await?;
            if nodes.is_empty() {
                println!("No registered nodes");
            }
            for node in nodes {
                println!("{}", node.summary());
            }
        }
        Command::Watch => return watch(connection).await,
        Command::Node { .. } => {}
    }

    connection.close().await;
    Ok(())
}

/// Prints the current nodes, then every feed event until the dispatcher
/// closes the connection or Ctrl-C.
async fn watch(mut connection: DaemonConnection) -> Result<()> {
    let nodes = connection.subscribe(REQUEST_TIMEOUT).await?;
    for node in &nodes {
        println!("node     {}", node.summary());
    }

    loop {
        let frame = tokio::select! {
            frame = connection.next_frame() => frame,
            _ = tokio::signal::ctrl_c() => break,
        };

        match frame.context("Lost connection to dispatcher")? {
            DaemonMessage::TextMessage { chat_id, text } => {
                println!("message  [{chat_id}] {text}");
            }
            DaemonMessage::NodeRegistered { session_id, pins } => {
                println!("joined   {session_id} pins=[{}]", pins.join(", "));
            }
            DaemonMessage::NodeRemoved { session_id, reason } => {
                println!("left     {session_id} ({reason})");
            }
            other => info!(frame = ?other, "Ignoring frame"),
        }
    }

    connection.close().await;
    Ok(())
}
