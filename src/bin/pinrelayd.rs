//! pinrelay Daemon - Long-poll dispatcher for pin nodes
//!
//! This binary runs the dispatcher: nodes register their pins and poll it
//! for commands, controllers submit actions, schedule operations and
//! chat-style text commands.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! pinrelayd start
//!
//! # Start the daemon with a config file, in the background
//! pinrelayd start -d --config /etc/pinrelay/pinrelayd.toml
//!
//! # Stop the daemon
//! pinrelayd stop
//!
//! # Check daemon status
//! pinrelayd status
//! ```

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pinrelayd::chat::ChatInterpreter;
use pinrelayd::config::DaemonConfig;
use pinrelayd::dispatch::Dispatcher;
use pinrelayd::registry::spawn_registry;
use pinrelayd::server::DaemonServer;

/// How long `stop` waits for the daemon to exit after SIGTERM.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// pinrelay daemon - remote pin dispatcher
#[derive(Parser, Debug)]
#[command(name = "pinrelayd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Config file (defaults to <config dir>/pinrelay/pinrelayd.toml when present)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("pinrelay")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("pinrelayd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("pinrelayd.log")
}

fn default_config_path() -> Option<PathBuf> {
    let path = dirs::config_dir()?.join("pinrelay").join("pinrelayd.toml");
    path.exists().then_some(path)
}

fn read_pid() -> Option<u32> {
    fs::read_to_string(pid_file_path()).ok()?.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let dir = state_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create state directory {}", dir.display()))?;
    fs::write(pid_file_path(), process::id().to_string()).context("Failed to write PID file")
}

fn remove_pid_file() {
    if let Err(e) = fs::remove_file(pid_file_path()) {
        if e.kind() != std::io::ErrorKind::NotFound {
            eprintln!("Warning: failed to remove PID file: {e}");
        }
    }
}

fn is_process_running(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// PID of a live daemon. A PID file left behind by a dead process is removed.
fn running_daemon() -> Option<u32> {
    let pid = read_pid()?;
    if is_process_running(pid) {
        return Some(pid);
    }
    remove_pid_file();
    None
}

#[cfg(unix)]
fn signal_terminate(pid: u32) -> Result<()> {
    let pid = i32::try_from(pid).with_context(|| format!("PID {pid} out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        bail!(
            "Failed to send SIGTERM to process {pid}: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

#[cfg(not(unix))]
fn signal_terminate(_pid: u32) -> Result<()> {
    bail!("Stop command is only supported on Unix systems")
}

/// Polls until `pid` exits, for at most `limit`.
fn wait_for_exit(pid: u32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if !is_process_running(pid) {
            return true;
        }
        std::thread::sleep(STOP_POLL_INTERVAL);
    }
    !is_process_running(pid)
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
    }) {
        Command::Start { daemon, config } => start(daemon, config),
        Command::Stop => stop(),
        Command::Status => status(),
    }
}

fn start(daemon: bool, config: Option<PathBuf>) -> Result<()> {
    if let Some(pid) = running_daemon() {
        eprintln!("Daemon is already running (PID {pid})");
        eprintln!("Use 'pinrelayd stop' to stop it first.");
        process::exit(1);
    }

    // Resolved before forking so config errors reach the terminal
    let config_path = config.or_else(default_config_path);
    let config = DaemonConfig::load(config_path.as_deref())
        .context("Failed to load daemon configuration")?;

    if daemon {
        daemonize()?;
    }

    write_pid()?;
    let result = run_daemon(config, config_path.as_deref());
    remove_pid_file();
    result
}

fn stop() -> Result<()> {
    let Some(pid) = running_daemon() else {
        println!("Daemon is not running.");
        return Ok(());
    };

    println!("Stopping daemon (PID {pid})...");
    signal_terminate(pid)?;

    if wait_for_exit(pid, STOP_TIMEOUT) {
        println!("Daemon stopped.");
        Ok(())
    } else {
        eprintln!("Daemon did not stop within {}s.", STOP_TIMEOUT.as_secs());
        process::exit(1);
    }
}

fn status() -> Result<()> {
    let Some(pid) = running_daemon() else {
        println!("Daemon is not running.");
        process::exit(1);
    };

    println!("Daemon is running (PID {pid})");
    match DaemonConfig::load(default_config_path().as_deref()) {
        Ok(config) => println!("Listening on: {}", config.listen),
        Err(e) => println!("Listen address unknown: {e}"),
    }
    Ok(())
}

fn daemonize() -> Result<()> {
    let log_path = log_file_path();
    fs::create_dir_all(state_dir()).context("Failed to create log directory")?;

    let stdout = File::create(&log_path)
        .with_context(|| format!("Failed to create log file {}", log_path.display()))?;
    let stderr = stdout.try_clone().context("Failed to share log file with stderr")?;

    daemonize::Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")
}

#[tokio::main]
async fn run_daemon(config: DaemonConfig, config_path: Option<&Path>) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("pinrelayd=info".parse()?)
                .add_directive("pinrelay_core=info".parse()?)
                .add_directive("pinrelay_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        config = ?config_path,
        "pinrelay daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let registry = spawn_registry(config.registry.clone());
    info!(
        stale_threshold = ?config.registry.stale_threshold,
        cleanup_interval = ?config.registry.cleanup_interval,
        "Session registry started"
    );

    let dispatcher = Dispatcher::new(registry, config.dispatch);
    if config.authorized_chats.is_empty() {
        info!("No chat allow-list configured, accepting text commands from any chat");
    }
    let chat = ChatInterpreter::new(dispatcher.clone(), config.authorized_chats.clone());

    let server = DaemonServer::bind(config.listen, dispatcher, chat, cancel_token)
        .await
        .context("Failed to start server")?;

    info!(listen = %config.listen, "Starting server");

    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("pinrelay daemon stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
