//! TCP server for the pinrelay daemon.
//!
//! The server:
//! - Listens on a TCP address for node and control connections
//! - Spawns a ConnectionHandler for each client
//! - Fans text messages and node events out to feed subscribers
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DaemonServer  │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│   Dispatcher    │
//! │   (per client)  │     │                 │
//! └─────────────────┘     └─────────────────┘
//!         │
//!         │ broadcast
//!         ▼
//! ┌─────────────────┐
//! │  Chat front end │
//! │  (subscribers)  │
//! └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Server errors are logged and allow continued operation

mod connection;

pub use connection::{
    ConnectionError, ConnectionHandler, SubscriberWriter, SubscribersMap, MAX_MESSAGE_SIZE,
    MAX_SUBSCRIBERS,
};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pinrelay_protocol::DaemonMessage;

use crate::chat::ChatInterpreter;
use crate::dispatch::Dispatcher;
use crate::registry::SessionEvent;

/// How long shutdown waits for connections to finish their current request.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// TCP server for the pinrelay daemon.
pub struct DaemonServer {
    listener: TcpListener,

    dispatcher: Dispatcher,

    chat: ChatInterpreter,

    /// Cancellation token for graceful shutdown
    cancel_token: CancellationToken,

    /// Active feed subscribers (keyed by connection number)
    subscribers: SubscribersMap,
}

impl DaemonServer {
    /// Binds the listener. Use port 0 to let the OS pick one.
    pub async fn bind(
        addr: SocketAddr,
        dispatcher: Dispatcher,
        chat: ChatInterpreter,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr,
                error: e.to_string(),
            })?;

        Ok(Self {
            listener,
            dispatcher,
            chat,
            cancel_token,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener
            .local_addr()
            .map_err(|e| ServerError::LocalAddr(e.to_string()))
    }

    /// Runs the server.
    ///
    /// Accepts connections until the cancellation token is triggered, then
    /// waits for the connection tasks to finish.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(addr = ?self.listener.local_addr().ok(), "Daemon server listening");

        let broadcaster = self.spawn_event_broadcaster();
        let mut connections = JoinSet::new();
        let mut connection_counter: u64 = 0;

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            connection_counter += 1;
                            debug!(peer = %peer, connection = connection_counter, "Accepted connection");
                            self.handle_connection(&mut connections, stream, connection_counter);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }

                // Reap finished connection tasks as we go
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "Connection task failed");
                    }
                }
            }
        }

        self.shutdown(connections).await;
        if let Err(e) = broadcaster.await {
            warn!(error = %e, "Event broadcaster failed");
        }
        Ok(())
    }

    fn handle_connection(
        &self,
        connections: &mut JoinSet<()>,
        stream: TcpStream,
        connection_number: u64,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();

        let handler = ConnectionHandler::new(
            reader,
            writer,
            self.dispatcher.clone(),
            self.chat.clone(),
            Arc::clone(&self.subscribers),
            connection_number,
            self.cancel_token.clone(),
        );
        connections.spawn(handler.run());
    }

    /// Spawns the task forwarding text messages and registry events to
    /// subscribed connections.
    fn spawn_event_broadcaster(&self) -> tokio::task::JoinHandle<()> {
        let mut events = self.dispatcher.registry().subscribe();
        let mut messages = self.dispatcher.subscribe_messages();
        let subscribers = Arc::clone(&self.subscribers);
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = cancel_token.cancelled() => {
                        debug!("Event broadcaster shutting down");
                        break;
                    }

                    result = events.recv() => match result {
                        Ok(event) => event_frame(event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Event broadcaster lagged, skipped node events");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Registry event channel closed");
                            break;
                        }
                    },

                    result = messages.recv() => match result {
                        Ok(message) => DaemonMessage::text_message(message),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Event broadcaster lagged, skipped text messages");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("Text message channel closed");
                            break;
                        }
                    },
                };

                broadcast_frame(&subscribers, &frame).await;
            }
        })
    }

    async fn shutdown(&self, mut connections: JoinSet<()>) {
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "Connections still busy after shutdown grace, aborting"
            );
            connections.shutdown().await;
        }

        self.subscribers.write().await.clear();
        info!("Server cleanup complete");
    }
}

fn event_frame(event: SessionEvent) -> DaemonMessage {
    match event {
        SessionEvent::Registered { session_id, pins } => {
            DaemonMessage::NodeRegistered { session_id, pins }
        }
        SessionEvent::Removed { session_id, reason } => DaemonMessage::NodeRemoved {
            session_id,
            reason: reason.to_string(),
        },
    }
}

/// Writes a feed frame to every subscriber, dropping those that fail.
async fn broadcast_frame(subscribers: &SubscribersMap, frame: &DaemonMessage) {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            error!(error = %e, "Failed to serialize feed event");
            return;
        }
    };

    let subs = subscribers.read().await;
    let mut failed = Vec::new();

    for (connection, writer) in subs.iter() {
        if let Err(e) = connection::write_frame(writer, &json).await {
            debug!(connection, error = %e, "Failed to send feed event to subscriber");
            failed.push(*connection);
        }
    }

    // Read lock has to go before the write lock
    drop(subs);

    if !failed.is_empty() {
        let mut subs = subscribers.write().await;
        for connection in failed {
            subs.remove(&connection);
            debug!(connection, "Removed failed subscriber");
        }
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("Failed to read local address: {0}")]
    LocalAddr(String),
}
