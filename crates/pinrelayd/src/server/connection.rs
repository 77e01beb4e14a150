//! Connection handler for individual client connections.
//!
//! Each TCP connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming messages
//! - Remembers the session registered on this connection
//! - Routes node requests and control requests to the dispatcher
//! - Registers itself as a feed subscriber on request
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pinrelay_core::{ActionBatch, RegistrationRequest, SessionId, TextMessage};
use pinrelay_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion};

use crate::chat::{ChatInterpreter, ACTION_RECEIVED};
use crate::dispatch::{DispatchError, Dispatcher, ScheduleSubmission};

/// Type alias for subscriber writer handle
pub type SubscriberWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// Feed subscribers keyed by connection number
pub type SubscribersMap = Arc<RwLock<HashMap<u64, SubscriberWriter>>>;

/// Maximum number of concurrent feed subscribers
pub const MAX_SUBSCRIBERS: usize = 10;

/// Maximum message size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Writes one newline-terminated frame, bounded by the write timeout.
pub(crate) async fn write_frame(
    writer: &SubscriberWriter,
    json: &str,
) -> Result<(), ConnectionError> {
    let mut writer = writer.lock().await;

    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Connection handler for a single client.
///
/// A connection may act as a node (register, poll, report), as a control
/// client (submit, list, chat commands, subscribe) or as both.
pub struct ConnectionHandler {
    /// Buffered reader for incoming messages
    reader: BufReader<OwnedReadHalf>,

    /// Buffered writer for outgoing messages (shared for feed broadcast)
    writer: SubscriberWriter,

    dispatcher: Dispatcher,

    chat: ChatInterpreter,

    /// Shared subscribers map for feed broadcasting
    subscribers: SubscribersMap,

    /// Client identifier (assigned during handshake)
    client_id: Option<String>,

    /// Session registered on this connection
    session_id: Option<SessionId>,

    connection_number: u64,

    cancel_token: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        dispatcher: Dispatcher,
        chat: ChatInterpreter,
        subscribers: SubscribersMap,
        connection_number: u64,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            dispatcher,
            chat,
            subscribers,
            client_id: None,
            session_id: None,
            connection_number,
            cancel_token,
        }
    }

    /// Runs the connection handler until the connection closes or the
    /// server shuts down.
    ///
    /// A session registered on this connection is left to the staleness
    /// sweep when the connection drops without `unregister`, so a node can
    /// still unregister after a transport hiccup.
    pub async fn run(mut self) {
        debug!(connection = self.connection_number, "New client connected");

        match self.handle_handshake().await {
            Ok(()) => {
                info!(client_id = ?self.client_id, "Client handshake completed");
            }
            Err(e) => {
                warn!(
                    connection = self.connection_number,
                    error = %e,
                    "Handshake failed"
                );
                return;
            }
        }

        if let Err(e) = self.process_messages().await {
            debug!(
                client_id = ?self.client_id,
                error = %e,
                "Connection closed"
            );
        }

        if self
            .subscribers
            .write()
            .await
            .remove(&self.connection_number)
            .is_some()
        {
            debug!(client_id = ?self.client_id, "Removed disconnected subscriber");
        }

        info!(
            client_id = ?self.client_id,
            session_id = ?self.session_id,
            "Client disconnected"
        );
    }

    /// Expects a `Connect` frame and answers `Connected` or `Rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = self.next_message().await?;

        let client_version = msg.protocol_version;
        if let Err(e) = ProtocolVersion::CURRENT.check_peer(&client_version) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            self.send_message(DaemonMessage::rejected(&e.to_string()))
                .await?;
            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.send_message(DaemonMessage::connected(assigned_id))
                    .await
            }
            other => {
                self.send_message(DaemonMessage::error(
                    "Expected Connect message for handshake",
                ))
                .await?;
                Err(ConnectionError::UnexpectedMessage(other.name().to_string()))
            }
        }
    }

    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let msg = match self.next_message().await {
                Ok(msg) => msg,
                Err(ConnectionError::Eof) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Err(ConnectionError::Cancelled) => {
                    debug!(client_id = ?self.client_id, "Server shutting down");
                    return Ok(());
                }
                Err(ConnectionError::ParseError(e)) => {
                    // A bad frame fails that request only
                    self.send_message(DaemonMessage::error_with_code(
                        &format!("Parse error: {e}"),
                        "parse_error",
                    ))
                    .await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.handle_message(msg).await {
                Ok(()) => {}
                Err(ConnectionError::Eof) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        match msg.message {
            MessageType::Connect { .. } => {
                self.send_message(DaemonMessage::error("Already connected"))
                    .await?;
            }

            MessageType::Register { pins, schedule } => {
                if let Some(session_id) = &self.session_id {
                    let reply = DaemonMessage::error_with_code(
                        &format!("Connection already registered as {session_id}"),
                        "already_registered",
                    );
                    self.send_message(reply).await?;
                    return Ok(());
                }

                match self
                    .dispatcher
                    .register(RegistrationRequest::new(pins, schedule))
                    .await
                {
                    Ok(result) => {
                        self.session_id = result.session_id.clone();
                        self.send_message(DaemonMessage::registration_result(result))
                            .await?;
                    }
                    Err(e) => self.send_dispatch_error(&e).await?,
                }
            }

            MessageType::Unregister => {
                if let Some(session_id) = self.session_id.take() {
                    if let Err(e) = self.dispatcher.unregister(session_id).await {
                        self.send_dispatch_error(&e).await?;
                        return Ok(());
                    }
                }
                self.send_message(DaemonMessage::Unregistered).await?;
            }

            MessageType::CheckForActions => self.handle_check_for_actions().await?,

            MessageType::SubmitMessage { text, chat_id } => {
                self.dispatcher
                    .submit_message(TextMessage::new(chat_id, text));
                self.send_message(DaemonMessage::Ok).await?;
            }

            MessageType::SubmitAction { command } => {
                match self.dispatcher.submit_action(command).await {
                    Ok(_) => {
                        self.send_message(DaemonMessage::accepted(ACTION_RECEIVED))
                            .await?
                    }
                    Err(e) => self.send_dispatch_error(&e).await?,
                }
            }

            MessageType::SubmitScheduleOperation { operation } => {
                match self.dispatcher.submit_schedule_operation(operation).await {
                    Ok(ScheduleSubmission::Delivered(_)) => {
                        self.send_message(DaemonMessage::accepted(ACTION_RECEIVED))
                            .await?
                    }
                    Ok(ScheduleSubmission::Listed(entries)) => {
                        self.send_message(DaemonMessage::Schedule { entries })
                            .await?
                    }
                    Err(e) => self.send_dispatch_error(&e).await?,
                }
            }

            MessageType::ListSchedule => {
                let entries = self.dispatcher.list_schedule().await;
                self.send_message(DaemonMessage::Schedule { entries })
                    .await?;
            }

            MessageType::ActivePins => {
                let pins = self.dispatcher.active_pins().await;
                self.send_message(DaemonMessage::ActivePins { pins })
                    .await?;
            }

            MessageType::ListNodes => {
                let nodes = self.dispatcher.nodes().await;
                self.send_message(DaemonMessage::NodeList { nodes }).await?;
            }

            MessageType::Command { text, chat_id } => {
                let reply = self.chat.handle(chat_id, &text).await;
                self.send_message(DaemonMessage::reply(chat_id, reply))
                    .await?;
            }

            MessageType::Subscribe => {
                {
                    let mut subs = self.subscribers.write().await;
                    if subs.len() >= MAX_SUBSCRIBERS && !subs.contains_key(&self.connection_number)
                    {
                        drop(subs);
                        self.send_message(DaemonMessage::error_with_code(
                            &format!("Too many subscribers (max: {MAX_SUBSCRIBERS})"),
                            "too_many_subscribers",
                        ))
                        .await?;
                        return Ok(());
                    }
                    subs.insert(self.connection_number, Arc::clone(&self.writer));
                }
                debug!(client_id = ?self.client_id, "Client subscribed to feed");

                // Current nodes as initial state
                let nodes = self.dispatcher.nodes().await;
                self.send_message(DaemonMessage::NodeList { nodes }).await?;
            }

            MessageType::Unsubscribe => {
                self.subscribers
                    .write()
                    .await
                    .remove(&self.connection_number);
                debug!(client_id = ?self.client_id, "Client unsubscribed from feed");
                self.send_message(DaemonMessage::Ok).await?;
            }

            MessageType::Ping { seq } => {
                self.send_message(DaemonMessage::pong(seq)).await?;
            }

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }
        }

        Ok(())
    }

    /// Serves one long poll for the session registered on this connection.
    ///
    /// The polled item is acknowledged to its submitter only after the
    /// batch frame has been written.
    async fn handle_check_for_actions(&mut self) -> Result<(), ConnectionError> {
        let Some(session_id) = self.session_id.clone() else {
            return self
                .send_message(DaemonMessage::error_with_code(
                    "Connection has no registered session",
                    "not_registered",
                ))
                .await;
        };

        match self.dispatcher.check_for_actions(&session_id).await {
            Ok(Some(pending)) => {
                self.send_message(DaemonMessage::actions(pending.batch()))
                    .await?;
                let batch = pending.accept();
                debug!(session_id = %session_id, batch = ?batch, "Handed batch to node");
                Ok(())
            }
            Ok(None) => {
                self.send_message(DaemonMessage::actions(ActionBatch::empty()))
                    .await
            }
            Err(e) => {
                if matches!(e, DispatchError::UnknownSession(_)) {
                    // Swept while away; the node has to register again
                    self.session_id = None;
                }
                self.send_dispatch_error(&e).await
            }
        }
    }

    async fn send_dispatch_error(&self, err: &DispatchError) -> Result<(), ConnectionError> {
        debug!(client_id = ?self.client_id, error = %err, "Request failed");
        self.send_message(DaemonMessage::error_with_code(&err.to_string(), err.code()))
            .await
    }

    /// Reads the next frame, giving up on idle timeout or shutdown.
    async fn next_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let cancel_token = self.cancel_token.clone();
        let read = tokio::select! {
            _ = cancel_token.cancelled() => return Err(ConnectionError::Cancelled),
            read = timeout(READ_TIMEOUT, self.read_message()) => read,
        };

        read.unwrap_or_else(|_| {
            debug!(client_id = ?self.client_id, "Connection timed out");
            Err(ConnectionError::Timeout)
        })
    }

    /// Reads a single message from the client.
    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();

        let mut limited = (&mut self.reader).take(MAX_MESSAGE_SIZE as u64 + 1);
        let bytes_read = limited
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage = serde_json::from_str(&line)
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            message_type = msg.message.name(),
            "Received message"
        );

        Ok(msg)
    }

    async fn send_message(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        let json =
            serde_json::to_string(&msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;
        write_frame(&self.writer, &json).await
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Server shutting down")]
    Cancelled,
}
