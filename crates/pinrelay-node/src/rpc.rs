//! Request/response connection to the dispatcher.
//!
//! One TCP stream carrying newline-delimited JSON. Requests are strictly
//! sequential: each call writes one frame and reads frames until the reply
//! arrives. Feed events that arrive in between (only after `subscribe`)
//! are skipped by [`DaemonConnection::request`] and returned by
//! [`DaemonConnection::next_frame`].
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()`.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use pinrelay_core::{
    ActionBatch, NodeView, PinCommand, RegistrationResult, ScheduleOperation, ScheduledCommand,
    TextMessage,
};
use pinrelay_protocol::{ClientMessage, DaemonMessage, ProtocolVersion};

use crate::error::{NodeError, Result};

/// Timeout for the handshake and for short requests
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// An open, handshaken connection to the dispatcher.
pub struct DaemonConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    client_id: String,
    line: String,
}

impl DaemonConnection {
    /// Connects to `addr` and completes the `Connect` handshake, all within
    /// `connect_timeout`.
    pub async fn connect(
        addr: &str,
        connect_timeout: Duration,
        client_id: Option<String>,
    ) -> Result<Self> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NodeError::ConnectTimeout(addr.to_string()))?
            .map_err(|e| NodeError::Connect {
                addr: addr.to_string(),
                error: e.to_string(),
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        let mut connection = Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            client_id: String::new(),
            line: String::new(),
        };

        let reply = timeout(
            connect_timeout,
            connection.exchange(&ClientMessage::connect(client_id)),
        )
        .await
        .map_err(|_| NodeError::Timeout("handshake"))??;

        match reply {
            DaemonMessage::Connected {
                protocol_version,
                client_id,
            } => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(NodeError::Rejected(format!(
                        "dispatcher speaks protocol {protocol_version}, we speak {}",
                        ProtocolVersion::CURRENT
                    )));
                }
                debug!(client_id, protocol_version = %protocol_version, "Handshake complete");
                connection.client_id = client_id;
                Ok(connection)
            }
            DaemonMessage::Rejected { reason, .. } => Err(NodeError::Rejected(reason)),
            DaemonMessage::Error { message, code } => Err(NodeError::Remote { message, code }),
            other => Err(NodeError::Protocol(format!(
                "Unexpected response to connect: {other:?}"
            ))),
        }
    }

    /// Identifier the dispatcher assigned to this connection.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    // ------------------------------------------------------------------
    // Framing
    // ------------------------------------------------------------------

    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let json = serde_json::to_string(message)?;
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        debug!(message_type = message.message.name(), "Sent message to dispatcher");
        Ok(())
    }

    /// Reads the next frame of any kind.
    pub async fn next_frame(&mut self) -> Result<DaemonMessage> {
        self.line.clear();
        let read = self.reader.read_line(&mut self.line).await?;
        if read == 0 {
            return Err(NodeError::Closed);
        }
        Ok(serde_json::from_str(self.line.trim())?)
    }

    /// Sends `message` and returns the first frame that is not a feed event.
    async fn exchange(&mut self, message: &ClientMessage) -> Result<DaemonMessage> {
        self.send(message).await?;
        loop {
            let frame = self.next_frame().await?;
            if frame.is_feed_event() {
                debug!("Skipping feed event while waiting for a reply");
                continue;
            }
            return Ok(frame);
        }
    }

    /// One request with a deadline. Error frames become [`NodeError::Remote`].
    pub async fn request(
        &mut self,
        message: ClientMessage,
        deadline: Duration,
        waiting_for: &'static str,
    ) -> Result<DaemonMessage> {
        let reply = timeout(deadline, self.exchange(&message))
            .await
            .map_err(|_| NodeError::Timeout(waiting_for))??;
        match reply {
            DaemonMessage::Error { message, code } => Err(NodeError::Remote { message, code }),
            reply => Ok(reply),
        }
    }

    // ------------------------------------------------------------------
    // Node surface
    // ------------------------------------------------------------------

    pub async fn register(
        &mut self,
        pins: Vec<String>,
        schedule: Vec<ScheduledCommand>,
        deadline: Duration,
    ) -> Result<RegistrationResult> {
        match self
            .request(ClientMessage::register(pins, schedule), deadline, "registration")
            .await?
        {
            DaemonMessage::RegistrationResult { result } => Ok(result),
            other => Err(unexpected("register", &other)),
        }
    }

    pub async fn unregister(&mut self, deadline: Duration) -> Result<()> {
        match self
            .request(ClientMessage::unregister(), deadline, "unregister")
            .await?
        {
            DaemonMessage::Unregistered => Ok(()),
            other => Err(unexpected("unregister", &other)),
        }
    }

    /// One long poll; an empty batch means the dispatcher's wait timed out.
    pub async fn check_for_actions(&mut self, deadline: Duration) -> Result<ActionBatch> {
        match self
            .request(ClientMessage::check_for_actions(), deadline, "actions")
            .await?
        {
            DaemonMessage::Actions { batch } => Ok(batch),
            other => Err(unexpected("check_for_actions", &other)),
        }
    }

    pub async fn submit_message(&mut self, message: TextMessage, deadline: Duration) -> Result<()> {
        match self
            .request(ClientMessage::submit_message(message), deadline, "message ack")
            .await?
        {
            DaemonMessage::Ok => Ok(()),
            other => Err(unexpected("submit_message", &other)),
        }
    }

    // ------------------------------------------------------------------
    // Control surface
    // ------------------------------------------------------------------

    /// Routes a command to its node and waits for the hand-over.
    pub async fn submit_action(&mut self, command: PinCommand, deadline: Duration) -> Result<String> {
        match self
            .request(ClientMessage::submit_action(command), deadline, "action ack")
            .await?
        {
            DaemonMessage::Accepted { message } => Ok(message),
            other => Err(unexpected("submit_action", &other)),
        }
    }

    pub async fn submit_schedule_operation(
        &mut self,
        operation: ScheduleOperation,
        deadline: Duration,
    ) -> Result<DaemonMessage> {
        self.request(
            ClientMessage::submit_schedule_operation(operation),
            deadline,
            "schedule ack",
        )
        .await
    }

    /// Chat-style text command, answered with the reply text.
    pub async fn command(&mut self, text: &str, chat_id: i64, deadline: Duration) -> Result<String> {
        match self
            .request(ClientMessage::command(text, chat_id), deadline, "reply")
            .await?
        {
            DaemonMessage::Reply { text, .. } => Ok(text),
            other => Err(unexpected("command", &other)),
        }
    }

    pub async fn active_pins(&mut self, deadline: Duration) -> Result<Vec<String>> {
        match self
            .request(ClientMessage::active_pins(), deadline, "pins")
            .await?
        {
            DaemonMessage::ActivePins { pins } => Ok(pins),
            other => Err(unexpected("active_pins", &other)),
        }
    }

    pub async fn list_schedule(&mut self, deadline: Duration) -> Result<Vec<ScheduledCommand>> {
        match self
            .request(ClientMessage::list_schedule(), deadline, "schedule")
            .await?
        {
            DaemonMessage::Schedule { entries } => Ok(entries),
            other => Err(unexpected("list_schedule", &other)),
        }
    }

    pub async fn list_nodes(&mut self, deadline: Duration) -> Result<Vec<NodeView>> {
        match self
            .request(ClientMessage::list_nodes(), deadline, "nodes")
            .await?
        {
            DaemonMessage::NodeList { nodes } => Ok(nodes),
            other => Err(unexpected("list_nodes", &other)),
        }
    }

    /// Starts the event feed; follow with [`next_frame`](Self::next_frame).
    pub async fn subscribe(&mut self, deadline: Duration) -> Result<Vec<NodeView>> {
        match self
            .request(ClientMessage::subscribe(), deadline, "subscription")
            .await?
        {
            DaemonMessage::NodeList { nodes } => Ok(nodes),
            other => Err(unexpected("subscribe", &other)),
        }
    }

    /// Says goodbye; the dispatcher closes without replying.
    pub async fn close(mut self) {
        if let Err(e) = self.send(&ClientMessage::disconnect()).await {
            debug!(error = %e, "Failed to send disconnect");
        }
        info!(client_id = %self.client_id, "Closed dispatcher connection");
    }
}

fn unexpected(request: &str, reply: &DaemonMessage) -> NodeError {
    NodeError::Protocol(format!("Unexpected response to {request}: {reply:?}"))
}
