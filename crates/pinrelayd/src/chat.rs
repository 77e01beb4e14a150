//! Chat-style text commands.
//!
//! Turns the text a chat front end receives into dispatcher calls and
//! words the outcome as the reply for that chat. Authorization is an
//! allow-list of chat ids; an empty list allows every chat.

use std::collections::HashSet;

use chrono::Local;
use tracing::{debug, info, warn};

use pinrelay_core::{PinCommand, ScheduleOperation, ScheduledCommand};
use pinrelay_protocol::ChatCommand;

use crate::dispatch::{Dispatcher, ScheduleSubmission};

pub const ACTION_RECEIVED: &str = "Action received!";
pub const NOT_AUTHORIZED: &str = "User not authorized :(";
pub const NO_ACTIVE_PINS: &str = "There are not any pins active";
pub const NO_SCHEDULED_ACTIONS: &str = "There are no scheduled actions";
const WELCOME: &str = "Welcome to pinrelay";

/// Interprets chat text on behalf of authorized chats.
#[derive(Clone)]
pub struct ChatInterpreter {
    dispatcher: Dispatcher,
    authorized: HashSet<i64>,
}

impl ChatInterpreter {
    pub fn new(dispatcher: Dispatcher, authorized: impl IntoIterator<Item = i64>) -> Self {
        Self {
            dispatcher,
            authorized: authorized.into_iter().collect(),
        }
    }

    pub fn is_authorized(&self, chat_id: i64) -> bool {
        self.authorized.is_empty() || self.authorized.contains(&chat_id)
    }

    /// Runs one text command and returns the reply for the chat.
    pub async fn handle(&self, chat_id: i64, text: &str) -> String {
        if !self.is_authorized(chat_id) {
            warn!(chat_id, "Chat not authorized");
            return NOT_AUTHORIZED.to_string();
        }

        let command = match ChatCommand::parse(text) {
            Ok(command) => command,
            Err(e) => {
                debug!(chat_id, text, error = %e, "Unparseable chat command");
                return e.to_string();
            }
        };
        info!(chat_id, command = ?command, "Chat command");

        match command {
            ChatCommand::Start => self.pins_keyboard().await,
            ChatCommand::On(pin) => self.switch(PinCommand::new(pin, true), chat_id).await,
            ChatCommand::Off(pin) => self.switch(PinCommand::new(pin, false), chat_id).await,
            ChatCommand::OnAndOff { pin, duration } => {
                let on = PinCommand::new(pin.clone(), true).with_origin(chat_id);
                if let Err(e) = self.dispatcher.submit_action(on).await {
                    return e.to_string();
                }
                tokio::time::sleep(duration).await;
                let off = PinCommand::new(pin.clone(), false).with_origin(chat_id);
                if let Err(e) = self.dispatcher.submit_action(off).await {
                    return e.to_string();
                }
                format!("{pin} turned OnAndOff")
            }
            ChatCommand::Schedule(request) => {
                self.schedule(&request, chat_id, ScheduleOperation::Create)
                    .await
            }
            ChatCommand::Unschedule(request) => {
                self.schedule(&request, chat_id, ScheduleOperation::Remove)
                    .await
            }
            ChatCommand::ListSchedules => {
                render_schedule(&self.dispatcher.list_schedule().await)
            }
        }
    }

    async fn switch(&self, command: PinCommand, chat_id: i64) -> String {
        match self
            .dispatcher
            .submit_action(command.with_origin(chat_id))
            .await
        {
            Ok(_) => ACTION_RECEIVED.to_string(),
            Err(e) => e.to_string(),
        }
    }

    async fn schedule(
        &self,
        request: &str,
        chat_id: i64,
        operation: fn(ScheduledCommand) -> ScheduleOperation,
    ) -> String {
        let entry = match ScheduledCommand::parse_request(request, chat_id, Local::now()) {
            Ok(entry) => entry,
            Err(e) => return e.to_string(),
        };

        match self
            .dispatcher
            .submit_schedule_operation(operation(entry))
            .await
        {
            Ok(ScheduleSubmission::Delivered(_)) => ACTION_RECEIVED.to_string(),
            Ok(ScheduleSubmission::Listed(entries)) => render_schedule(&entries),
            Err(e) => e.to_string(),
        }
    }

    async fn pins_keyboard(&self) -> String {
        let mut pins = self.dispatcher.active_pins().await;
        if pins.is_empty() {
            return NO_ACTIVE_PINS.to_string();
        }
        pins.sort();

        let mut reply = format!("{WELCOME}\n/start");
        for pin in pins {
            reply.push_str(&format!("\n{pin}On {pin}Off {pin}OnAndOff 2s"));
        }
        reply
    }
}

fn render_schedule(entries: &[ScheduledCommand]) -> String {
    if entries.is_empty() {
        return NO_SCHEDULED_ACTIONS.to_string();
    }
    let mut reply = String::from("Scheduled actions:");
    for entry in entries {
        reply.push('\n');
        reply.push_str(&entry.to_string());
    }
    reply
}
