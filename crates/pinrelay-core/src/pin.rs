//! Pin commands, text messages and pin naming rules.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{DomainError, DomainResult};

/// Keyword a chat user sends to ask for every active pin.
///
/// A pin may never be named after it, otherwise the query would be ambiguous.
pub const RESERVED_PIN_KEYWORD: &str = "GetPinsAvailable";

/// Suffixes of the keyboard command convention (`lightOn`, `lightOff`, `lightOnAndOff 2s`).
///
/// `OnAndOff` is listed on its own even though it ends in `Off`: the error message names it.
pub const RESERVED_PIN_SUFFIXES: [&str; 3] = ["OnAndOff", "On", "Off"];

/// An atomic instruction to set one logical pin.
///
/// `origin_id` correlates the outcome back to whoever asked for it
/// (a chat id). Zero means nobody is waiting for an answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PinCommand {
    pub pin: String,
    pub state: bool,
    #[serde(default)]
    pub origin_id: i64,
}

impl PinCommand {
    /// Creates a command with no origin to report back to.
    pub fn new(pin: impl Into<String>, state: bool) -> Self {
        Self {
            pin: pin.into(),
            state,
            origin_id: 0,
        }
    }

    /// Attaches the chat id that should receive the outcome.
    #[must_use]
    pub fn with_origin(mut self, origin_id: i64) -> Self {
        self.origin_id = origin_id;
        self
    }

    /// Returns true if somebody expects an outcome message.
    pub fn has_origin(&self) -> bool {
        self.origin_id != 0
    }

    /// Human-readable form of the state (`on` / `off`).
    pub fn state_label(&self) -> &'static str {
        if self.state {
            "on"
        } else {
            "off"
        }
    }
}

impl fmt::Display for PinCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.pin, self.state_label())
    }
}

/// A human-readable message addressed to a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
    pub chat_id: i64,
    pub text: String,
}

impl TextMessage {
    pub fn new(chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
        }
    }
}

/// Checks a pin name against the naming rules.
///
/// A name must be a single non-empty token, must not end in one of the
/// keyboard suffixes and must not be the reserved query keyword.
pub fn validate_pin_name(name: &str) -> DomainResult<()> {
    let invalid = |reason: &str| DomainError::InvalidPinName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let mut tokens = name.split_whitespace();
    match (tokens.next(), tokens.next()) {
        (None, _) => return Err(invalid("pin names can not be empty")),
        (Some(token), None) if token == name => {}
        _ => return Err(invalid("pin names should only have one word")),
    }

    if name == RESERVED_PIN_KEYWORD {
        return Err(invalid("the name is reserved for listing the active pins"));
    }

    if RESERVED_PIN_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
        return Err(invalid(
            "pin names should not end with \"On\", \"Off\" or \"OnAndOff\"",
        ));
    }

    Ok(())
}
