//! Grammar of chat-style text commands.
//!
//! ```text
//! /start | GetPinsAvailable          list active pins
//! <pin>On | <pin>Off                 switch a pin
//! <pin>OnAndOff <duration>           switch on, wait, switch off
//! /schedule pin;state;repeat;HH:MM:SS
//! /unschedule pin;state;repeat;HH:MM:SS
//! /schedules                         list scheduled commands
//! ```
//!
//! Only the first word selects the command; extra words are ignored except
//! for the `OnAndOff` duration and the schedule argument.

use std::time::Duration;

use pinrelay_core::RESERVED_PIN_KEYWORD;
use thiserror::Error;

/// Errors are worded as the reply sent back to the chat.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Message was not correct")]
    NotCorrect,

    #[error("OnAndOff messages should contain at least two words (action and time)")]
    MissingDuration,

    #[error("Time not set properly")]
    BadDuration,
}

/// A parsed chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    /// Show the keyboard of active pins
    Start,
    On(String),
    Off(String),
    OnAndOff { pin: String, duration: Duration },
    /// Raw `pin;state;repeat;HH:MM:SS` argument
    Schedule(String),
    Unschedule(String),
    ListSchedules,
}

impl ChatCommand {
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        let mut words = text.split_whitespace();
        let first = words.next().ok_or(CommandError::NotCorrect)?;

        if first.eq_ignore_ascii_case("/start") || first == RESERVED_PIN_KEYWORD {
            return Ok(Self::Start);
        }
        if first.eq_ignore_ascii_case("/schedules") {
            return Ok(Self::ListSchedules);
        }
        if first.eq_ignore_ascii_case("/schedule") || first.eq_ignore_ascii_case("/unschedule") {
            let argument = words.collect::<Vec<_>>().join(" ");
            if argument.is_empty() {
                return Err(CommandError::NotCorrect);
            }
            return Ok(if first.eq_ignore_ascii_case("/schedule") {
                Self::Schedule(argument)
            } else {
                Self::Unschedule(argument)
            });
        }

        if let Some(pin) = first.strip_suffix("OnAndOff") {
            let pin = non_empty(pin)?;
            let raw = words.next().ok_or(CommandError::MissingDuration)?;
            let duration = parse_duration(raw).ok_or(CommandError::BadDuration)?;
            return Ok(Self::OnAndOff { pin, duration });
        }
        if let Some(pin) = first.strip_suffix("On") {
            return Ok(Self::On(non_empty(pin)?));
        }
        if let Some(pin) = first.strip_suffix("Off") {
            return Ok(Self::Off(non_empty(pin)?));
        }

        Err(CommandError::NotCorrect)
    }
}

fn non_empty(pin: &str) -> Result<String, CommandError> {
    if pin.is_empty() {
        Err(CommandError::NotCorrect)
    } else {
        Ok(pin.to_string())
    }
}

/// Parses durations such as `500ms`, `2s`, `1.5m` or `1h30m`.
///
/// Units: `ns`, `us`, `µs`, `ms`, `s`, `m`, `h`. Every number needs a unit.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let mut rest = text.trim();
    if rest.is_empty() {
        return None;
    }

    let mut total_nanos = 0f64;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        let value: f64 = number.parse().ok()?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let scale = match unit {
            "ns" => 1.0,
            "us" | "µs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return None,
        };

        total_nanos += value * scale;
        rest = tail;
    }

    let total_nanos = total_nanos.round();
    if !total_nanos.is_finite() || total_nanos >= u64::MAX as f64 {
        return None;
    }
    Some(Duration::from_nanos(total_nanos as u64))
}
