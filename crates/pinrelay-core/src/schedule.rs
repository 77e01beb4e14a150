//! Scheduled commands and the operations that mutate a node's schedule.
//!
//! Human syntax for a scheduled command is `pin;state;repeat;HH:MM:SS`,
//! e.g. `light;true;false;07:30:00`. `state` and `repeat` are true when the
//! field equals "true" ignoring case, false otherwise.

use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone, Timelike};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::{DomainError, DomainResult, PinCommand};

/// Wire and human format of a time of day.
pub const TIME_OF_DAY_FORMAT: &str = "%H:%M:%S";

/// One day; the period of a repeating command.
pub fn one_day() -> Duration {
    Duration::hours(24)
}

// ============================================================================
// TimeOfDay
// ============================================================================

/// Wall-clock time of day with second precision (24-hour).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    /// Builds a time of day, returning `None` for out-of-range components.
    pub fn from_hms(hour: u32, minute: u32, second: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour, minute, second).map(Self)
    }

    /// Time of day of an instant, truncated to the second.
    pub fn of<Tz: TimeZone>(instant: &DateTime<Tz>) -> Self {
        let time = instant.time();
        Self(time.with_nanosecond(0).unwrap_or(time))
    }

    pub fn as_naive(&self) -> NaiveTime {
        self.0
    }
}

impl FromStr for TimeOfDay {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveTime::parse_from_str(s.trim(), TIME_OF_DAY_FORMAT)
            .map(Self)
            .map_err(|e| DomainError::ParseError {
                field: "time".to_string(),
                reason: format!("\"{}\" is not HH:MM:SS ({e})", s.trim()),
            })
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIME_OF_DAY_FORMAT))
    }
}

impl Serialize for TimeOfDay {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TimeOfDay {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// First instant at `time` today, moved forward in whole days until it is not before `now`.
pub fn next_occurrence(time: TimeOfDay, now: DateTime<Local>) -> DateTime<Local> {
    let naive = now.date_naive().and_time(time.as_naive());
    // A wall-clock time inside a DST gap has no local instant; shift by the naive distance instead.
    let today = Local
        .from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| now + (naive - now.naive_local()));
    roll_forward(today, now)
}

/// Advances `instant` in 24h steps until it is no longer before `now`.
fn roll_forward(instant: DateTime<Local>, now: DateTime<Local>) -> DateTime<Local> {
    let mut instant = instant;
    if instant < now {
        let behind_days = (now - instant).num_days();
        instant += Duration::days(behind_days);
    }
    while instant < now {
        instant += one_day();
    }
    instant
}

// ============================================================================
// ScheduledCommand
// ============================================================================

/// A pin command bound to a firing instant.
///
/// Values are never mutated once queued: rescheduling a repeating command
/// produces a new value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledCommand {
    pub command: PinCommand,
    pub fire_at: DateTime<Local>,
    #[serde(default)]
    pub repeat_daily: bool,
}

impl ScheduledCommand {
    /// Schedules `command` at the next occurrence of `time` after `now`.
    pub fn at_time_of_day(
        command: PinCommand,
        time: TimeOfDay,
        repeat_daily: bool,
        now: DateTime<Local>,
    ) -> Self {
        Self {
            command,
            fire_at: next_occurrence(time, now),
            repeat_daily,
        }
    }

    /// Returns the same command with `fire_at` advanced past `now`.
    #[must_use]
    pub fn normalized(self, now: DateTime<Local>) -> Self {
        Self {
            fire_at: roll_forward(self.fire_at, now),
            ..self
        }
    }

    /// The next instance of a repeating command after it fired at `now`.
    #[must_use]
    pub fn rescheduled(&self, now: DateTime<Local>) -> Self {
        Self {
            command: self.command.clone(),
            fire_at: now + one_day(),
            repeat_daily: self.repeat_daily,
        }
    }

    pub fn time_of_day(&self) -> TimeOfDay {
        TimeOfDay::of(&self.fire_at)
    }

    pub fn pin(&self) -> &str {
        &self.command.pin
    }

    /// Loose equality used for removal: pin, state and time of day.
    ///
    /// Date and repeat flag are ignored so a removal can name any
    /// calendar instance of a command.
    pub fn matches(&self, other: &ScheduledCommand) -> bool {
        self.command.pin == other.command.pin
            && self.command.state == other.command.state
            && self.time_of_day() == other.time_of_day()
    }

    /// Parses `pin;state;repeat;HH:MM:SS` into a command due at the next occurrence.
    pub fn parse_request(text: &str, origin_id: i64, now: DateTime<Local>) -> DomainResult<Self> {
        let fields: Vec<&str> = text.trim().split(';').map(str::trim).collect();
        let [pin, state, repeat, time] = fields.as_slice() else {
            return Err(DomainError::ParseError {
                field: "schedule".to_string(),
                reason: format!(
                    "expected 4 fields separated by ';' (pin;state;repeat;HH:MM:SS), got {}",
                    fields.len()
                ),
            });
        };

        if pin.is_empty() {
            return Err(DomainError::ParseError {
                field: "pin".to_string(),
                reason: "pin can not be empty".to_string(),
            });
        }

        let time: TimeOfDay = time.parse()?;
        let command = PinCommand::new(*pin, state.eq_ignore_ascii_case("true")).with_origin(origin_id);

        Ok(Self::at_time_of_day(
            command,
            time,
            repeat.eq_ignore_ascii_case("true"),
            now,
        ))
    }
}

impl fmt::Display for ScheduledCommand {
    /// Renders the human syntax accepted by [`ScheduledCommand::parse_request`].
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{};{};{}",
            self.command.pin,
            self.command.state,
            self.repeat_daily,
            self.time_of_day()
        )
    }
}

// ============================================================================
// ScheduleOperation
// ============================================================================

/// A request to change, or read, a node's schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", content = "entry", rename_all = "snake_case")]
pub enum ScheduleOperation {
    Create(ScheduledCommand),
    Remove(ScheduledCommand),
    List,
}

impl ScheduleOperation {
    /// Pin used to route the operation to its owner. `List` has none.
    pub fn target_pin(&self) -> Option<&str> {
        match self {
            Self::Create(entry) | Self::Remove(entry) => Some(entry.pin()),
            Self::List => None,
        }
    }

    /// Chat id that should receive the acknowledgement, zero if none.
    pub fn origin_id(&self) -> i64 {
        match self {
            Self::Create(entry) | Self::Remove(entry) => entry.command.origin_id,
            Self::List => 0,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Remove(_) => "remove",
            Self::List => "list",
        }
    }
}

impl fmt::Display for ScheduleOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create(entry) | Self::Remove(entry) => write!(f, "{} {}", self.kind(), entry),
            Self::List => write!(f, "list"),
        }
    }
}
