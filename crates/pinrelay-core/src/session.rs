//! Session identity and the read-only node view.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::ScheduledCommand;

/// Opaque identifier the dispatcher hands to a node on registration.
///
/// Format: "session-<n>" (e.g., "session-3"). Nodes never interpret it.
/// Ordered by registration sequence, so `session-10` sorts after `session-2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

/// Prefix used for dispatcher-assigned session IDs.
pub const SESSION_ID_PREFIX: &str = "session-";

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds the identifier for the n-th registration.
    pub fn from_sequence(n: u64) -> Self {
        Self(format!("{SESSION_ID_PREFIX}{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Registration sequence number, for ids built by [`SessionId::from_sequence`].
    pub fn sequence(&self) -> Option<u64> {
        self.0.strip_prefix(SESSION_ID_PREFIX)?.parse().ok()
    }
}

impl Ord for SessionId {
    /// Sequenced ids first, in numeric order; anything else by text.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.sequence(), other.sequence()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for SessionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Snapshot of one registered node, as shown to control clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeView {
    pub session_id: SessionId,
    pub pins: Vec<String>,
    pub scheduled: Vec<ScheduledCommand>,
    /// Seconds since the node last started or finished a poll.
    pub idle_secs: u64,
    /// True while the node is parked in a long poll.
    #[serde(default)]
    pub polling: bool,
}

impl NodeView {
    /// Compact one-line description for logs and the CLI.
    pub fn summary(&self) -> String {
        format!(
            "{} pins=[{}] scheduled={} idle={}s{}",
            self.session_id,
            self.pins.join(", "),
            self.scheduled.len(),
            self.idle_secs,
            if self.polling { " (polling)" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_sequence() {
        let id = SessionId::from_sequence(7);
        assert_eq!(id.as_str(), "session-7");
        assert_eq!(id, SessionId::from("session-7"));
    }

    #[test]
    fn test_session_ids_order_by_sequence() {
        let mut ids: Vec<SessionId> = [10, 2, 1, 33]
            .into_iter()
            .map(SessionId::from_sequence)
            .collect();
        ids.push(SessionId::new("kitchen"));
        ids.sort();

        let order: Vec<&str> = ids.iter().map(SessionId::as_str).collect();
        assert_eq!(
            order,
            vec!["session-1", "session-2", "session-10", "session-33", "kitchen"]
        );
        assert_eq!(SessionId::from_sequence(10).sequence(), Some(10));
        assert_eq!(SessionId::new("kitchen").sequence(), None);
    }

    #[test]
    fn test_session_id_is_transparent_on_the_wire() {
        let id = SessionId::new("session-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"session-1\"");
    }

    #[test]
    fn test_node_view_summary() {
        let view = NodeView {
            session_id: SessionId::new("session-2"),
            pins: vec!["light".to_string(), "fan".to_string()],
            scheduled: Vec::new(),
            idle_secs: 1,
            polling: true,
        };
        assert_eq!(
            view.summary(),
            "session-2 pins=[light, fan] scheduled=0 idle=1s (polling)"
        );
    }
}
