//! Core trace types shared across the monitor
//!
//! This module defines the fundamental data structures used throughout the crate
//! for representing buffered trace lines, their origin, the connection status of
//! a device monitor and the outcome of a trace search.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Single line of device trace
///
/// Immutable once buffered. `text` is the raw line as read from the device,
/// without the `[MAC][tag]` prefix that is written to the trace file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceLine {
    /// Line content as read from the stream
    pub text: String,
    /// When the line was read
    pub arrived_at: Timestamp,
    /// Which stream produced the line
    pub source: TraceSource,
}

impl TraceLine {
    /// Create a trace line stamped with the current time
    pub fn new(text: impl Into<String>, source: TraceSource) -> Self {
        Self {
            text: text.into(),
            arrived_at: Utc::now(),
            source,
        }
    }
}

/// Origin of a trace line
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceSource {
    /// The device's own trace stream
    Primary,
    /// Trace collected for a linked gateway
    Gateway,
    /// Secondary console stream, tagged with its configured name
    AdditionalLogger(String),
}

/// Connection status of a device monitor
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Session open and trace command issued
    Connected,
    /// Connect attempt or reconnect in progress
    Connecting,
    /// At rest, explicitly stopped or given up
    Disconnected,
}

impl ConnectionState {
    /// Whether the state machine permits moving from `self` to `next`
    ///
    /// Moves to the same state are permitted and have no effect. Moves to
    /// `Disconnected` through an explicit stop bypass this check.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connected, Disconnected)
                | (Disconnected, Connecting)
                | (Connected, Connected)
                | (Connecting, Connecting)
                | (Disconnected, Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}

/// Result of a single trace search
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    /// A buffered line matched
    Found(TraceLine),
    /// No line matched before the deadline
    TimedOut,
    /// Nothing is being collected for this device
    NotRunning(String),
}

impl SearchOutcome {
    /// Matched line text, if any
    pub fn line(&self) -> Option<&str> {
        match self {
            SearchOutcome::Found(line) => Some(&line.text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_line_serialization() {
        let line = TraceLine::new("WIFI UP", TraceSource::AdditionalLogger("atom".to_string()));

        let json = serde_json::to_string(&line).unwrap();
        let deserialized: TraceLine = serde_json::from_str(&json).unwrap();
        assert_eq!(line, deserialized);
    }

    #[test]
    fn test_connection_state_serialization() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::Connected).unwrap(),
            "\"CONNECTED\""
        );
        assert_eq!(
            serde_json::to_string(&ConnectionState::Connecting).unwrap(),
            "\"CONNECTING\""
        );
        assert_eq!(
            serde_json::to_string(&ConnectionState::Disconnected).unwrap(),
            "\"DISCONNECTED\""
        );
    }

    #[test]
    fn test_connection_state_display_matches_status_names() {
        assert_eq!(ConnectionState::Connected.to_string(), "CONNECTED");
        assert_eq!(ConnectionState::Connecting.to_string(), "CONNECTING");
        assert_eq!(ConnectionState::Disconnected.to_string(), "DISCONNECTED");
    }

    #[test]
    fn test_allowed_transitions() {
        use ConnectionState::*;
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Connecting));

        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connecting.can_transition_to(Disconnected));
    }

    #[test]
    fn test_search_outcome_line() {
        let found = SearchOutcome::Found(TraceLine::new("BOOT", TraceSource::Primary));
        assert_eq!(found.line(), Some("BOOT"));
        assert_eq!(SearchOutcome::TimedOut.line(), None);
        assert_eq!(SearchOutcome::NotRunning("idle".to_string()).line(), None);
    }
}
