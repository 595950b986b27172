//! Chat protocol: message model and well-known constants.

use chrono::{DateTime, SecondsFormat, Utc};

/// Marker that opens every discovery/heartbeat frame.
pub const DISCOVERY_MARKER: &str = "P2P";

/// Id of the shared broadcast room. Every node uses the same value.
pub const GENERAL_ROOM_ID: &str = "00000000-0000-0000-0000-00000000000";

/// Display name of the shared broadcast room.
pub const GENERAL_ROOM_NAME: &str = "General";

/// Largest datagram read from or written to the multicast group.
pub const MAX_DATAGRAM_LEN: usize = 8192;

/// One chat line. Immutable once appended to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub time: DateTime<Utc>,
    pub content: String,
    pub author: String,
}

impl Message {
    pub fn new(time: DateTime<Utc>, content: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            time,
            content: content.into(),
            author: author.into(),
        }
    }

    /// Message stamped with the current time.
    pub fn now(content: impl Into<String>, author: impl Into<String>) -> Self {
        Self::new(Utc::now(), content, author)
    }

    /// RFC3339 timestamp as carried in general relay frames (second precision, `Z` suffix).
    pub fn rfc3339(&self) -> String {
        self.time.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}
