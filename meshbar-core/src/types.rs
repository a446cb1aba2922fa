//! Domain types shared by the daemon and the client.
//!
//! Everything here crosses the IPC boundary as JSON, so every type is
//! serde-serializable. Byte offsets in [`Highlight`] index into the UTF-8
//! `details` string.

use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// Tag of a structured engine event.
///
/// Tags the engine emits that are not listed here map to [`EventKind::Unknown`]
/// rather than being dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    TunDeviceReady,
    TunDeviceError,
    PeerAdded,
    PeerRemoved,
    PeerConnAdded,
    PeerConnRemoved,
    ListenerAdded,
    ListenerAddFailed,
    ListenerAcceptFailed,
    ConnectionAccepted,
    ConnectionError,
    Connecting,
    ConnectError,
    VpnPortalClientConnected,
    VpnPortalClientDisconnected,
    DhcpIpv4Changed,
    DhcpIpv4Conflicted,
    PortForwardAdded,
    ProxyCidrsUpdated,
    ConfigPatched,
    Unknown,
}

impl EventKind {
    pub const ALL: [EventKind; 21] = [
        EventKind::TunDeviceReady,
        EventKind::TunDeviceError,
        EventKind::PeerAdded,
        EventKind::PeerRemoved,
        EventKind::PeerConnAdded,
        EventKind::PeerConnRemoved,
        EventKind::ListenerAdded,
        EventKind::ListenerAddFailed,
        EventKind::ListenerAcceptFailed,
        EventKind::ConnectionAccepted,
        EventKind::ConnectionError,
        EventKind::Connecting,
        EventKind::ConnectError,
        EventKind::VpnPortalClientConnected,
        EventKind::VpnPortalClientDisconnected,
        EventKind::DhcpIpv4Changed,
        EventKind::DhcpIpv4Conflicted,
        EventKind::PortForwardAdded,
        EventKind::ProxyCidrsUpdated,
        EventKind::ConfigPatched,
        EventKind::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TunDeviceReady => "TunDeviceReady",
            EventKind::TunDeviceError => "TunDeviceError",
            EventKind::PeerAdded => "PeerAdded",
            EventKind::PeerRemoved => "PeerRemoved",
            EventKind::PeerConnAdded => "PeerConnAdded",
            EventKind::PeerConnRemoved => "PeerConnRemoved",
            EventKind::ListenerAdded => "ListenerAdded",
            EventKind::ListenerAddFailed => "ListenerAddFailed",
            EventKind::ListenerAcceptFailed => "ListenerAcceptFailed",
            EventKind::ConnectionAccepted => "ConnectionAccepted",
            EventKind::ConnectionError => "ConnectionError",
            EventKind::Connecting => "Connecting",
            EventKind::ConnectError => "ConnectError",
            EventKind::VpnPortalClientConnected => "VpnPortalClientConnected",
            EventKind::VpnPortalClientDisconnected => "VpnPortalClientDisconnected",
            EventKind::DhcpIpv4Changed => "DhcpIpv4Changed",
            EventKind::DhcpIpv4Conflicted => "DhcpIpv4Conflicted",
            EventKind::PortForwardAdded => "PortForwardAdded",
            EventKind::ProxyCidrsUpdated => "ProxyCidrsUpdated",
            EventKind::ConfigPatched => "ConfigPatched",
            EventKind::Unknown => "Unknown",
        }
    }

    /// Resolve an engine tag, falling back to [`EventKind::Unknown`].
    pub fn from_tag(tag: &str) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == tag)
            .unwrap_or(EventKind::Unknown)
    }

    /// Whether the event signals a failure the UI should tint.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            EventKind::TunDeviceError
                | EventKind::ListenerAddFailed
                | EventKind::ListenerAcceptFailed
                | EventKind::ConnectionError
                | EventKind::ConnectError
                | EventKind::DhcpIpv4Conflicted
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        Self::from_tag(&s)
    }
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        Self::from_tag(s)
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_owned()
    }
}

// ---------------------------------------------------------------------------
// Highlighting
// ---------------------------------------------------------------------------

/// Semantic class of a highlighted span inside an event's details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HighlightClass {
    String,
    Key,
    Number,
    Keyword,
}

/// A `(start, length, class)` byte range into [`EventRecord::details`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Highlight {
    pub start: usize,
    pub length: usize,
    pub class: HighlightClass,
    #[serde(default)]
    pub emphasis: bool,
}

impl Highlight {
    pub fn end(&self) -> usize {
        self.start + self.length
    }
}

// ---------------------------------------------------------------------------
// Event records and telemetry pages
// ---------------------------------------------------------------------------

/// One structured engine occurrence, immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Locally unique identifier.
    pub id: String,
    /// Human-facing timestamp (`HH:MM:SS`), from the event time or arrival time.
    pub timestamp: String,
    /// Parsed wall-clock time, absent when the line carried none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<FixedOffset>>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Pretty-printed payload.
    pub details: String,
    #[serde(default)]
    pub highlights: Vec<Highlight>,
}

impl EventRecord {
    /// Substring of `details` covered by `highlight`, if the range is valid.
    pub fn highlighted(&self, highlight: &Highlight) -> Option<&str> {
        self.details.get(highlight.start..highlight.end())
    }
}

/// Reply to `recent_events(since_index)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventsPage {
    pub events: Vec<EventRecord>,
    pub next_index: u64,
}

/// Reply to `recent_logs(since_index)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLinesPage {
    pub lines: Vec<String>,
    pub next_index: u64,
}

/// Reply to `status()`. `identifier` is the engine pid (or 1 for an
/// in-process engine) while running, 0 otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub running: bool,
    pub identifier: i64,
}
