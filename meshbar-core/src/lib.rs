//! meshbar core library: domain types, the indexed event buffer, settings, errors.
//!
//! Public API surface:
//! - [`types`]: event records, highlight ranges, telemetry pages
//! - [`event_log`]: [`EventLog`], the bounded monotonically-indexed buffer
//! - [`settings`]: daemon/client settings loaded from `settings.yaml`
//! - [`error`]: [`CoreError`]

pub mod error;
pub mod event_log;
pub mod settings;
pub mod types;

pub use error::CoreError;
pub use event_log::{EventLog, Page};
pub use settings::{ClientSettings, DaemonSettings, EngineSettings, ServiceDomain, Settings};
pub use types::{
    EventKind, EventRecord, EventsPage, Highlight, HighlightClass, LogLinesPage, StatusReply,
};

/// Protocol version compiled into both the client and the privileged daemon.
///
/// The client compares this against the daemon's `version` reply before every
/// control call; any difference forces a reinstall of the service.
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");
