//! Explicit settings objects for the daemon and the client.
//!
//! Both are read once from `settings.yaml` under the state root and passed
//! into constructors; nothing looks settings up ambiently at call time.
//! A missing file yields defaults; a missing field yields its default.

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::event_log::DEFAULT_EVENT_CAPACITY;

pub const SETTINGS_FILE: &str = "settings.yaml";

/// State root used by the privileged system-domain daemon.
pub const SYSTEM_STATE_ROOT: &str = "/Library/Application Support/meshbar";

/// Where the service is registered with launchd.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceDomain {
    /// `/Library/LaunchDaemons`, runs as root. Needed to create the TUN device.
    #[default]
    System,
    /// `~/Library/LaunchAgents`, runs as the current user. Development only.
    User,
}

impl ServiceDomain {
    /// State directory holding the socket, logs and runtime files.
    pub fn state_root(&self) -> Result<PathBuf, CoreError> {
        match self {
            ServiceDomain::System => Ok(PathBuf::from(SYSTEM_STATE_ROOT)),
            ServiceDomain::User => dirs::home_dir()
                .map(|home| home.join(".meshbar"))
                .ok_or(CoreError::HomeNotFound),
        }
    }
}

impl fmt::Display for ServiceDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceDomain::System => f.write_str("system"),
            ServiceDomain::User => f.write_str("user"),
        }
    }
}

impl FromStr for ServiceDomain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Ok(ServiceDomain::System),
            "user" => Ok(ServiceDomain::User),
            other => Err(format!(
                "unknown service domain '{other}'; expected: system, user"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Paths to the engine artifacts. Library is preferred over binary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Dynamic library exposing the engine's C ABI.
    pub library_path: Option<PathBuf>,
    /// Standalone engine executable.
    pub binary_path: Option<PathBuf>,
    /// Companion CLI used to fetch running info from a subprocess engine.
    pub cli_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub event_capacity: usize,
    pub log_line_capacity: usize,
    pub tail_interval_ms: u64,
    /// Delay between acknowledging `quit` and exiting.
    pub quit_grace_ms: u64,
    /// Mode applied to the control socket after bind.
    pub socket_mode: u32,
    pub engine: EngineSettings,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            event_capacity: DEFAULT_EVENT_CAPACITY,
            log_line_capacity: 500,
            tail_interval_ms: 500,
            quit_grace_ms: 300,
            socket_mode: 0o666,
            engine: EngineSettings::default(),
        }
    }
}

impl DaemonSettings {
    pub fn tail_interval(&self) -> Duration {
        Duration::from_millis(self.tail_interval_ms.max(50))
    }

    pub fn quit_grace(&self) -> Duration {
        Duration::from_millis(self.quit_grace_ms)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub log_level: String,
    /// Retries after the first failed start attempt.
    pub max_start_retries: u32,
    pub retry_backoff_ms: u64,
    /// Pause between the forced stop and the first start, so the OS can
    /// release ports and handles held by a previous instance.
    pub stop_grace_ms: u64,
    pub poll_interval_ms: u64,
    pub call_timeout_ms: u64,
    /// How long to wait for a freshly installed service to answer.
    pub service_ready_timeout_ms: u64,
    /// Local history cap for events held by the session controller.
    pub event_capacity: usize,
    pub domain: ServiceDomain,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            max_start_retries: 3,
            retry_backoff_ms: 2_000,
            stop_grace_ms: 1_500,
            poll_interval_ms: 1_000,
            call_timeout_ms: 5_000,
            service_ready_timeout_ms: 5_000,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            domain: ServiceDomain::default(),
        }
    }
}

impl ClientSettings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(100))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn service_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.service_ready_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

/// Top-level shape of `settings.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub daemon: DaemonSettings,
    pub client: ClientSettings,
}

impl Settings {
    /// Load `<root>/settings.yaml`, or defaults when the file does not exist.
    pub fn load(root: &Path) -> Result<Self, CoreError> {
        Self::load_from(&root.join(SETTINGS_FILE))
    }

    pub fn load_from(path: &Path) -> Result<Self, CoreError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(CoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&raw).map_err(|source| CoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
