//! Newline-delimited JSON wire format between client and daemon.
//!
//! One request or response object per line. Responses echo the request `id`
//! so a client can keep several calls in flight on one connection.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operations the daemon exposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Start {
        config_path: PathBuf,
        log_level: String,
    },
    Stop,
    Status,
    StartTime,
    Version,
    Quit,
    RecentEvents {
        since_index: u64,
    },
    RecentLogs {
        since_index: u64,
    },
    RunningInfo,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start { .. } => "start",
            Command::Stop => "stop",
            Command::Status => "status",
            Command::StartTime => "start_time",
            Command::Version => "version",
            Command::Quit => "quit",
            Command::RecentEvents { .. } => "recent_events",
            Command::RecentLogs { .. } => "recent_logs",
            Command::RunningInfo => "running_info",
        }
    }

    /// Whether the call changes engine state. Telemetry reads are not control calls.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Command::Start { .. } | Command::Stop | Command::Quit
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub cmd: Command,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: u64, data: Value) -> Self {
        Self {
            id,
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    /// Payload on success, error message otherwise. A failure never comes
    /// back without an explanation.
    pub fn into_result(self) -> Result<Value, String> {
        if self.ok {
            Ok(self.data.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()))
        }
    }
}
