//! Typed view of the daemon's calls.
//!
//! Implementors only provide [`ControlPlane::call`]; the typed methods decode
//! the reply payloads on top of it.

use std::path::Path;

use async_trait::async_trait;
use meshbar_core::{EventsPage, LogLinesPage, StatusReply};
use meshbar_daemon::Command;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ClientError;

#[derive(Deserialize)]
struct Started {
    identifier: i64,
}

#[derive(Deserialize)]
struct StartTime {
    timestamp: f64,
}

#[derive(Deserialize)]
struct Version {
    version: String,
}

#[derive(Deserialize)]
struct RunningInfo {
    json: Option<String>,
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn call(&self, command: Command) -> Result<Value, ClientError>;

    /// Start the engine; returns its identifier.
    async fn start(&self, config_path: &Path, log_level: &str) -> Result<i64, ClientError> {
        let reply: Started = decode(
            self.call(Command::Start {
                config_path: config_path.to_path_buf(),
                log_level: log_level.to_string(),
            })
            .await?,
        )?;
        Ok(reply.identifier)
    }

    async fn stop(&self) -> Result<(), ClientError> {
        self.call(Command::Stop).await.map(|_| ())
    }

    async fn status(&self) -> Result<StatusReply, ClientError> {
        decode(self.call(Command::Status).await?)
    }

    /// Unix seconds; 0 when not running.
    async fn start_time(&self) -> Result<f64, ClientError> {
        let reply: StartTime = decode(self.call(Command::StartTime).await?)?;
        Ok(reply.timestamp)
    }

    async fn version(&self) -> Result<String, ClientError> {
        let reply: Version = decode(self.call(Command::Version).await?)?;
        Ok(reply.version)
    }

    async fn quit(&self) -> Result<(), ClientError> {
        self.call(Command::Quit).await.map(|_| ())
    }

    async fn recent_events(&self, since_index: u64) -> Result<EventsPage, ClientError> {
        decode(self.call(Command::RecentEvents { since_index }).await?)
    }

    async fn recent_logs(&self, since_index: u64) -> Result<LogLinesPage, ClientError> {
        decode(self.call(Command::RecentLogs { since_index }).await?)
    }

    /// The engine's opaque running-info JSON, passed through unparsed.
    async fn running_info(&self) -> Result<Option<String>, ClientError> {
        let reply: RunningInfo = decode(self.call(Command::RunningInfo).await?)?;
        Ok(reply.json)
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ClientError> {
    serde_json::from_value(value).map_err(|err| ClientError::Protocol(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Canned(Value);

    #[async_trait]
    impl ControlPlane for Canned {
        async fn call(&self, _command: Command) -> Result<Value, ClientError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn typed_methods_decode_payloads() {
        let status = Canned(json!({"running": true, "identifier": 7}))
            .status()
            .await
            .expect("status");
        assert!(status.running);
        assert_eq!(status.identifier, 7);

        let info = Canned(json!({"json": null})).running_info().await.expect("info");
        assert!(info.is_none());

        let page = Canned(json!({"events": [], "next_index": 12}))
            .recent_events(3)
            .await
            .expect("page");
        assert_eq!(page.next_index, 12);
    }

    #[tokio::test]
    async fn unexpected_payload_is_a_protocol_error() {
        let err = Canned(json!({"nope": 1})).version().await.unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)), "got: {err}");
    }
}
