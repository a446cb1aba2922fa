//! Core lifecycle controller: sole owner of the running engine.
//!
//! Holds at most one [`EngineHandle`]. Starting while a handle is live tears
//! the old one down first. Start failures are returned verbatim and never
//! retried here; retry belongs to the client's session controller.
//!
//! Uptime across daemon restarts: a subprocess engine's `{pid, started_at}` is
//! persisted together with the process fingerprint, and re-adopted when the
//! daemon comes back only if the pid still carries that fingerprint. An
//! in-process engine dies with the daemon, so there is nothing to recover.
//!
//! The engine never reads the caller's config path. Each start copies the
//! config to `engine.toml` next to the state file and launches from the copy,
//! which lives until the next stop.

use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use meshbar_core::{EventLog, EventRecord, StatusReply};
use meshbar_tailer::LogTailer;
use serde::{Deserialize, Serialize};

use crate::engine::{Engine, EngineError, EngineLaunch, ProcessIdentity};
use crate::log_rotation::RotationPolicy;
use crate::paths::ENGINE_CONFIG;

/// Proof that the engine is active.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EngineHandle {
    pub identifier: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Unix seconds.
    pub started_at: f64,
}

/// On-disk form of a subprocess engine's handle.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEngine {
    #[serde(flatten)]
    handle: EngineHandle,
    identity: ProcessIdentity,
}

pub struct CoreController {
    engine: Box<dyn Engine>,
    handle: Option<EngineHandle>,
    events: Arc<EventLog<EventRecord>>,
    lines: Arc<EventLog<String>>,
    tailer: LogTailer,
    state_path: PathBuf,
}

impl CoreController {
    pub fn new(
        engine: Box<dyn Engine>,
        events: Arc<EventLog<EventRecord>>,
        lines: Arc<EventLog<String>>,
        log_path: PathBuf,
        state_path: PathBuf,
    ) -> Self {
        Self {
            engine,
            handle: None,
            events,
            lines,
            tailer: LogTailer::new(log_path),
            state_path,
        }
    }

    pub fn events(&self) -> Arc<EventLog<EventRecord>> {
        self.events.clone()
    }

    pub fn lines(&self) -> Arc<EventLog<String>> {
        self.lines.clone()
    }

    pub fn handle(&self) -> Option<&EngineHandle> {
        self.handle.as_ref()
    }

    pub fn log_path(&self) -> &Path {
        self.tailer.path()
    }

    /// Re-adopt a subprocess engine left running by a previous daemon.
    pub fn recover(&mut self) -> Option<EngineHandle> {
        let raw = match fs::read_to_string(&self.state_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return None,
            Err(err) => {
                tracing::warn!(path = %self.state_path.display(), error = %err, "cannot read engine state");
                return None;
            }
        };
        let PersistedEngine { handle: persisted, identity } = match serde_json::from_str(&raw) {
            Ok(persisted) => persisted,
            Err(err) => {
                tracing::warn!(error = %err, "discarding malformed engine state");
                self.forget_persisted();
                return None;
            }
        };

        match persisted.pid {
            Some(pid) if self.engine.adopt(pid, &identity) => {
                tracing::info!(pid, started_at = persisted.started_at, "adopted running engine");
                // Lines already in the log belong to this run; keep reading from the end.
                self.skip_existing_log();
                self.handle = Some(persisted);
                Some(persisted)
            }
            _ => {
                tracing::info!("persisted engine is gone");
                self.forget_persisted();
                None
            }
        }
    }

    /// Start the engine with the config at `config_path`.
    ///
    /// The daemon must be able to read `config_path`; clients stage configs
    /// they hold in sandboxed locations into a world-readable temp file first.
    /// Only the daemon-owned copy is handed to the engine.
    pub fn start(&mut self, config_path: &Path, log_level: &str) -> Result<EngineHandle, EngineError> {
        if self.handle.is_some() {
            tracing::info!("engine already live, restarting");
            self.stop();
        }

        let config_toml =
            fs::read_to_string(config_path).map_err(|source| EngineError::Config {
                path: config_path.to_path_buf(),
                source,
            })?;

        let engine_config = self.write_engine_config(&config_toml)?;
        self.truncate_log()?;
        self.tailer.reset();

        let launch = EngineLaunch {
            config_path: engine_config,
            config_toml,
            log_level: log_level.to_string(),
            log_path: self.tailer.path().to_path_buf(),
        };
        let instance = match self.engine.start(&launch) {
            Ok(instance) => instance,
            Err(err) => {
                tracing::warn!(engine = self.engine.name(), error = %err, "engine start failed");
                self.remove_engine_config();
                return Err(err);
            }
        };

        self.events.clear();
        self.lines.clear();

        let handle = EngineHandle {
            identifier: instance.identifier,
            pid: instance.pid,
            started_at: unix_seconds_now(),
        };
        self.handle = Some(handle);
        if handle.pid.is_some() {
            match instance.identity {
                Some(identity) => self.persist(handle, identity),
                None => tracing::debug!("engine has no fingerprint, state not persisted"),
            }
        }
        tracing::info!(
            engine = self.engine.name(),
            identifier = handle.identifier,
            config = %config_path.display(),
            "engine started",
        );
        Ok(handle)
    }

    /// Tear down the engine. Idempotent and infallible.
    pub fn stop(&mut self) {
        if self.handle.take().is_some() {
            tracing::info!(engine = self.engine.name(), "stopping engine");
        }
        self.engine.stop();
        self.tailer.reset();
        self.forget_persisted();
        self.remove_engine_config();
    }

    /// Ground-truth status; drops the handle if the engine died on its own.
    pub fn status(&mut self) -> StatusReply {
        let Some(handle) = self.handle else {
            return StatusReply::default();
        };
        if self.engine.is_running() {
            return StatusReply {
                running: true,
                identifier: handle.identifier,
            };
        }
        tracing::warn!(identifier = handle.identifier, "engine no longer running, clearing handle");
        self.handle = None;
        self.forget_persisted();
        StatusReply::default()
    }

    /// Start time in unix seconds, or 0 when not running.
    pub fn start_time(&mut self) -> f64 {
        if !self.status().running {
            return 0.0;
        }
        self.handle.map(|h| h.started_at).unwrap_or(0.0)
    }

    pub fn running_info(&mut self) -> Option<String> {
        self.handle?;
        self.engine.running_info()
    }

    /// One tailer pass; pushes results into the shared logs. Returns how many
    /// events were appended.
    pub fn poll_logs(&mut self) -> usize {
        let batch = match self.tailer.poll() {
            Ok(batch) => batch,
            Err(err) => {
                tracing::debug!(error = %err, "engine log poll failed");
                return 0;
            }
        };
        if batch.is_empty() {
            return 0;
        }
        let appended = batch.events.len();
        self.events.extend(batch.events);
        self.lines.extend(batch.lines);
        appended
    }

    /// Size-rotate the engine log under `policy`. Unread output is ingested
    /// first; afterwards the tailer starts over on the emptied file.
    pub fn rotate_log(&mut self, policy: &RotationPolicy) -> std::io::Result<bool> {
        self.poll_logs();
        let rotated = policy.apply(self.tailer.path())?;
        if rotated {
            self.tailer.reset();
        }
        Ok(rotated)
    }

    fn engine_config_path(&self) -> PathBuf {
        self.state_path.with_file_name(ENGINE_CONFIG)
    }

    /// Owner-only copy of the config that the engine launches from.
    fn write_engine_config(&self, config_toml: &str) -> Result<PathBuf, EngineError> {
        let path = self.engine_config_path();
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)?;
            file.write_all(config_toml.as_bytes())
        };
        write().map_err(|source| EngineError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    fn remove_engine_config(&self) {
        let path = self.engine_config_path();
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "cannot remove engine config");
            }
        }
    }

    fn truncate_log(&self) -> Result<(), EngineError> {
        let path = self.tailer.path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| EngineError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map(|_| ())
            .map_err(|source| EngineError::Io {
                path: path.to_path_buf(),
                source,
            })
    }

    fn skip_existing_log(&mut self) {
        // A first poll positions the tailer; its output predates this daemon.
        if let Ok(batch) = self.tailer.poll() {
            tracing::debug!(
                skipped_events = batch.events.len(),
                skipped_lines = batch.lines.len(),
                "skipped engine log written before adoption",
            );
        }
    }

    fn persist(&self, handle: EngineHandle, identity: ProcessIdentity) {
        let persisted = PersistedEngine { handle, identity };
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.state_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let payload = serde_json::to_vec(&persisted).map_err(std::io::Error::other)?;
            fs::write(&self.state_path, payload)
        };
        if let Err(err) = write() {
            tracing::warn!(path = %self.state_path.display(), error = %err, "cannot persist engine state");
        }
    }

    fn forget_persisted(&self) {
        match fs::remove_file(&self.state_path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %self.state_path.display(), error = %err, "cannot remove engine state");
            }
        }
    }
}

pub(crate) fn unix_seconds_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ScriptHandle, ScriptedEngine};
    use tempfile::TempDir;

    const EVENT: &str = r#"2024-05-01T10:00:00Z INFO events: {"time":"2024-05-01T10:00:00Z","event":{"PeerAdded":7}}"#;

    struct Fixture {
        dir: TempDir,
        controller: CoreController,
        script: ScriptHandle,
        events: Arc<EventLog<EventRecord>>,
        lines: Arc<EventLog<String>>,
        config: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().expect("tempdir");
        let (engine, script) = ScriptedEngine::with_handle();
        let events = Arc::new(EventLog::new(50));
        let lines = Arc::new(EventLog::new(50));
        let controller = CoreController::new(
            Box::new(engine),
            events.clone(),
            lines.clone(),
            dir.path().join("logs").join("engine.log"),
            dir.path().join("run").join("engine.json"),
        );
        let config = dir.path().join("net.toml");
        fs::write(&config, "instance_name = \"home\"\n").expect("write config");
        Fixture {
            dir,
            controller,
            script,
            events,
            lines,
            config,
        }
    }

    #[test]
    fn start_creates_handle_and_clears_logs() {
        let mut f = fixture();
        f.events.append(EventRecord {
            id: "stale".into(),
            timestamp: String::new(),
            time: None,
            kind: meshbar_core::EventKind::Unknown,
            details: String::new(),
            highlights: Vec::new(),
        });
        f.lines.append("stale".into());

        let handle = f.controller.start(&f.config, "info").expect("start");
        assert_eq!(handle.identifier, 4242);
        assert_eq!(f.events.global_index(), 0);
        assert_eq!(f.lines.global_index(), 0);
        assert_eq!(f.script.last_config().as_deref(), Some("instance_name = \"home\"\n"));

        let status = f.controller.status();
        assert!(status.running);
        assert_eq!(status.identifier, 4242);
        assert!(f.controller.start_time() > 0.0);
    }

    #[test]
    fn start_while_live_restarts() {
        let mut f = fixture();
        f.controller.start(&f.config, "info").expect("first start");
        f.controller.start(&f.config, "debug").expect("second start");
        assert_eq!(f.script.starts(), 2);
        assert_eq!(f.script.stops(), 1);
    }

    #[test]
    fn start_failure_propagates_verbatim_without_handle() {
        let mut f = fixture();
        f.script.fail_next_starts(1, "address already in use: 0.0.0.0:11010");
        let err = f.controller.start(&f.config, "info").unwrap_err();
        assert_eq!(err.to_string(), "address already in use: 0.0.0.0:11010");
        assert!(f.controller.handle().is_none());
        assert!(!f.controller.status().running);
        assert_eq!(f.controller.start_time(), 0.0);
    }

    #[test]
    fn unreadable_config_is_a_start_error() {
        let mut f = fixture();
        let missing = f.dir.path().join("missing.toml");
        let err = f.controller.start(&missing, "info").unwrap_err();
        assert!(matches!(err, EngineError::Config { .. }), "got: {err}");
        assert_eq!(f.script.starts(), 0);
    }

    #[test]
    fn stop_is_idempotent() {
        let mut f = fixture();
        f.controller.stop();
        f.controller.start(&f.config, "info").expect("start");
        f.controller.stop();
        f.controller.stop();
        assert!(!f.controller.status().running);
        assert_eq!(f.script.stops(), 1);
    }

    #[test]
    fn crash_is_observed_on_next_status() {
        let mut f = fixture();
        f.controller.start(&f.config, "info").expect("start");
        f.script.crash();
        assert!(!f.controller.status().running);
        assert!(f.controller.handle().is_none());
        assert!(f.controller.running_info().is_none());
    }

    #[test]
    fn poll_logs_feeds_event_and_line_logs() {
        let mut f = fixture();
        f.script
            .set_startup_lines(["engine booting", EVENT]);
        f.controller.start(&f.config, "info").expect("start");

        assert_eq!(f.controller.poll_logs(), 1);
        assert_eq!(f.events.query(0).items[0].kind, meshbar_core::EventKind::PeerAdded);
        assert_eq!(f.lines.query(0).items, vec!["engine booting".to_string()]);

        f.script.emit(EVENT).expect("emit");
        assert_eq!(f.controller.poll_logs(), 1);
        assert_eq!(f.events.global_index(), 2);
        assert_eq!(f.controller.poll_logs(), 0);
    }

    #[test]
    fn restart_does_not_reingest_previous_log() {
        let mut f = fixture();
        f.script.set_startup_lines([EVENT]);
        f.controller.start(&f.config, "info").expect("start");
        f.controller.poll_logs();
        f.script.emit(EVENT).expect("emit");
        f.controller.poll_logs();
        assert_eq!(f.events.global_index(), 2);

        f.controller.start(&f.config, "info").expect("restart");
        f.controller.poll_logs();
        assert_eq!(f.events.global_index(), 1, "only the new run's startup event");
    }

    #[test]
    fn rotation_keeps_events_flowing() {
        let mut f = fixture();
        f.script.set_startup_lines([EVENT, EVENT, EVENT]);
        f.controller.start(&f.config, "info").expect("start");

        let policy = RotationPolicy {
            max_bytes: 1,
            keep: 2,
        };
        assert!(f.controller.rotate_log(&policy).expect("rotate"));
        assert_eq!(f.events.global_index(), 3, "unread events ingested before rotation");

        // Shorter than what was read before the rotation.
        f.script.emit("short line").expect("emit");
        f.script.emit(EVENT).expect("emit");
        assert_eq!(f.controller.poll_logs(), 1);
        assert_eq!(f.events.global_index(), 4);
        assert_eq!(f.lines.query(0).items.last().map(String::as_str), Some("short line"));
    }

    #[test]
    fn malformed_persisted_state_is_discarded() {
        let mut f = fixture();
        let state = f.dir.path().join("run").join("engine.json");
        fs::create_dir_all(state.parent().expect("parent")).expect("mkdir");
        fs::write(&state, "{not json").expect("write");
        assert!(f.controller.recover().is_none());
        assert!(!state.exists());
    }

    #[test]
    fn persisted_pid_that_cannot_be_adopted_is_discarded() {
        let mut f = fixture();
        let state = f.dir.path().join("run").join("engine.json");
        fs::create_dir_all(state.parent().expect("parent")).expect("mkdir");
        fs::write(
            &state,
            r#"{"identifier":77,"pid":77,"started_at":1700000000.0,"identity":{"started":1700000000,"exe":null}}"#,
        )
        .expect("write");
        // The scripted engine cannot adopt processes.
        assert!(f.controller.recover().is_none());
        assert!(!state.exists());
    }

    #[test]
    fn persisted_pid_without_fingerprint_is_discarded() {
        let mut f = fixture();
        let state = f.dir.path().join("run").join("engine.json");
        fs::create_dir_all(state.parent().expect("parent")).expect("mkdir");
        fs::write(&state, r#"{"identifier":77,"pid":77,"started_at":1700000000.0}"#)
            .expect("write");
        assert!(f.controller.recover().is_none());
        assert!(!state.exists());
    }

    #[test]
    fn engine_launches_from_a_daemon_owned_config_copy() {
        use std::os::unix::fs::PermissionsExt;

        let mut f = fixture();
        f.controller.start(&f.config, "info").expect("start");
        // Clients delete their staged file right after the start reply.
        fs::remove_file(&f.config).expect("remove staged config");

        let copy = f.dir.path().join("run").join("engine.toml");
        assert_eq!(f.script.last_config_path(), Some(copy.clone()));
        assert_eq!(
            fs::read_to_string(&copy).expect("read copy"),
            "instance_name = \"home\"\n"
        );
        let mode = fs::metadata(&copy).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        f.controller.stop();
        assert!(!copy.exists());
    }

    #[test]
    fn failed_start_leaves_no_config_copy() {
        let mut f = fixture();
        f.script.fail_next_starts(1, "bad config");
        f.controller.start(&f.config, "info").unwrap_err();
        assert!(!f.dir.path().join("run").join("engine.toml").exists());
    }
}
