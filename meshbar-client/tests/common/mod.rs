#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use meshbar_core::{DaemonSettings, EventLog};
use meshbar_daemon::engine::{ScriptHandle, ScriptedEngine};
use meshbar_daemon::paths::{engine_log_path, engine_state_path, socket_path};
use meshbar_daemon::{CoreController, Daemon, DaemonState};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub const PEER_ADDED: &str = r#"2024-05-01T10:00:00+00:00 INFO {"time":"2024-05-01T10:00:00+00:00","event":{"PeerAdded":{"peer_id":7}}}"#;

/// A daemon backed by a scripted engine, serving `<root>/daemon.sock`.
pub struct TestDaemon {
    pub script: ScriptHandle,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl TestDaemon {
    pub fn spawn(runtime: &Handle, root: &Path, version: &str) -> Self {
        let (engine, script) = ScriptedEngine::with_handle();
        let controller = CoreController::new(
            Box::new(engine),
            Arc::new(EventLog::new(100)),
            Arc::new(EventLog::new(100)),
            engine_log_path(root),
            engine_state_path(root),
        );
        let settings = DaemonSettings {
            tail_interval_ms: 50,
            quit_grace_ms: 50,
            ..DaemonSettings::default()
        };
        let daemon = Daemon::new(
            socket_path(root),
            DaemonState::new(controller, settings, version),
        );
        let shutdown = daemon.shutdown_handle();
        let task = runtime.spawn(async move {
            daemon.run().await.expect("test daemon run");
        });
        Self {
            script,
            shutdown,
            task,
        }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

pub async fn wait_for_socket(root: &Path) {
    let socket = socket_path(root);
    for _ in 0..200 {
        if tokio::net::UnixStream::connect(&socket).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("socket never came up at {}", socket.display());
}
