use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, Mutex};

use meshbar_core::{
    DaemonSettings, EventLog, EventRecord, EventsPage, LogLinesPage, Settings, SERVICE_VERSION,
};

use crate::controller::CoreController;
use crate::engine::EngineSelector;
use crate::error::{io_err, DaemonError};
use crate::log_rotation::{rotate_daemon_logs, RotationPolicy};
use crate::paths::{engine_log_path, engine_state_path, logs_dir, run_dir, socket_path};
use crate::protocol::{Command, Request, Response};

/// Everything request handlers and the tail timer share.
///
/// The controller sits behind an async mutex: control calls and tailer passes
/// take turns. Engine calls block (startup waits, SIGTERM grace, FFI), so
/// they run on the blocking pool with the lock held. Telemetry queries only
/// touch the event logs, which carry their own lock, so they never wait on a
/// slow engine start.
pub struct DaemonState {
    controller: Arc<Mutex<CoreController>>,
    events: Arc<EventLog<EventRecord>>,
    lines: Arc<EventLog<String>>,
    settings: DaemonSettings,
    version: String,
}

impl DaemonState {
    pub fn new(controller: CoreController, settings: DaemonSettings, version: impl Into<String>) -> Self {
        Self {
            events: controller.events(),
            lines: controller.lines(),
            controller: Arc::new(Mutex::new(controller)),
            settings,
            version: version.into(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Run `op` against the controller on the blocking pool.
    async fn with_controller<T, F>(&self, op: F) -> Result<T, String>
    where
        F: FnOnce(&mut CoreController) -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut guard = self.controller.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || op(&mut *guard))
            .await
            .map_err(|err| format!("controller task failed: {err}"))
    }

    /// Execute one command. `Err` carries the message sent back to the client.
    pub async fn dispatch(
        &self,
        command: Command,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<Value, String> {
        if command.is_control() {
            tracing::info!(op = command.name(), "control call");
        } else {
            tracing::trace!(op = command.name(), "telemetry call");
        }

        match command {
            Command::Start {
                config_path,
                log_level,
            } => self
                .with_controller(move |controller| controller.start(&config_path, &log_level))
                .await?
                .map(|handle| json!({ "started": true, "identifier": handle.identifier }))
                .map_err(|err| err.to_string()),
            Command::Stop => {
                self.with_controller(CoreController::stop).await?;
                Ok(json!({ "stopped": true }))
            }
            Command::Status => {
                let status = self.with_controller(CoreController::status).await?;
                serde_json::to_value(status).map_err(|err| err.to_string())
            }
            Command::StartTime => {
                let timestamp = self.with_controller(CoreController::start_time).await?;
                Ok(json!({ "timestamp": timestamp }))
            }
            Command::Version => Ok(json!({ "version": self.version })),
            Command::Quit => {
                self.with_controller(CoreController::stop).await?;
                let shutdown = shutdown.clone();
                let grace = self.settings.quit_grace();
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    tracing::info!("quit requested, shutting down daemon");
                    let _ = shutdown.send(());
                });
                Ok(json!({ "quitting": true }))
            }
            Command::RecentEvents { since_index } => {
                let page = self.events.query(since_index);
                serde_json::to_value(EventsPage {
                    events: page.items,
                    next_index: page.next_index,
                })
                .map_err(|err| err.to_string())
            }
            Command::RecentLogs { since_index } => {
                let page = self.lines.query(since_index);
                serde_json::to_value(LogLinesPage {
                    lines: page.items,
                    next_index: page.next_index,
                })
                .map_err(|err| err.to_string())
            }
            Command::RunningInfo => {
                let info = self.with_controller(CoreController::running_info).await?;
                Ok(json!({ "json": info }))
            }
        }
    }
}

/// A daemon bound to one socket path. Single instance per process.
pub struct Daemon {
    socket: PathBuf,
    state: Arc<DaemonState>,
    shutdown: broadcast::Sender<()>,
    rotate_logs_under: Option<PathBuf>,
}

impl Daemon {
    pub fn new(socket: PathBuf, state: DaemonState) -> Self {
        let (shutdown, _) = broadcast::channel(16);
        Self {
            socket,
            state: Arc::new(state),
            shutdown,
            rotate_logs_under: None,
        }
    }

    /// Periodically size-rotate the daemon's stdout/stderr logs under `root`
    /// and the engine log.
    pub fn with_log_rotation(mut self, root: PathBuf) -> Self {
        self.rotate_logs_under = Some(root);
        self
    }

    pub fn state(&self) -> Arc<DaemonState> {
        self.state.clone()
    }

    /// Sending on this stops every daemon task.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    pub async fn run(self) -> Result<(), DaemonError> {
        let Daemon {
            socket,
            state,
            shutdown: shutdown_tx,
            rotate_logs_under,
        } = self;

        let socket_handle = {
            let shutdown = shutdown_tx.clone();
            let state = state.clone();
            tokio::spawn(async move {
                let result =
                    socket_server_task(socket, state, shutdown.clone(), shutdown.subscribe()).await;
                let _ = shutdown.send(());
                result
            })
        };

        let tail_handle = {
            let shutdown = shutdown_tx.clone();
            let state = state.clone();
            tokio::spawn(async move {
                let result = tail_task(state, shutdown.subscribe()).await;
                let _ = shutdown.send(());
                result
            })
        };

        let rotation_handle = {
            let shutdown = shutdown_tx.clone();
            let state = state.clone();
            tokio::spawn(async move {
                match rotate_logs_under {
                    Some(root) => log_rotation_task(root, state, shutdown.subscribe()).await,
                    None => Ok(()),
                }
            })
        };

        let signal_handle = {
            let shutdown = shutdown_tx.clone();
            tokio::spawn(async move { signal_task(shutdown).await })
        };

        let (socket_result, tail_result, rotation_result, signal_result) =
            tokio::join!(socket_handle, tail_handle, rotation_handle, signal_handle);

        handle_join("socket_server", socket_result)?;
        handle_join("log_tailer", tail_result)?;
        handle_join("log_rotation", rotation_result)?;
        handle_join("signal_handler", signal_result)?;
        Ok(())
    }
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(root: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(root.to_path_buf()))
}

/// Run the production daemon rooted at `root`.
pub async fn run(root: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&root)?;
    let settings = Settings::load(&root)?.daemon;

    let events = Arc::new(EventLog::new(settings.event_capacity));
    let lines = Arc::new(EventLog::new(settings.log_line_capacity));
    let mut controller = CoreController::new(
        Box::new(EngineSelector::new(settings.engine.clone())),
        events,
        lines,
        engine_log_path(&root),
        engine_state_path(&root),
    );
    controller.recover();

    tracing::info!(
        version = SERVICE_VERSION,
        root = %root.display(),
        "meshbar daemon starting",
    );
    let state = DaemonState::new(controller, settings, SERVICE_VERSION);
    Daemon::new(socket_path(&root), state)
        .with_log_rotation(root)
        .run()
        .await
}

async fn socket_server_task(
    socket: PathBuf,
    state: Arc<DaemonState>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    if let Some(parent) = socket.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket, state.settings.socket_mode)?;
    tracing::info!(socket = %socket.display(), "listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let state = state.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, state, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    state: Arc<DaemonState>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut shutdown_rx = shutdown_tx.subscribe();

    // Requests run concurrently; responses funnel through one writer.
    let (response_tx, mut response_rx) = mpsc::channel::<Response>(64);
    let writer_handle = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(response) = response_rx.recv().await {
            write_response(&mut writer, &response).await?;
        }
        Ok::<(), DaemonError>(())
    });

    loop {
        let line = tokio::select! {
            _ = shutdown_rx.recv() => break,
            line = lines.next_line() => line.map_err(|e| io_err("daemon socket read", e))?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                let _ = response_tx
                    .send(Response::error(0, format!("invalid request JSON: {err}")))
                    .await;
                continue;
            }
        };

        let state = state.clone();
        let response_tx = response_tx.clone();
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let id = request.id;
            let response = match state.dispatch(request.cmd, &shutdown).await {
                Ok(data) => Response::ok(id, data),
                Err(message) => Response::error(id, message),
            };
            let _ = response_tx.send(response).await;
        });
    }

    drop(response_tx);
    writer_handle
        .await
        .map_err(|err| DaemonError::Protocol(format!("socket writer join error: {err}")))?
}

async fn tail_task(
    state: Arc<DaemonState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(state.settings.tail_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                match state.with_controller(CoreController::poll_logs).await {
                    Ok(0) => {}
                    Ok(appended) => tracing::debug!(appended, "engine events ingested"),
                    Err(err) => tracing::warn!(error = %err, "engine log poll failed"),
                }
            }
        }
    }
    Ok(())
}

async fn log_rotation_task(
    root: PathBuf,
    state: Arc<DaemonState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await; // consume the first immediate tick

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let root = root.clone();
                tokio::task::spawn_blocking(move || rotate_daemon_logs(&root))
                    .await
                    .ok(); // rotation errors are logged inside rotate_daemon_logs

                let policy = RotationPolicy::default();
                match state.with_controller(move |c| c.rotate_log(&policy)).await {
                    Ok(Ok(true)) => tracing::info!("engine log rotated"),
                    Ok(Ok(false)) => {}
                    Ok(Err(err)) => tracing::warn!(error = %err, "engine log rotation failed"),
                    Err(err) => tracing::warn!(error = %err, "engine log rotation failed"),
                }
            }
        }
    }
    Ok(())
}

async fn signal_task(shutdown: broadcast::Sender<()>) -> Result<(), DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut shutdown_rx = shutdown.subscribe();
    let mut terminate = signal(SignalKind::terminate())
        .map_err(|err| DaemonError::Protocol(format!("SIGTERM handler failed: {err}")))?;

    tokio::select! {
        _ = shutdown_rx.recv() => Ok(()),
        _ = terminate.recv() => {
            // launchd bootout. A subprocess engine keeps running and is
            // re-adopted by the next daemon.
            tracing::info!("received SIGTERM, shutting down daemon");
            let _ = shutdown.send(());
            Ok(())
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    tracing::info!("received ctrl-c, shutting down daemon");
                    let _ = shutdown.send(());
                    Ok(())
                }
                Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
            }
        }
    }
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(root: &Path) -> Result<(), DaemonError> {
    for dir in [root.to_path_buf(), run_dir(root), logs_dir(root)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &Response,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// Daemon logging: `info` unless `RUST_LOG` says otherwise.
pub fn init_tracing() {
    init_tracing_with("info");
}

/// Install the global subscriber on stderr. `MESHBAR_LOG_FORMAT=json` switches
/// to one JSON object per line.
pub fn init_tracing_with(default_level: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let json = std::env::var("MESHBAR_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn set_socket_permissions(path: &Path, mode: u32) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| io_err(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ScriptHandle, ScriptedEngine};
    use tempfile::TempDir;

    fn state(dir: &TempDir) -> (DaemonState, ScriptHandle) {
        let (engine, script) = ScriptedEngine::with_handle();
        let controller = CoreController::new(
            Box::new(engine),
            Arc::new(EventLog::new(10)),
            Arc::new(EventLog::new(10)),
            dir.path().join("engine.log"),
            dir.path().join("engine.json"),
        );
        let settings = DaemonSettings {
            quit_grace_ms: 10,
            ..DaemonSettings::default()
        };
        (DaemonState::new(controller, settings, "9.9.9"), script)
    }

    #[tokio::test]
    async fn dispatch_reports_version_and_idle_status() {
        let dir = TempDir::new().expect("tempdir");
        let (state, _script) = state(&dir);
        let (shutdown, _) = broadcast::channel(1);

        let version = state.dispatch(Command::Version, &shutdown).await.expect("version");
        assert_eq!(version, json!({"version": "9.9.9"}));

        let status = state.dispatch(Command::Status, &shutdown).await.expect("status");
        assert_eq!(status, json!({"running": false, "identifier": 0}));

        let start_time = state.dispatch(Command::StartTime, &shutdown).await.expect("start_time");
        assert_eq!(start_time, json!({"timestamp": 0.0}));
    }

    #[tokio::test]
    async fn dispatch_start_error_carries_message() {
        let dir = TempDir::new().expect("tempdir");
        let (state, script) = state(&dir);
        let (shutdown, _) = broadcast::channel(1);
        let config = dir.path().join("net.toml");
        fs::write(&config, "").expect("config");
        script.fail_next_starts(1, "tun device busy");

        let err = state
            .dispatch(
                Command::Start {
                    config_path: config,
                    log_level: "info".into(),
                },
                &shutdown,
            )
            .await
            .unwrap_err();
        assert_eq!(err, "tun device busy");
    }

    #[tokio::test(start_paused = true)]
    async fn quit_stops_engine_then_signals_shutdown_after_grace() {
        let dir = TempDir::new().expect("tempdir");
        let (state, script) = state(&dir);
        let (shutdown, mut shutdown_rx) = broadcast::channel(1);
        let config = dir.path().join("net.toml");
        fs::write(&config, "").expect("config");

        state
            .dispatch(
                Command::Start {
                    config_path: config,
                    log_level: "info".into(),
                },
                &shutdown,
            )
            .await
            .expect("start");

        let ack = state.dispatch(Command::Quit, &shutdown).await.expect("quit");
        assert_eq!(ack, json!({"quitting": true}));
        assert!(!script.is_running());
        assert!(shutdown_rx.try_recv().is_err(), "shutdown must wait for the grace delay");

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_rx.recv().await.expect("shutdown after grace");
    }

    #[tokio::test]
    async fn slow_engine_start_does_not_stall_other_requests() {
        let dir = TempDir::new().expect("tempdir");
        let (state, script) = state(&dir);
        let state = Arc::new(state);
        let (shutdown, _) = broadcast::channel(1);
        let config = dir.path().join("net.toml");
        fs::write(&config, "").expect("config");
        script.set_start_delay(Duration::from_millis(800));

        let began = std::time::Instant::now();
        let start = {
            let state = state.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                state
                    .dispatch(
                        Command::Start {
                            config_path: config,
                            log_level: "info".into(),
                        },
                        &shutdown,
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let version = state.dispatch(Command::Version, &shutdown).await.expect("version");
        assert_eq!(version, json!({"version": "9.9.9"}));
        state
            .dispatch(Command::RecentEvents { since_index: 0 }, &shutdown)
            .await
            .expect("events");
        assert!(
            began.elapsed() < Duration::from_millis(400),
            "telemetry waited {:?} on the engine start",
            began.elapsed()
        );
        assert!(!start.is_finished());

        let started = start.await.expect("join").expect("start");
        assert_eq!(started["identifier"], json!(4242));
    }

    #[test]
    fn stale_socket_file_is_removed() {
        let dir = TempDir::new().expect("tempdir");
        let socket = dir.path().join("daemon.sock");
        fs::write(&socket, b"").expect("stale file");
        prepare_socket_for_bind(&socket).expect("prepare");
        assert!(!socket.exists());
    }
}
