use std::path::{Path, PathBuf};

pub const DAEMON_LABEL: &str = "dev.meshbar.daemon";

pub const DAEMON_STDOUT_LOG: &str = "daemon.log";
pub const DAEMON_STDERR_LOG: &str = "daemon-err.log";
pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const ENGINE_LOG: &str = "engine.log";
pub const ENGINE_STATE: &str = "engine.json";
/// Daemon-owned copy of the config the engine was started with.
pub const ENGINE_CONFIG: &str = "engine.toml";

pub fn socket_path(root: &Path) -> PathBuf {
    root.join(DAEMON_SOCKET)
}

pub fn run_dir(root: &Path) -> PathBuf {
    root.join("run")
}

pub fn logs_dir(root: &Path) -> PathBuf {
    root.join("logs")
}

pub fn stdout_log_path(root: &Path) -> PathBuf {
    logs_dir(root).join(DAEMON_STDOUT_LOG)
}

pub fn stderr_log_path(root: &Path) -> PathBuf {
    logs_dir(root).join(DAEMON_STDERR_LOG)
}

/// File the engine writes and the tailer reads.
pub fn engine_log_path(root: &Path) -> PathBuf {
    logs_dir(root).join(ENGINE_LOG)
}

/// Persisted `{pid, started_at}` and fingerprint of a subprocess engine.
pub fn engine_state_path(root: &Path) -> PathBuf {
    run_dir(root).join(ENGINE_STATE)
}

pub fn launch_daemons_dir() -> PathBuf {
    PathBuf::from("/Library/LaunchDaemons")
}

pub fn launch_agents_dir(home: &Path) -> PathBuf {
    home.join("Library").join("LaunchAgents")
}
