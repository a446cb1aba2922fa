//! External engine executable, supervised as a child process.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use super::{Engine, EngineError, EngineInstance, EngineLaunch, ProcessIdentity};

/// How long a fresh child must survive before start counts as successful.
const STARTUP_SETTLE: Duration = Duration::from_millis(200);
/// Grace period between SIGTERM and SIGKILL.
const STOP_TIMEOUT: Duration = Duration::from_secs(3);
const STOP_POLL: Duration = Duration::from_millis(50);

pub struct ProcessEngine {
    binary: PathBuf,
    cli: Option<PathBuf>,
    child: Option<Child>,
    /// Engine started by a previous daemon instance.
    adopted: Option<(u32, ProcessIdentity)>,
}

impl ProcessEngine {
    pub fn new(binary: PathBuf, cli: Option<PathBuf>) -> Self {
        Self {
            binary,
            cli,
            child: None,
            adopted: None,
        }
    }

    fn stop_child(child: &mut Child) {
        let pid = Pid::from_raw(child.id() as i32);
        if let Err(err) = kill(pid, Signal::SIGTERM) {
            tracing::debug!(pid = child.id(), error = %err, "SIGTERM failed");
        }
        let deadline = Instant::now() + STOP_TIMEOUT;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => sleep(STOP_POLL),
                Err(_) => break,
            }
        }
        tracing::warn!(pid = child.id(), "engine ignored SIGTERM, killing");
        let _ = child.kill();
        let _ = child.wait();
    }

    /// Signals go out only while `pid` still carries `identity`.
    fn stop_adopted(pid: u32, identity: &ProcessIdentity) {
        if !identity.matches(pid) {
            tracing::warn!(pid, "adopted engine is gone, pid not signalled");
            return;
        }
        let raw = Pid::from_raw(pid as i32);
        if kill(raw, Signal::SIGTERM).is_err() {
            return;
        }
        let deadline = Instant::now() + STOP_TIMEOUT;
        while Instant::now() < deadline {
            if !identity.matches(pid) {
                return;
            }
            sleep(STOP_POLL);
        }
        if identity.matches(pid) {
            let _ = kill(raw, Signal::SIGKILL);
        }
    }
}

impl Engine for ProcessEngine {
    fn name(&self) -> &'static str {
        "process"
    }

    fn start(&mut self, launch: &EngineLaunch) -> Result<EngineInstance, EngineError> {
        if let Some(parent) = launch.log_path.parent() {
            fs::create_dir_all(parent).map_err(|source| EngineError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&launch.log_path)
            .map_err(|source| EngineError::Io {
                path: launch.log_path.clone(),
                source,
            })?;
        let log_err = log.try_clone().map_err(|source| EngineError::Io {
            path: launch.log_path.clone(),
            source,
        })?;

        let mut child = Command::new(&self.binary)
            .arg("--config-file")
            .arg(&launch.config_path)
            .arg("--console-log-level")
            .arg(&launch.log_level)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .spawn()
            .map_err(|err| {
                EngineError::Start(format!("failed to launch {}: {err}", self.binary.display()))
            })?;

        sleep(STARTUP_SETTLE);
        if let Ok(Some(status)) = child.try_wait() {
            return Err(EngineError::Start(format!(
                "engine exited during startup ({status}); see {}",
                launch.log_path.display()
            )));
        }

        let pid = child.id();
        let identity = ProcessIdentity::of(pid);
        if identity.is_none() {
            tracing::warn!(pid, "could not fingerprint engine process; it will not be re-adopted");
        }
        self.child = Some(child);
        self.adopted = None;
        Ok(EngineInstance {
            identifier: i64::from(pid),
            pid: Some(pid),
            identity,
        })
    }

    fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            Self::stop_child(&mut child);
        }
        if let Some((pid, identity)) = self.adopted.take() {
            Self::stop_adopted(pid, &identity);
        }
    }

    fn is_running(&mut self) -> bool {
        if let Some(child) = self.child.as_mut() {
            return match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    tracing::warn!(%status, "engine process exited");
                    self.child = None;
                    false
                }
                Err(_) => false,
            };
        }
        if let Some((pid, identity)) = &self.adopted {
            if identity.matches(*pid) {
                return true;
            }
            tracing::warn!(pid = *pid, "adopted engine process is gone");
            self.adopted = None;
        }
        false
    }

    fn running_info(&mut self) -> Option<String> {
        let cli = self.cli.as_ref()?;
        let output = Command::new(cli)
            .args(["-o", "json", "node"])
            .stdin(Stdio::null())
            .output()
            .map_err(|err| tracing::debug!(error = %err, "engine cli failed to launch"))
            .ok()?;
        if !output.status.success() {
            tracing::debug!(status = %output.status, "engine cli returned failure");
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!stdout.is_empty()).then_some(stdout)
    }

    fn adopt(&mut self, pid: u32, identity: &ProcessIdentity) -> bool {
        if kill(Pid::from_raw(pid as i32), None).is_err() {
            return false;
        }
        match ProcessIdentity::of(pid) {
            Some(current) if current == *identity => {
                self.adopted = Some((pid, current));
                true
            }
            current => {
                tracing::warn!(
                    pid,
                    expected = ?identity,
                    found = ?current,
                    "pid belongs to a different process now, not adopting"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_binary_reports_launch_failure() {
        let dir = TempDir::new().expect("tempdir");
        let mut engine = ProcessEngine::new(dir.path().join("no-such-engine"), None);
        let launch = EngineLaunch {
            config_path: dir.path().join("net.toml"),
            config_toml: String::new(),
            log_level: "info".into(),
            log_path: dir.path().join("logs").join("engine.log"),
        };
        let err = engine.start(&launch).unwrap_err();
        assert!(err.to_string().contains("failed to launch"), "got: {err}");
        assert!(!engine.is_running());
    }

    fn own_identity() -> ProcessIdentity {
        ProcessIdentity::of(std::process::id()).expect("own process is visible")
    }

    #[test]
    fn adopting_a_dead_pid_fails() {
        let mut engine = ProcessEngine::new(PathBuf::from("/usr/bin/true"), None);
        // Far above any pid_max, so never a live process.
        assert!(!engine.adopt(999_999_999, &own_identity()));
        assert!(!engine.is_running());
    }

    #[test]
    fn adopting_a_live_pid_reports_running() {
        let mut engine = ProcessEngine::new(PathBuf::from("/usr/bin/true"), None);
        assert!(engine.adopt(std::process::id(), &own_identity()));
        assert!(engine.is_running());
    }

    #[test]
    fn identity_is_stable_for_one_process() {
        let first = own_identity();
        assert_eq!(ProcessIdentity::of(std::process::id()), Some(first.clone()));
        assert!(first.matches(std::process::id()));
    }

    #[test]
    fn live_pid_with_another_identity_is_not_adopted() {
        let mut engine = ProcessEngine::new(PathBuf::from("/usr/bin/true"), None);
        let mut recycled = own_identity();
        recycled.started += 1;
        assert!(!engine.adopt(std::process::id(), &recycled));
        assert!(!engine.is_running());

        let elsewhere = ProcessIdentity {
            exe: Some(PathBuf::from("/opt/easytier/easytier-core")),
            ..own_identity()
        };
        assert!(!engine.adopt(std::process::id(), &elsewhere));
        assert!(!engine.is_running());
    }

    #[test]
    fn started_child_carries_its_identity() {
        let dir = TempDir::new().expect("tempdir");
        let script = dir.path().join("engine.sh");
        fs::write(&script, "#!/bin/sh\nwhile true; do sleep 0.1; done\n").expect("write script");
        set_executable(&script);
        let mut engine = ProcessEngine::new(script, None);
        let launch = EngineLaunch {
            config_path: dir.path().join("net.toml"),
            config_toml: String::new(),
            log_level: "info".into(),
            log_path: dir.path().join("engine.log"),
        };
        let instance = engine.start(&launch).expect("start");
        let pid = instance.pid.expect("pid");
        let identity = instance.identity.expect("identity");
        assert!(identity.matches(pid));
        engine.stop();
        assert!(!identity.matches(pid));
    }

    fn set_executable(path: &std::path::Path) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod");
    }
}
