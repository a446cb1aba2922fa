//! launchd registration for the privileged daemon.
//!
//! The system domain installs a LaunchDaemon running as root, which is what
//! the engine needs to create its TUN device. The user domain installs a
//! LaunchAgent and exists for development.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use meshbar_core::ServiceDomain;

use crate::error::{io_err, DaemonError};
use crate::paths::{
    launch_agents_dir, launch_daemons_dir, logs_dir, run_dir, socket_path, stderr_log_path,
    stdout_log_path, DAEMON_LABEL,
};

/// Render the plist that runs `<binary> daemon run --home <state_root>`.
pub fn generate_plist(binary_path: &Path, state_root: &Path) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
  <key>Label</key>
  <string>{label}</string>
  <key>ProgramArguments</key>
  <array>
    <string>{binary}</string>
    <string>daemon</string>
    <string>run</string>
    <string>--home</string>
    <string>{root}</string>
  </array>
  <key>RunAtLoad</key>
  <true/>
  <key>KeepAlive</key>
  <true/>
  <key>StandardOutPath</key>
  <string>{stdout}</string>
  <key>StandardErrorPath</key>
  <string>{stderr}</string>
</dict>
</plist>
"#,
        label = DAEMON_LABEL,
        binary = xml_escape(&binary_path.display().to_string()),
        root = xml_escape(&state_root.display().to_string()),
        stdout = xml_escape(&stdout_log_path(state_root).display().to_string()),
        stderr = xml_escape(&stderr_log_path(state_root).display().to_string()),
    )
}

#[derive(Debug, Clone)]
pub struct LaunchdService {
    domain: ServiceDomain,
    binary: PathBuf,
    state_root: PathBuf,
    plist_path: PathBuf,
}

impl LaunchdService {
    /// Service for `domain`, launching `binary`. The plist lands in
    /// `/Library/LaunchDaemons` or `~/Library/LaunchAgents`.
    pub fn new(domain: ServiceDomain, binary: PathBuf) -> Result<Self, DaemonError> {
        let state_root = domain.state_root()?;
        let plist_dir = match domain {
            ServiceDomain::System => launch_daemons_dir(),
            ServiceDomain::User => {
                let home = dirs::home_dir().ok_or_else(|| {
                    DaemonError::Launchd("cannot resolve the home directory".to_string())
                })?;
                launch_agents_dir(&home)
            }
        };
        Ok(Self::with_paths(domain, binary, state_root, plist_dir))
    }

    pub fn with_paths(
        domain: ServiceDomain,
        binary: PathBuf,
        state_root: PathBuf,
        plist_dir: PathBuf,
    ) -> Self {
        Self {
            domain,
            binary,
            state_root,
            plist_path: plist_dir.join(format!("{DAEMON_LABEL}.plist")),
        }
    }

    pub fn domain(&self) -> ServiceDomain {
        self.domain
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    pub fn plist_path(&self) -> &Path {
        &self.plist_path
    }

    pub fn socket_path(&self) -> PathBuf {
        socket_path(&self.state_root)
    }

    /// launchctl target, e.g. `system/dev.meshbar.daemon`.
    pub fn service_target(&self) -> String {
        format!("{}/{DAEMON_LABEL}", launchctl_domain(self.domain))
    }

    /// Write the plist, bootstrap it and kick the daemon.
    pub fn install(&self) -> Result<(), DaemonError> {
        ensure_macos()?;

        for dir in [
            self.state_root.clone(),
            logs_dir(&self.state_root),
            run_dir(&self.state_root),
        ] {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
        if let Some(parent) = self.plist_path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }

        let plist = generate_plist(&self.binary, &self.state_root);
        fs::write(&self.plist_path, plist).map_err(|e| io_err(&self.plist_path, e))?;

        let target = self.service_target();
        let _ = run_launchctl(&["bootout", &target], true);
        run_launchctl(
            &[
                "bootstrap",
                &launchctl_domain(self.domain),
                &self.plist_path.display().to_string(),
            ],
            false,
        )?;
        run_launchctl(&["kickstart", "-k", &target], false)?;
        tracing::info!(target = %target, plist = %self.plist_path.display(), "daemon installed");
        Ok(())
    }

    /// Boot the daemon out and remove its plist and socket.
    pub fn uninstall(&self) -> Result<(), DaemonError> {
        ensure_macos()?;

        let _ = run_launchctl(&["bootout", &self.service_target()], true);
        if self.plist_path.exists() {
            fs::remove_file(&self.plist_path).map_err(|e| io_err(&self.plist_path, e))?;
        }
        let socket = self.socket_path();
        if socket.exists() {
            let _ = fs::remove_file(socket);
        }
        tracing::info!(target = %self.service_target(), "daemon uninstalled");
        Ok(())
    }

    /// Whether launchd knows the service. Never errors; an unreachable
    /// launchctl reads as not installed.
    pub fn is_installed(&self) -> bool {
        if !self.plist_path.exists() {
            return false;
        }
        Command::new("launchctl")
            .args(["print", &self.service_target()])
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

fn launchctl_domain(domain: ServiceDomain) -> String {
    match domain {
        ServiceDomain::System => "system".to_string(),
        ServiceDomain::User => format!("gui/{}", nix::unistd::getuid()),
    }
}

#[cfg(target_os = "macos")]
fn ensure_macos() -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn ensure_macos() -> Result<(), DaemonError> {
    Err(DaemonError::Launchd(
        "launchd management is only supported on macOS".to_string(),
    ))
}

fn run_launchctl(args: &[&str], ignore_failure: bool) -> Result<(), DaemonError> {
    let output = Command::new("launchctl")
        .args(args)
        .output()
        .map_err(|e| io_err("launchctl", e))?;

    if output.status.success() || ignore_failure {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Err(DaemonError::Launchd(format!(
        "launchctl {} failed (status {}): {} {}",
        args.first().copied().unwrap_or_default(),
        output.status,
        stdout,
        stderr
    )))
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use plist::Value;

    #[test]
    fn plist_runs_daemon_with_state_root() {
        let binary = Path::new("/usr/local/bin/meshbar");
        let root = Path::new("/Library/Application Support/meshbar");
        let rendered = generate_plist(binary, root);

        let value = Value::from_reader_xml(rendered.as_bytes()).expect("parse plist");
        let dict = value.as_dictionary().expect("plist root dict");

        assert_eq!(
            dict.get("Label").and_then(Value::as_string),
            Some("dev.meshbar.daemon")
        );
        assert_eq!(dict.get("KeepAlive").and_then(Value::as_boolean), Some(true));
        assert_eq!(
            dict.get("StandardErrorPath").and_then(Value::as_string),
            Some("/Library/Application Support/meshbar/logs/daemon-err.log")
        );

        let args: Vec<&str> = dict
            .get("ProgramArguments")
            .and_then(Value::as_array)
            .expect("ProgramArguments array")
            .iter()
            .map(|v| v.as_string().expect("program arg as string"))
            .collect();
        assert_eq!(
            args,
            vec![
                "/usr/local/bin/meshbar",
                "daemon",
                "run",
                "--home",
                "/Library/Application Support/meshbar",
            ]
        );
    }

    #[test]
    fn special_characters_are_escaped() {
        let rendered = generate_plist(Path::new("/opt/a&b/meshbar"), Path::new("/tmp/x"));
        let value = Value::from_reader_xml(rendered.as_bytes()).expect("parse plist");
        let first = value
            .as_dictionary()
            .and_then(|d| d.get("ProgramArguments"))
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_string);
        assert_eq!(first, Some("/opt/a&b/meshbar"));
    }

    #[test]
    fn targets_follow_domain() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let service = LaunchdService::with_paths(
            ServiceDomain::System,
            PathBuf::from("/usr/local/bin/meshbar"),
            dir.path().join("state"),
            dir.path().join("LaunchDaemons"),
        );
        assert_eq!(service.service_target(), "system/dev.meshbar.daemon");
        assert_eq!(
            service.plist_path(),
            dir.path().join("LaunchDaemons").join("dev.meshbar.daemon.plist")
        );
        assert_eq!(service.socket_path(), dir.path().join("state").join("daemon.sock"));
        assert!(!service.is_installed());
    }
}
