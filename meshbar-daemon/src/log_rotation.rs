//! Size-based rotation for the daemon's own logs and the engine log.
//!
//! Older copies shift up by one and the copy past `keep` is dropped. The live
//! file is copied to `.1` and then truncated in place, never renamed: its
//! writers (launchd for the daemon logs, the engine child for `engine.log`)
//! hold append-mode descriptors that must keep pointing at the live file.
//! The engine log is rotated through the controller so its tailer is drained
//! first and restarted at offset 0 afterwards.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::paths::{stderr_log_path, stdout_log_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    pub keep: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            keep: 5,
        }
    }
}

impl RotationPolicy {
    /// Rotate `log` if it has reached `max_bytes`. Returns whether it rotated.
    /// A missing file is not an error.
    pub fn apply(&self, log: &Path) -> io::Result<bool> {
        let size = match fs::metadata(log) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        if size < self.max_bytes {
            return Ok(false);
        }

        if self.keep > 0 {
            remove_if_present(&backup_path(log, self.keep))?;
            for n in (1..self.keep).rev() {
                let from = backup_path(log, n);
                if from.exists() {
                    fs::rename(&from, backup_path(log, n + 1))?;
                }
            }
            fs::copy(log, backup_path(log, 1))?;
        }

        // Same inode; append-mode writers continue at the new end.
        fs::OpenOptions::new().write(true).open(log)?.set_len(0)?;
        Ok(true)
    }
}

/// Rotate the daemon's stdout/stderr logs under `root` with the default
/// policy. Failures are logged per file.
pub fn rotate_daemon_logs(root: &Path) {
    let policy = RotationPolicy::default();
    for log in [stdout_log_path(root), stderr_log_path(root)] {
        match policy.apply(&log) {
            Ok(true) => tracing::info!(path = %log.display(), "log rotated"),
            Ok(false) => {}
            Err(err) => tracing::warn!(path = %log.display(), error = %err, "log rotation failed"),
        }
    }
}

fn backup_path(log: &Path, n: usize) -> PathBuf {
    let mut name = log.file_name().map(|s| s.to_os_string()).unwrap_or_default();
    name.push(format!(".{n}"));
    log.with_file_name(name)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
