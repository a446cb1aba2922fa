//! Hand configs across the privilege boundary.
//!
//! The daemon runs as root but cannot see into the client's sandboxed
//! container, so the config is copied to a world-readable file in the system
//! temp directory for the duration of a start attempt.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{io_err, ClientError};

/// A staged copy of a config file, removed on drop.
#[derive(Debug)]
pub struct StagedConfig {
    path: PathBuf,
}

impl StagedConfig {
    pub fn stage(source: &Path) -> Result<Self, ClientError> {
        Self::stage_in(source, &std::env::temp_dir())
    }

    pub fn stage_in(source: &Path, dir: &Path) -> Result<Self, ClientError> {
        let contents = fs::read(source).map_err(|e| io_err(source, e))?;
        let path = dir.join(format!("meshbar-{}.toml", Uuid::new_v4()));
        fs::write(&path, contents).map_err(|e| io_err(&path, e))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644))
            .map_err(|e| io_err(&path, e))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedConfig {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            tracing::debug!(path = %self.path.display(), error = %err, "staged config already gone");
        }
    }
}
