//! Access strategies for the mesh-networking engine.
//!
//! The engine is opaque: it can be started with a config, stopped, checked
//! for liveness and asked for a running-info snapshot. Two bindings exist, tried
//! in priority order by [`EngineSelector`]:
//!
//! 1. [`LibraryEngine`]: in-process, via the engine's C ABI in a dynamic library.
//! 2. [`ProcessEngine`]: an external engine executable.

mod library;
mod process;
pub mod scripted;

use std::path::{Path, PathBuf};

use meshbar_core::EngineSettings;
use serde::{Deserialize, Serialize};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use thiserror::Error;

pub use library::LibraryEngine;
pub use process::ProcessEngine;
pub use scripted::{ScriptHandle, ScriptedEngine};

#[derive(Debug, Error)]
pub enum EngineError {
    /// Neither binding is installed.
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("cannot read config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The engine refused to start; the message is the engine's own.
    #[error("{0}")]
    Start(String),

    #[error("engine library error: {0}")]
    Library(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything an engine needs to start one instance.
#[derive(Debug, Clone)]
pub struct EngineLaunch {
    pub config_path: PathBuf,
    /// Contents of `config_path`, read by the daemon.
    pub config_toml: String,
    pub log_level: String,
    /// Where the engine must write its log; tailed by the daemon.
    pub log_path: PathBuf,
}

/// What a successful start reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInstance {
    /// Non-zero while running: the pid, or 1 for an in-process engine.
    pub identifier: i64,
    /// Set only for engines that can outlive the daemon.
    pub pid: Option<u32>,
    /// Fingerprint of `pid`, required to adopt it later.
    pub identity: Option<ProcessIdentity>,
}

/// Tells one process apart from a later one that reuses its pid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIdentity {
    /// Unix seconds, as reported by the kernel.
    pub started: u64,
    pub exe: Option<PathBuf>,
}

impl ProcessIdentity {
    /// Identity of the live process `pid`, if there is one.
    pub fn of(pid: u32) -> Option<Self> {
        let pid = sysinfo::Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_exe(UpdateKind::Always),
        );
        let process = system.process(pid)?;
        Some(Self {
            started: process.start_time(),
            exe: process.exe().map(Path::to_path_buf),
        })
    }

    /// `pid` is alive and is still the process this identity was taken from.
    pub fn matches(&self, pid: u32) -> bool {
        Self::of(pid).as_ref() == Some(self)
    }
}

pub trait Engine: Send {
    fn name(&self) -> &'static str;

    fn start(&mut self, launch: &EngineLaunch) -> Result<EngineInstance, EngineError>;

    /// Best effort; never fails from the caller's point of view.
    fn stop(&mut self);

    /// Ground truth, not a cached flag.
    fn is_running(&mut self) -> bool;

    fn running_info(&mut self) -> Option<String>;

    /// Take ownership of an engine left running by a previous daemon. Only
    /// succeeds if `pid` still carries `identity`.
    fn adopt(&mut self, _pid: u32, _identity: &ProcessIdentity) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Active {
    Library,
    Process,
}

/// Resolves the preferred available binding on every start.
///
/// The library is loaded once and kept; the binary is re-checked each start
/// so an engine downloaded after the daemon came up is picked up.
pub struct EngineSelector {
    settings: EngineSettings,
    library: Option<LibraryEngine>,
    process: Option<ProcessEngine>,
    active: Option<Active>,
}

impl EngineSelector {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            library: None,
            process: None,
            active: None,
        }
    }

    fn resolve(&mut self) -> Result<Active, EngineError> {
        if let Some(path) = self.settings.library_path.clone() {
            if self.library.is_some() {
                return Ok(Active::Library);
            }
            if path.exists() {
                match LibraryEngine::load(&path) {
                    Ok(engine) => {
                        tracing::info!(path = %path.display(), "using in-process engine library");
                        self.library = Some(engine);
                        return Ok(Active::Library);
                    }
                    Err(err) => {
                        tracing::warn!(path = %path.display(), error = %err, "engine library unusable, falling back");
                    }
                }
            }
        }

        if let Some(binary) = self.settings.binary_path.clone() {
            if binary.exists() {
                if self.process.is_none() {
                    self.process = Some(ProcessEngine::new(binary, self.settings.cli_path.clone()));
                }
                return Ok(Active::Process);
            }
        }

        Err(EngineError::Unavailable(
            "no engine library or binary found; install the engine first".to_string(),
        ))
    }

    fn active_engine(&mut self) -> Option<&mut dyn Engine> {
        match self.active? {
            Active::Library => self.library.as_mut().map(|e| e as &mut dyn Engine),
            Active::Process => self.process.as_mut().map(|e| e as &mut dyn Engine),
        }
    }
}

impl Engine for EngineSelector {
    fn name(&self) -> &'static str {
        match self.active {
            Some(Active::Library) => "library",
            Some(Active::Process) => "process",
            None => "none",
        }
    }

    fn start(&mut self, launch: &EngineLaunch) -> Result<EngineInstance, EngineError> {
        let active = self.resolve()?;
        self.active = Some(active);
        match self.active_engine() {
            Some(engine) => engine.start(launch),
            None => Err(EngineError::Unavailable("engine binding vanished".to_string())),
        }
    }

    fn stop(&mut self) {
        if let Some(engine) = self.active_engine() {
            engine.stop();
        }
    }

    fn is_running(&mut self) -> bool {
        self.active_engine().is_some_and(|engine| engine.is_running())
    }

    fn running_info(&mut self) -> Option<String> {
        self.active_engine().and_then(|engine| engine.running_info())
    }

    fn adopt(&mut self, pid: u32, identity: &ProcessIdentity) -> bool {
        let Some(binary) = self.settings.binary_path.clone() else {
            return false;
        };
        let process = self
            .process
            .get_or_insert_with(|| ProcessEngine::new(binary, self.settings.cli_path.clone()));
        if process.adopt(pid, identity) {
            self.active = Some(Active::Process);
            true
        } else {
            false
        }
    }
}
