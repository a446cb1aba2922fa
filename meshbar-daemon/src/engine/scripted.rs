//! Simulated engine for tests and local demos.
//!
//! Writes a fixed set of log lines on start and reports whatever state the
//! [`ScriptHandle`] says. The handle is cheap to clone, so a test can keep one
//! after moving the engine into a daemon.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::sleep;
use std::time::Duration;

use super::{Engine, EngineError, EngineInstance, EngineLaunch};

pub const SCRIPTED_IDENTIFIER: i64 = 4242;

#[derive(Debug, Default)]
struct ScriptState {
    running: bool,
    fail_starts: u32,
    fail_message: Option<String>,
    starts: u32,
    stops: u32,
    lines: Vec<String>,
    log_path: Option<PathBuf>,
    last_config: Option<String>,
    last_config_path: Option<PathBuf>,
    start_delay: Duration,
    running_info: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptHandle {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptHandle {
    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lines written to the engine log on every successful start.
    pub fn set_startup_lines<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock().lines = lines.into_iter().map(Into::into).collect();
    }

    pub fn fail_next_starts(&self, count: u32, message: impl Into<String>) {
        let mut state = self.lock();
        state.fail_starts = count;
        state.fail_message = Some(message.into());
    }

    /// Simulate the engine dying without the daemon being told.
    pub fn crash(&self) {
        self.lock().running = false;
    }

    /// Make every start block for `delay`, like a slow engine boot.
    pub fn set_start_delay(&self, delay: Duration) {
        self.lock().start_delay = delay;
    }

    pub fn set_running_info(&self, json: impl Into<String>) {
        self.lock().running_info = Some(json.into());
    }

    /// Append a line to the log of the current run, as the engine would.
    pub fn emit(&self, line: &str) -> std::io::Result<()> {
        let path = self.lock().log_path.clone();
        match path {
            Some(path) => append_line(&path, line),
            None => Ok(()),
        }
    }

    pub fn starts(&self) -> u32 {
        self.lock().starts
    }

    pub fn stops(&self) -> u32 {
        self.lock().stops
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn last_config(&self) -> Option<String> {
        self.lock().last_config.clone()
    }

    /// Path the last start was told to read its config from.
    pub fn last_config_path(&self) -> Option<PathBuf> {
        self.lock().last_config_path.clone()
    }
}

#[derive(Debug)]
pub struct ScriptedEngine {
    handle: ScriptHandle,
}

impl ScriptedEngine {
    pub fn with_handle() -> (Self, ScriptHandle) {
        let handle = ScriptHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

impl Engine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn start(&mut self, launch: &EngineLaunch) -> Result<EngineInstance, EngineError> {
        let delay = self.handle.lock().start_delay;
        if !delay.is_zero() {
            sleep(delay);
        }
        let lines = {
            let mut state = self.handle.lock();
            if state.fail_starts > 0 {
                state.fail_starts -= 1;
                let message = state
                    .fail_message
                    .clone()
                    .unwrap_or_else(|| "scripted start failure".to_string());
                return Err(EngineError::Start(message));
            }
            state.running = true;
            state.starts += 1;
            state.log_path = Some(launch.log_path.clone());
            state.last_config = Some(launch.config_toml.clone());
            state.last_config_path = Some(launch.config_path.clone());
            state.lines.clone()
        };

        for line in lines {
            append_line(&launch.log_path, &line).map_err(|source| EngineError::Io {
                path: launch.log_path.clone(),
                source,
            })?;
        }

        Ok(EngineInstance {
            identifier: SCRIPTED_IDENTIFIER,
            pid: None,
            identity: None,
        })
    }

    fn stop(&mut self) {
        let mut state = self.handle.lock();
        if state.running {
            state.stops += 1;
        }
        state.running = false;
    }

    fn is_running(&mut self) -> bool {
        self.handle.lock().running
    }

    fn running_info(&mut self) -> Option<String> {
        let state = self.handle.lock();
        if !state.running {
            return None;
        }
        Some(
            state
                .running_info
                .clone()
                .unwrap_or_else(|| r#"{"running":true,"peers":[]}"#.to_string()),
        )
    }
}

fn append_line(path: &std::path::Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}
