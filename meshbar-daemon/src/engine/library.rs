//! In-process engine binding through the engine's C ABI.
//!
//! Every call returns `0` on success; on failure it sets `err_msg` to a
//! library-allocated string that must be released with `free_string`.

use std::ffi::{c_char, c_int, CStr, CString};
use std::path::{Path, PathBuf};
use std::ptr;

use libloading::{Library, Symbol};

use super::{Engine, EngineError, EngineInstance, EngineLaunch};

type InitLoggerFn =
    unsafe extern "C" fn(*const c_char, *const c_char, *const c_char, *mut *const c_char) -> c_int;
type RunNetworkInstanceFn = unsafe extern "C" fn(*const c_char, *mut *const c_char) -> c_int;
type StopNetworkInstanceFn = unsafe extern "C" fn() -> c_int;
type GetRunningInfoFn = unsafe extern "C" fn(*mut *const c_char, *mut *const c_char) -> c_int;
type GetLatestErrorMsgFn = unsafe extern "C" fn(*mut *const c_char, *mut *const c_char) -> c_int;
type FreeStringFn = unsafe extern "C" fn(*const c_char);

const REQUIRED_SYMBOLS: [&[u8]; 6] = [
    b"init_logger\0",
    b"run_network_instance\0",
    b"stop_network_instance\0",
    b"get_running_info\0",
    b"get_latest_error_msg\0",
    b"free_string\0",
];

const LOG_SUBSYSTEM: &str = "dev.meshbar.engine";

pub struct LibraryEngine {
    path: PathBuf,
    library: Library,
    /// Level the library logger was last initialized with.
    logger_level: Option<String>,
    running: bool,
}

impl LibraryEngine {
    /// Load the library and verify it exports the full ABI.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        // SAFETY: loading runs the library's initializers; the path comes from
        // daemon settings, which only root can write.
        let library = unsafe { Library::new(path) }
            .map_err(|err| EngineError::Library(format!("{}: {err}", path.display())))?;

        for name in REQUIRED_SYMBOLS {
            // SAFETY: the symbol is only checked for presence, never called here.
            let found = unsafe { library.get::<unsafe extern "C" fn()>(name) };
            if let Err(err) = found {
                return Err(EngineError::Library(format!(
                    "{} lacks {}: {err}",
                    path.display(),
                    String::from_utf8_lossy(&name[..name.len() - 1])
                )));
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            library,
            logger_level: None,
            running: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn symbol<T>(&self, name: &[u8]) -> Result<Symbol<'_, T>, EngineError> {
        // SAFETY: `T` matches the C declarations above for each name used.
        unsafe { self.library.get::<T>(name) }
            .map_err(|err| EngineError::Library(err.to_string()))
    }

    /// Copy a library-owned string and hand it back to the library.
    fn take_string(&self, raw: *const c_char) -> Option<String> {
        if raw.is_null() {
            return None;
        }
        // SAFETY: non-null pointers from the ABI are NUL-terminated strings
        // that stay valid until passed to `free_string`.
        let owned = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        if let Ok(free) = self.symbol::<FreeStringFn>(b"free_string\0") {
            // SAFETY: `raw` came from this library and is freed exactly once.
            unsafe { free(raw) };
        }
        Some(owned)
    }

    fn failure(&self, err_msg: *const c_char, fallback: &str) -> String {
        self.take_string(err_msg)
            .or_else(|| self.latest_error())
            .unwrap_or_else(|| fallback.to_string())
    }

    fn latest_error(&self) -> Option<String> {
        let get = self.symbol::<GetLatestErrorMsgFn>(b"get_latest_error_msg\0").ok()?;
        let mut msg: *const c_char = ptr::null();
        let mut err: *const c_char = ptr::null();
        // SAFETY: both out-pointers are valid for writes.
        let code = unsafe { get(&mut msg, &mut err) };
        self.take_string(err);
        if code != 0 {
            return None;
        }
        self.take_string(msg).filter(|m| !m.is_empty())
    }

    /// (Re)initialize the library logger whenever the requested level changes.
    /// A failed re-init keeps the previous logger running.
    fn init_logger(&mut self, launch: &EngineLaunch) -> Result<(), EngineError> {
        if !needs_logger_init(self.logger_level.as_deref(), &launch.log_level) {
            return Ok(());
        }
        let init = self.symbol::<InitLoggerFn>(b"init_logger\0")?;
        let path = c_string(&launch.log_path.to_string_lossy())?;
        let level = c_string(&launch.log_level)?;
        let subsystem = c_string(LOG_SUBSYSTEM)?;
        let mut err: *const c_char = ptr::null();
        // SAFETY: all inputs are valid NUL-terminated strings for the call's duration.
        let code = unsafe { init(path.as_ptr(), level.as_ptr(), subsystem.as_ptr(), &mut err) };
        if code != 0 {
            let message = self.failure(err, "init_logger failed");
            if let Some(current) = &self.logger_level {
                tracing::warn!(
                    current = %current,
                    wanted = %launch.log_level,
                    error = %message,
                    "engine logger kept its previous level",
                );
                return Ok(());
            }
            return Err(EngineError::Start(message));
        }
        self.logger_level = Some(launch.log_level.clone());
        Ok(())
    }
}

impl Engine for LibraryEngine {
    fn name(&self) -> &'static str {
        "library"
    }

    fn start(&mut self, launch: &EngineLaunch) -> Result<EngineInstance, EngineError> {
        self.init_logger(launch)?;

        let run = self.symbol::<RunNetworkInstanceFn>(b"run_network_instance\0")?;
        let config = c_string(&launch.config_toml)?;
        let mut err: *const c_char = ptr::null();
        // SAFETY: `config` outlives the call; `err` is valid for writes.
        let code = unsafe { run(config.as_ptr(), &mut err) };
        if code != 0 {
            return Err(EngineError::Start(
                self.failure(err, "run_network_instance failed"),
            ));
        }

        self.running = true;
        Ok(EngineInstance {
            identifier: 1,
            pid: None,
            identity: None,
        })
    }

    fn stop(&mut self) {
        if let Ok(stop) = self.symbol::<StopNetworkInstanceFn>(b"stop_network_instance\0") {
            // SAFETY: no arguments; the library tolerates stop without an instance.
            let code = unsafe { stop() };
            if code != 0 {
                tracing::debug!(code, "stop_network_instance returned non-zero");
            }
        }
        self.running = false;
    }

    fn is_running(&mut self) -> bool {
        if !self.running {
            return false;
        }
        let alive = match self.running_info() {
            Some(json) => snapshot_reports_running(&json),
            None => false,
        };
        if !alive {
            self.running = false;
        }
        alive
    }

    fn running_info(&mut self) -> Option<String> {
        let get = self.symbol::<GetRunningInfoFn>(b"get_running_info\0").ok()?;
        let mut json: *const c_char = ptr::null();
        let mut err: *const c_char = ptr::null();
        // SAFETY: both out-pointers are valid for writes.
        let code = unsafe { get(&mut json, &mut err) };
        if code != 0 {
            let message = self.failure(err, "get_running_info failed");
            tracing::debug!(error = %message, "running info unavailable");
            return None;
        }
        self.take_string(json)
    }
}

fn needs_logger_init(current: Option<&str>, wanted: &str) -> bool {
    current != Some(wanted)
}

fn c_string(value: &str) -> Result<CString, EngineError> {
    CString::new(value)
        .map_err(|_| EngineError::Start("argument contains an interior NUL byte".to_string()))
}

/// A snapshot counts as running unless it explicitly says `"running": false`.
fn snapshot_reports_running(json: &str) -> bool {
    match serde_json::from_str::<serde_json::Value>(json) {
        Ok(value) => value.get("running").and_then(|v| v.as_bool()) != Some(false),
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_flag_in_snapshot() {
        assert!(snapshot_reports_running(r#"{"running": true, "peers": []}"#));
        assert!(snapshot_reports_running(r#"{"peers": []}"#));
        assert!(!snapshot_reports_running(r#"{"running": false, "error_msg": "tun"}"#));
    }

    #[test]
    fn load_rejects_non_library() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let path = dir.path().join("libfake.dylib");
        std::fs::write(&path, b"garbage").expect("write");
        let err = LibraryEngine::load(&path).err().expect("load must fail");
        assert!(matches!(err, EngineError::Library(_)), "got: {err}");
    }

    #[test]
    fn logger_reinitializes_only_on_level_change() {
        assert!(needs_logger_init(None, "info"));
        assert!(!needs_logger_init(Some("info"), "info"));
        assert!(needs_logger_init(Some("info"), "debug"));
    }

    #[test]
    fn interior_nul_is_rejected() {
        assert!(c_string("a\0b").is_err());
    }
}
