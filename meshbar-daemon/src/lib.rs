//! Privileged meshbar daemon: engine lifecycle, log tailing, socket server.

pub mod controller;
pub mod engine;
mod error;
pub mod launchd;
pub mod log_rotation;
pub mod paths;
pub mod protocol;
mod runtime;

pub use controller::{CoreController, EngineHandle};
pub use engine::{
    Engine, EngineError, EngineInstance, EngineLaunch, EngineSelector, ProcessIdentity,
};
pub use error::DaemonError;
pub use launchd::{generate_plist, LaunchdService};
pub use protocol::{Command, Request, Response};
pub use runtime::{init_tracing, init_tracing_with, run, start_blocking, Daemon, DaemonState};
