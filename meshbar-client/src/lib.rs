//! # meshbar-client
//!
//! The unprivileged side of meshbar: a multiplexed channel to the daemon
//! socket, the supervisor that keeps the daemon installed at the right
//! version, and the session controller that turns a toggle into engine
//! starts and stops while polling telemetry.

pub mod channel;
pub mod control;
pub mod error;
pub mod session;
pub mod staging;
pub mod supervisor;
pub mod traffic;

pub use channel::ChannelManager;
pub use control::ControlPlane;
pub use error::ClientError;
pub use session::{Phase, SessionController, SessionSnapshot};
pub use staging::StagedConfig;
pub use supervisor::{LaunchdInstaller, ServiceInstaller, ServiceSupervisor};
pub use traffic::{traffic_totals, TrafficMeter, TrafficRate};
