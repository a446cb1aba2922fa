pub mod daemon;
pub mod service;
pub mod session;
pub mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use meshbar_client::{ChannelManager, ControlPlane, LaunchdInstaller, ServiceSupervisor};
use meshbar_core::{ClientSettings, ServiceDomain, Settings};
use meshbar_daemon::paths::socket_path;

/// Options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Directory holding the client's settings.yaml [default: ~/.meshbar].
    #[arg(long, global = true, value_name = "DIR")]
    pub home: Option<PathBuf>,

    /// Service domain to manage: system or user.
    #[arg(long, global = true)]
    pub domain: Option<ServiceDomain>,

    /// Talk to the daemon on this socket directly, without installing or
    /// version-checking the service.
    #[arg(long, global = true, value_name = "PATH")]
    pub socket: Option<PathBuf>,
}

impl GlobalArgs {
    pub fn client_settings(&self) -> Result<ClientSettings> {
        let home = match &self.home {
            Some(home) => home.clone(),
            None => ServiceDomain::User
                .state_root()
                .context("could not determine home directory")?,
        };
        let mut settings = Settings::load(&home)
            .with_context(|| format!("failed to load settings from {}", home.display()))?
            .client;
        if let Some(domain) = self.domain {
            settings.domain = domain;
        }
        Ok(settings)
    }
}

/// Everything a client-side command needs.
pub struct ClientContext {
    pub settings: ClientSettings,
    pub control: Arc<dyn ControlPlane>,
    pub socket: PathBuf,
}

impl ClientContext {
    pub fn new(global: &GlobalArgs) -> Result<Self> {
        let settings = global.client_settings()?;

        if let Some(socket) = &global.socket {
            let channel = ChannelManager::new(socket.clone(), settings.call_timeout());
            return Ok(Self {
                settings,
                control: Arc::new(channel),
                socket: socket.clone(),
            });
        }

        let root = settings
            .domain
            .state_root()
            .context("could not resolve the service state directory")?;
        let socket = socket_path(&root);
        let installer = LaunchdInstaller::for_current_exe(settings.domain)
            .context("failed to prepare the launchd installer")?;
        let channel = Arc::new(ChannelManager::new(socket.clone(), settings.call_timeout()));
        let supervisor = ServiceSupervisor::new(
            channel,
            Arc::new(installer),
            settings.service_ready_timeout(),
        );
        Ok(Self {
            settings,
            control: Arc::new(supervisor),
            socket,
        })
    }
}

pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

/// Render unix seconds as local time, or `-` for 0.
pub fn format_unix(seconds: f64) -> String {
    if seconds <= 0.0 {
        return "-".to_string();
    }
    chrono::DateTime::from_timestamp(seconds.trunc() as i64, 0)
        .map(|utc| {
            utc.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| "-".to_string())
}

/// `1h 02m 03s` style duration since `started_at`.
pub fn format_uptime(started_at: f64, now: f64) -> String {
    if started_at <= 0.0 || now < started_at {
        return "-".to_string();
    }
    let total = (now - started_at) as u64;
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
