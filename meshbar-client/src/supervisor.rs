//! Keeps the privileged service installed and protocol-compatible.
//!
//! Before every control call: install the service if it is missing, then
//! compare its `version` with [`SERVICE_VERSION`]. A mismatch triggers one
//! uninstall and reinstall; a second mismatch is a terminal
//! [`ClientError::VersionMismatch`]. Telemetry calls skip the checks.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshbar_core::{ServiceDomain, SERVICE_VERSION};
use meshbar_daemon::{Command, LaunchdService};
use serde_json::Value;
use tokio::time::Instant;

use crate::channel::ChannelManager;
use crate::control::ControlPlane;
use crate::error::ClientError;

const READY_POLL: Duration = Duration::from_millis(100);

/// Registration of the service with the OS. Calls may block.
pub trait ServiceInstaller: Send + Sync {
    fn is_installed(&self) -> bool;
    fn install(&self) -> Result<(), ClientError>;
    fn uninstall(&self) -> Result<(), ClientError>;
}

pub struct LaunchdInstaller {
    service: LaunchdService,
}

impl LaunchdInstaller {
    pub fn new(service: LaunchdService) -> Self {
        Self { service }
    }

    /// Installer for `domain` that launches the running executable.
    pub fn for_current_exe(domain: ServiceDomain) -> Result<Self, ClientError> {
        let binary = std::env::current_exe()
            .map_err(|err| ClientError::Install(format!("cannot locate own executable: {err}")))?;
        let service = LaunchdService::new(domain, binary)
            .map_err(|err| ClientError::Install(err.to_string()))?;
        Ok(Self::new(service))
    }

    pub fn service(&self) -> &LaunchdService {
        &self.service
    }

    pub fn socket_path(&self) -> PathBuf {
        self.service.socket_path()
    }
}

impl ServiceInstaller for LaunchdInstaller {
    fn is_installed(&self) -> bool {
        self.service.is_installed()
    }

    fn install(&self) -> Result<(), ClientError> {
        self.service
            .install()
            .map_err(|err| ClientError::Install(err.to_string()))
    }

    fn uninstall(&self) -> Result<(), ClientError> {
        self.service
            .uninstall()
            .map_err(|err| ClientError::Install(err.to_string()))
    }
}

pub struct ServiceSupervisor {
    channel: Arc<ChannelManager>,
    installer: Arc<dyn ServiceInstaller>,
    expected_version: String,
    ready_timeout: Duration,
}

impl ServiceSupervisor {
    pub fn new(
        channel: Arc<ChannelManager>,
        installer: Arc<dyn ServiceInstaller>,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            installer,
            expected_version: SERVICE_VERSION.to_string(),
            ready_timeout,
        }
    }

    /// Expect `version` instead of this build's own.
    pub fn with_expected_version(mut self, version: impl Into<String>) -> Self {
        self.expected_version = version.into();
        self
    }

    pub fn channel(&self) -> &Arc<ChannelManager> {
        &self.channel
    }

    /// Make sure a compatible service is answering on the socket.
    pub async fn ensure_ready(&self) -> Result<(), ClientError> {
        if !self.blocking(|installer| Ok(installer.is_installed())).await? {
            tracing::info!("service not installed, installing");
            self.blocking(|installer| installer.install()).await?;
        }

        let mut reinstalled = false;
        loop {
            let found = self.wait_ready().await?;
            if found == self.expected_version {
                return Ok(());
            }
            if reinstalled {
                return Err(ClientError::VersionMismatch {
                    expected: self.expected_version.clone(),
                    found,
                });
            }

            tracing::warn!(
                expected = %self.expected_version,
                found = %found,
                "service version mismatch, reinstalling",
            );
            self.channel.invalidate();
            self.blocking(|installer| installer.uninstall()).await?;
            self.blocking(|installer| installer.install()).await?;
            reinstalled = true;
        }
    }

    /// Poll `version` until the service answers or the ready timeout passes.
    async fn wait_ready(&self) -> Result<String, ClientError> {
        let deadline = Instant::now() + self.ready_timeout;
        loop {
            match self.channel.version().await {
                Ok(version) => return Ok(version),
                Err(err) if err.is_transport() && Instant::now() < deadline => {
                    tracing::debug!(error = %err, "service not ready yet");
                    tokio::time::sleep(READY_POLL).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, ClientError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ServiceInstaller) -> Result<T, ClientError> + Send + 'static,
    {
        let installer = self.installer.clone();
        tokio::task::spawn_blocking(move || op(installer.as_ref()))
            .await
            .map_err(|err| ClientError::Install(format!("installer task failed: {err}")))?
    }
}

#[async_trait]
impl ControlPlane for ServiceSupervisor {
    async fn call(&self, command: Command) -> Result<Value, ClientError> {
        if command.is_control() {
            self.ensure_ready().await?;
        }
        self.channel.call(command).await
    }
}
