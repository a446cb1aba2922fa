//! `meshbar service`: launchd registration of the privileged daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use meshbar_client::{
    ChannelManager, ControlPlane, LaunchdInstaller, ServiceInstaller, ServiceSupervisor,
};
use meshbar_core::SERVICE_VERSION;

use super::{runtime, GlobalArgs};

#[derive(Subcommand, Debug)]
pub enum ServiceCommand {
    /// Install (or reinstall) and start the daemon.
    Install,
    /// Stop the daemon and remove its launchd registration.
    Uninstall,
    /// Show registration and version of the daemon.
    Status,
}

pub fn run(command: ServiceCommand, global: &GlobalArgs) -> Result<()> {
    let settings = global.client_settings()?;
    let installer = LaunchdInstaller::for_current_exe(settings.domain)
        .context("failed to prepare the launchd installer")?;

    match command {
        ServiceCommand::Install => {
            let socket = installer.socket_path();
            let supervisor = ServiceSupervisor::new(
                Arc::new(ChannelManager::new(socket, settings.call_timeout())),
                Arc::new(installer),
                settings.service_ready_timeout(),
            );
            runtime()?
                .block_on(supervisor.ensure_ready())
                .context("failed to install the meshbar service")?;
            println!("{} service installed ({})", "✓".green().bold(), settings.domain);
        }
        ServiceCommand::Uninstall => {
            installer
                .uninstall()
                .context("failed to uninstall the meshbar service")?;
            println!("service uninstalled ({})", settings.domain);
        }
        ServiceCommand::Status => {
            let installed = installer.is_installed();
            let service = installer.service();
            println!("domain:    {}", settings.domain);
            println!("target:    {}", service.service_target());
            println!("plist:     {}", service.plist_path().display());
            println!("socket:    {}", service.socket_path().display());
            println!(
                "installed: {}",
                if installed { "yes".green() } else { "no".red() }
            );

            let channel = ChannelManager::new(service.socket_path(), settings.call_timeout());
            let version = runtime()?.block_on(channel.version());
            match version {
                Ok(version) if version == SERVICE_VERSION => {
                    println!("version:   {version}");
                }
                Ok(version) => println!(
                    "version:   {} (this client expects {SERVICE_VERSION})",
                    version.yellow()
                ),
                Err(err) => println!("version:   {} ({err})", "unreachable".red()),
            }
        }
    }
    Ok(())
}
