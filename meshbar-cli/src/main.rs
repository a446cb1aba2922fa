//! meshbar: headless controller for the mesh networking engine.
//!
//! # Usage
//!
//! ```text
//! meshbar up <config.toml> [--log-level info]
//! meshbar down
//! meshbar status [--json]
//! meshbar events [--since N] [--json]
//! meshbar logs [--since N]
//! meshbar info
//! meshbar quit
//! meshbar service install|uninstall|status
//! meshbar daemon run [--home DIR] | logs
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand,
    service::ServiceCommand,
    session::UpArgs,
    telemetry::{EventsArgs, LogsArgs, StatusArgs},
    GlobalArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "meshbar",
    version,
    about = "Start, stop and watch the mesh networking engine",
    long_about = None,
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bring the engine up and follow it until ctrl-c.
    Up(UpArgs),

    /// Stop the engine.
    Down,

    /// Show whether the engine is running and since when.
    Status(StatusArgs),

    /// Print structured engine events.
    Events(EventsArgs),

    /// Print plain engine log lines.
    Logs(LogsArgs),

    /// Print the engine's running-info snapshot.
    Info,

    /// Stop the engine and shut the daemon down.
    Quit,

    /// Manage the privileged launchd service.
    Service {
        #[command(subcommand)]
        command: ServiceCommand,
    },

    /// Run or inspect the privileged daemon itself.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(command, &cli.global),
        Commands::Service { command } => commands::service::run(command, &cli.global),
        Commands::Up(args) => commands::session::run(args, &cli.global),
        Commands::Down => commands::telemetry::down(&cli.global),
        Commands::Status(args) => args.run(&cli.global),
        Commands::Events(args) => args.run(&cli.global),
        Commands::Logs(args) => args.run(&cli.global),
        Commands::Info => commands::telemetry::info(&cli.global),
        Commands::Quit => commands::telemetry::quit(&cli.global),
    }
}
