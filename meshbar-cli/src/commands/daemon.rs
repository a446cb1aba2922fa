//! `meshbar daemon`: the privileged process launchd runs, and its own logs.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use meshbar_daemon::paths::{stderr_log_path, stdout_log_path};
use meshbar_daemon::start_blocking;

use super::GlobalArgs;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (socket server + engine supervision).
    Run(RunArgs),
    /// Print the daemon's recent stdout/stderr log lines.
    Logs(DaemonLogsArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// State directory: socket, settings, logs [default: the domain's root].
    #[arg(long, value_name = "DIR")]
    pub home: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct DaemonLogsArgs {
    /// Number of trailing lines to show.
    #[arg(long, default_value_t = 100)]
    pub lines: usize,

    /// Show only the stderr log file.
    #[arg(long)]
    pub stderr_only: bool,
}

pub fn run(command: DaemonCommand, global: &GlobalArgs) -> Result<()> {
    match command {
        DaemonCommand::Run(args) => {
            let root = state_root(args.home, global)?;
            start_blocking(&root).context("daemon exited with error")?;
        }
        DaemonCommand::Logs(args) => {
            let root = state_root(None, global)?;
            if !args.stderr_only {
                print_tail(&stdout_log_path(&root), args.lines)
                    .context("failed to read daemon stdout log")?;
            }
            print_tail(&stderr_log_path(&root), args.lines)
                .context("failed to read daemon stderr log")?;
        }
    }
    Ok(())
}

fn state_root(explicit: Option<PathBuf>, global: &GlobalArgs) -> Result<PathBuf> {
    if let Some(root) = explicit {
        return Ok(root);
    }
    let domain = global.domain.unwrap_or_default();
    domain
        .state_root()
        .context("could not resolve the daemon state directory")
}

fn print_tail(path: &Path, lines: usize) -> Result<()> {
    if !path.exists() {
        println!("log file not found: {}", path.display());
        return Ok(());
    }

    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut tail = VecDeque::<String>::with_capacity(lines);
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if tail.len() == lines {
            tail.pop_front();
        }
        if lines > 0 {
            tail.push_back(line);
        }
    }

    println!("==> {} <==", path.display());
    for line in tail {
        println!("{line}");
    }
    Ok(())
}
