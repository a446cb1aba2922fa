//! `meshbar up`: drive a session controller like the menu bar would.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use uuid::Uuid;

use meshbar_client::{Phase, SessionController, SessionSnapshot};

use super::telemetry::paint_kind;
use super::{format_unix, runtime, ClientContext, GlobalArgs};

#[derive(Args, Debug)]
pub struct UpArgs {
    /// Engine config (TOML).
    pub config: PathBuf,

    /// Engine console log level [default: from settings].
    #[arg(long)]
    pub log_level: Option<String>,
}

pub fn run(args: UpArgs, global: &GlobalArgs) -> Result<()> {
    if !args.config.is_file() {
        bail!("config file not found: {}", args.config.display());
    }
    let config = args
        .config
        .canonicalize()
        .with_context(|| format!("resolve {}", args.config.display()))?;

    meshbar_daemon::init_tracing_with("warn");
    let mut context = ClientContext::new(global)?;
    if let Some(level) = args.log_level {
        context.settings.log_level = level;
    }

    runtime()?.block_on(async move {
        let controller = SessionController::spawn(context.control, context.settings, config);
        let mut updates = controller.subscribe();
        let mut printer = Printer::default();

        controller.set_enabled(true).await;
        loop {
            tokio::select! {
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = updates.borrow_and_update().clone();
                    printer.print(&snapshot);
                    if printer.gave_up(&snapshot) {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    println!("\nstopping...");
                    // Toggles are dropped while one is in flight; wait it out.
                    let _ = updates.wait_for(|s| !s.processing).await;
                    controller.set_enabled(false).await;
                    let _ = updates
                        .wait_for(|s| s.phase == Phase::Idle && !s.processing)
                        .await;
                    break;
                }
            }
        }

        let last = controller.snapshot();
        controller.shutdown().await;
        match last.last_error {
            Some(error) if !last.enabled && printer.was_running => {
                println!("{} {error}", "engine stopped:".red().bold());
                Ok(())
            }
            Some(error) if !printer.was_running => bail!("engine did not start: {error}"),
            _ => Ok(()),
        }
    })
}

#[derive(Default)]
struct Printer {
    phase: Option<Phase>,
    session: Option<Uuid>,
    printed_events: u64,
    printed_lines: u64,
    was_running: bool,
}

impl Printer {
    fn print(&mut self, snapshot: &SessionSnapshot) {
        if self.phase != Some(snapshot.phase) {
            self.phase = Some(snapshot.phase);
            match snapshot.phase {
                Phase::Activating => println!("{} starting engine", "…".yellow()),
                Phase::Running => {
                    self.was_running = true;
                    println!(
                        "{} running (id {}, since {})",
                        "●".green().bold(),
                        snapshot.identifier,
                        format_unix(snapshot.started_at)
                    );
                }
                Phase::Deactivating => println!("{} stopping engine", "…".yellow()),
                Phase::Idle => println!("{} stopped", "●".bright_black().bold()),
            }
        }

        let (skip_events, skip_lines) = self.skip_printed(snapshot);
        for event in snapshot.events.iter().skip(skip_events) {
            println!("{} {} {}", event.timestamp, paint_kind(event.kind), event.details);
        }
        for line in snapshot.log_lines.iter().skip(skip_lines) {
            println!("{}", line.bright_black());
        }
    }

    /// How many leading events and lines of `snapshot` were already printed.
    fn skip_printed(&mut self, snapshot: &SessionSnapshot) -> (usize, usize) {
        if snapshot.session.is_some() && snapshot.session != self.session {
            self.session = snapshot.session;
            self.printed_events = 0;
            self.printed_lines = 0;
        }
        (
            already_printed(
                snapshot.events.len(),
                snapshot.events_received,
                &mut self.printed_events,
            ),
            already_printed(
                snapshot.log_lines.len(),
                snapshot.lines_received,
                &mut self.printed_lines,
            ),
        )
    }

    /// Activation settled without the engine coming up.
    fn gave_up(&self, snapshot: &SessionSnapshot) -> bool {
        !snapshot.processing
            && !snapshot.enabled
            && snapshot.phase == Phase::Idle
            && snapshot.last_error.is_some()
    }
}

/// The history keeps only the newest `len` of `received` entries; everything
/// up to `printed` is on screen already.
fn already_printed(len: usize, received: u64, printed: &mut u64) -> usize {
    if received < *printed {
        *printed = 0;
    }
    let fresh = (received - *printed).min(len as u64) as usize;
    *printed = received;
    len - fresh
}
