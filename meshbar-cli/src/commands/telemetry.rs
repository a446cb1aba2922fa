//! One-shot queries against the daemon: status, events, logs, info, down, quit.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use meshbar_core::{EventKind, EventRecord};

use super::{format_unix, format_uptime, runtime, unix_now, ClientContext, GlobalArgs};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct StatusJson {
    running: bool,
    identifier: i64,
    started_at: f64,
    socket: String,
}

impl StatusArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let context = ClientContext::new(global)?;
        let (status, started_at) = runtime()?.block_on(async {
            let status = context.control.status().await?;
            let started_at = context.control.start_time().await?;
            Ok::<_, meshbar_client::ClientError>((status, started_at))
        })
        .context("failed to query engine status")?;

        if self.json {
            let payload = StatusJson {
                running: status.running,
                identifier: status.identifier,
                started_at,
                socket: context.socket.display().to_string(),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to render status JSON")?
            );
            return Ok(());
        }

        if status.running {
            println!("{} running (id {})", "●".green().bold(), status.identifier);
            println!("started: {}", format_unix(started_at));
            println!("uptime:  {}", format_uptime(started_at, unix_now()));
        } else {
            println!("{} stopped", "●".bright_black().bold());
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
pub struct EventsArgs {
    /// Only events with a global index above this one.
    #[arg(long, default_value_t = 0)]
    pub since: u64,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct EventRow {
    time: String,
    #[tabled(rename = "type")]
    kind: String,
    details: String,
}

impl EventsArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let context = ClientContext::new(global)?;
        let page = runtime()?
            .block_on(context.control.recent_events(self.since))
            .context("failed to fetch events")?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&page).context("failed to render events JSON")?
            );
            return Ok(());
        }

        if page.events.is_empty() {
            println!("No events (next index {}).", page.next_index);
            return Ok(());
        }
        let rows: Vec<EventRow> = page.events.iter().map(event_row).collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        println!("next index: {}", page.next_index);
        Ok(())
    }
}

fn event_row(event: &EventRecord) -> EventRow {
    EventRow {
        time: event.timestamp.clone(),
        kind: paint_kind(event.kind),
        details: event.details.clone(),
    }
}

/// Event tag colored by severity.
pub fn paint_kind(kind: EventKind) -> String {
    if kind.is_error() {
        kind.as_str().red().bold().to_string()
    } else if kind == EventKind::Unknown {
        kind.as_str().bright_black().to_string()
    } else {
        kind.as_str().cyan().to_string()
    }
}

#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Only lines with a global index above this one.
    #[arg(long, default_value_t = 0)]
    pub since: u64,
}

impl LogsArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let context = ClientContext::new(global)?;
        let page = runtime()?
            .block_on(context.control.recent_logs(self.since))
            .context("failed to fetch log lines")?;
        for line in &page.lines {
            println!("{line}");
        }
        eprintln!("next index: {}", page.next_index);
        Ok(())
    }
}

pub fn info(global: &GlobalArgs) -> Result<()> {
    let context = ClientContext::new(global)?;
    let info = runtime()?
        .block_on(context.control.running_info())
        .context("failed to fetch running info")?;
    match info {
        Some(raw) => match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(value) => println!(
                "{}",
                serde_json::to_string_pretty(&value).context("failed to render running info")?
            ),
            Err(_) => println!("{raw}"),
        },
        None => println!("engine is not running"),
    }
    Ok(())
}

pub fn down(global: &GlobalArgs) -> Result<()> {
    let context = ClientContext::new(global)?;
    runtime()?
        .block_on(context.control.stop())
        .context("failed to stop the engine")?;
    println!("engine stopped");
    Ok(())
}

pub fn quit(global: &GlobalArgs) -> Result<()> {
    let context = ClientContext::new(global)?;
    runtime()?
        .block_on(context.control.quit())
        .context("failed to quit the daemon")?;
    println!("daemon shutting down");
    Ok(())
}
