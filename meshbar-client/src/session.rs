//! The client session controller.
//!
//! A single actor task owns all session state: the toggle, the current
//! session id, cursors into the daemon's event and log buffers, the local
//! history and the traffic meter. User intent, activation results and polling
//! results all reach it as messages, and it publishes a [`SessionSnapshot`]
//! on a watch channel after every change.
//!
//! Activation: flip the toggle on, force a stop, wait the grace period, then
//! try to start, retrying with a fixed backoff under the same session id.
//! When retries run out the controller asks for the real status and adopts
//! it. Polling results tagged with anything but the current session are
//! dropped.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use meshbar_core::{ClientSettings, EventRecord, EventsPage, LogLinesPage, StatusReply};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::control::ControlPlane;
use crate::error::ClientError;
use crate::staging::StagedConfig;
use crate::traffic::{TrafficMeter, TrafficRate};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    Activating,
    Running,
    Deactivating,
}

/// What the UI renders.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    /// The toggle as shown; flips before the daemon confirms.
    pub enabled: bool,
    pub phase: Phase,
    /// A toggle is in flight; further toggles are dropped.
    pub processing: bool,
    pub session: Option<Uuid>,
    pub identifier: i64,
    /// Unix seconds, 0 when unknown.
    pub started_at: f64,
    pub events: VecDeque<EventRecord>,
    pub log_lines: VecDeque<String>,
    /// Events appended to `events` this session, trimmed ones included.
    pub events_received: u64,
    /// Lines appended to `log_lines` this session, trimmed ones included.
    pub lines_received: u64,
    pub running_info: Option<Value>,
    pub traffic: Option<TrafficRate>,
    /// Events evicted on the daemon before this client saw them.
    pub missed_events: u64,
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    pub fn is_running(&self) -> bool {
        self.phase == Phase::Running
    }
}

struct ActivationOutcome {
    status: StatusReply,
    started_at: f64,
    error: Option<String>,
}

struct PollResult {
    since_event: u64,
    /// The daemon's buffer was cleared and `events` was fetched from zero.
    events_reset: bool,
    events: Option<EventsPage>,
    since_line: u64,
    lines_reset: bool,
    lines: Option<LogLinesPage>,
    info: Option<String>,
    status: Option<StatusReply>,
    taken_at: Instant,
}

enum Message {
    Toggle(bool),
    ActivationFinished { session: Uuid, outcome: ActivationOutcome },
    StopFinished { error: Option<String> },
    PollFinished { session: Uuid, result: Box<PollResult> },
    Shutdown,
}

/// Handle to the session actor.
pub struct SessionController {
    tx: mpsc::Sender<Message>,
    snapshot: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl SessionController {
    /// Spawn the actor. `config_path` is the TOML config started on toggle-on.
    pub fn spawn(
        control: Arc<dyn ControlPlane>,
        settings: ClientSettings,
        config_path: PathBuf,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let (snapshot_tx, snapshot) = watch::channel(SessionSnapshot::default());
        let actor = Actor {
            control,
            settings,
            config_path,
            tx: tx.clone(),
            rx,
            state: snapshot_tx,
            event_cursor: 0,
            line_cursor: 0,
            poll_in_flight: None,
            meter: TrafficMeter::default(),
        };
        let task = tokio::spawn(actor.run());
        Self { tx, snapshot, task }
    }

    /// Request the engine on or off. Dropped while another toggle is in flight.
    pub async fn set_enabled(&self, on: bool) {
        let _ = self.tx.send(Message::Toggle(on)).await;
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Stop the actor. The engine is left as it is.
    pub async fn shutdown(self) {
        let _ = self.tx.send(Message::Shutdown).await;
        let _ = self.task.await;
    }
}

struct Actor {
    control: Arc<dyn ControlPlane>,
    settings: ClientSettings,
    config_path: PathBuf,
    tx: mpsc::Sender<Message>,
    rx: mpsc::Receiver<Message>,
    state: watch::Sender<SessionSnapshot>,
    event_cursor: u64,
    line_cursor: u64,
    /// Session of the outstanding poll, if any.
    poll_in_flight: Option<Uuid>,
    meter: TrafficMeter,
}

impl Actor {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(Message::Shutdown) | None => break,
                    Some(message) => self.handle(message),
                },
                _ = ticker.tick() => self.poll(),
            }
        }
        tracing::debug!("session controller stopped");
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Toggle(on) => self.toggle(on),
            Message::ActivationFinished { session, outcome } => {
                self.activation_finished(session, outcome)
            }
            Message::StopFinished { error } => self.stop_finished(error),
            Message::PollFinished { session, result } => self.poll_finished(session, *result),
            Message::Shutdown => {}
        }
    }

    fn toggle(&mut self, on: bool) {
        let (processing, enabled) = {
            let state = self.state.borrow();
            (state.processing, state.enabled)
        };
        if processing {
            tracing::debug!(on, "toggle dropped, another one is in flight");
            return;
        }
        if enabled == on {
            return;
        }
        if on {
            self.activate();
        } else {
            self.deactivate();
        }
    }

    fn activate(&mut self) {
        let session = Uuid::new_v4();
        self.event_cursor = 0;
        self.line_cursor = 0;
        self.meter.reset();
        self.state.send_modify(|state| {
            state.enabled = true;
            state.processing = true;
            state.phase = Phase::Activating;
            state.session = Some(session);
            state.identifier = 0;
            state.started_at = 0.0;
            state.events.clear();
            state.log_lines.clear();
            state.events_received = 0;
            state.lines_received = 0;
            state.running_info = None;
            state.traffic = None;
            state.missed_events = 0;
            state.last_error = None;
        });
        tracing::info!(%session, config = %self.config_path.display(), "activating");

        let control = self.control.clone();
        let settings = self.settings.clone();
        let config_path = self.config_path.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = run_activation(control.as_ref(), &settings, &config_path, session).await;
            let _ = tx
                .send(Message::ActivationFinished { session, outcome })
                .await;
        });
    }

    fn deactivate(&mut self) {
        self.meter.reset();
        self.state.send_modify(|state| {
            state.enabled = false;
            state.processing = true;
            state.phase = Phase::Deactivating;
            state.session = None;
            state.traffic = None;
        });
        tracing::info!("deactivating");

        let control = self.control.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let error = control.stop().await.err().map(|err| err.to_string());
            let _ = tx.send(Message::StopFinished { error }).await;
        });
    }

    fn activation_finished(&mut self, session: Uuid, outcome: ActivationOutcome) {
        if self.state.borrow().session != Some(session) {
            tracing::debug!(%session, "discarding result of superseded activation");
            return;
        }
        let running = outcome.status.running;
        tracing::info!(%session, running, "activation settled");
        self.state.send_modify(|state| {
            state.processing = false;
            state.enabled = running;
            state.identifier = outcome.status.identifier;
            state.started_at = outcome.started_at;
            state.last_error = outcome.error;
            if running {
                state.phase = Phase::Running;
            } else {
                state.phase = Phase::Idle;
                state.session = None;
            }
        });
    }

    fn stop_finished(&mut self, error: Option<String>) {
        if let Some(error) = &error {
            tracing::warn!(error = %error, "stop failed");
        }
        self.state.send_modify(|state| {
            state.processing = false;
            state.phase = Phase::Idle;
            state.identifier = 0;
            state.started_at = 0.0;
            state.running_info = None;
            state.last_error = error;
        });
    }

    fn poll(&mut self) {
        let session = {
            let state = self.state.borrow();
            match (state.phase, state.session) {
                (Phase::Running, Some(session)) => session,
                _ => return,
            }
        };
        if self.poll_in_flight == Some(session) {
            return;
        }
        self.poll_in_flight = Some(session);

        let control = self.control.clone();
        let tx = self.tx.clone();
        let since_event = self.event_cursor;
        let since_line = self.line_cursor;
        tokio::spawn(async move {
            let result = fetch_telemetry(control.as_ref(), since_event, since_line).await;
            let _ = tx
                .send(Message::PollFinished {
                    session,
                    result: Box::new(result),
                })
                .await;
        });
    }

    fn poll_finished(&mut self, session: Uuid, result: PollResult) {
        if self.poll_in_flight == Some(session) {
            self.poll_in_flight = None;
        }
        let current = self.state.borrow().session;
        if current != Some(session) {
            tracing::debug!(%session, "discarding telemetry from stale session");
            return;
        }

        let capacity = self.settings.event_capacity.max(1);
        let mut missed = 0;

        let events = result.events.map(|page| {
            if page.next_index < result.since_event {
                // Only reachable if the reset re-query itself failed; start over.
                self.event_cursor = 0;
                return Vec::new();
            }
            let expected = page.next_index - result.since_event;
            missed = expected.saturating_sub(page.events.len() as u64);
            if missed > 0 {
                tracing::warn!(missed, "events evicted before they were fetched");
            }
            self.event_cursor = page.next_index;
            page.events
        });
        let lines = result.lines.map(|page| {
            if page.next_index < result.since_line {
                self.line_cursor = 0;
                return Vec::new();
            }
            self.line_cursor = page.next_index;
            page.lines
        });

        let info = result.info.and_then(|raw| match serde_json::from_str::<Value>(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::debug!(error = %err, "ignoring malformed running info");
                None
            }
        });
        let traffic = info
            .as_ref()
            .and_then(|value| self.meter.observe(value, result.taken_at));

        let died = matches!(result.status, Some(status) if !status.running);
        if died {
            tracing::warn!(%session, "engine is no longer running");
            self.meter.reset();
        }

        self.state.send_modify(|state| {
            if result.events_reset {
                state.events.clear();
            }
            if let Some(events) = events {
                state.events_received += events.len() as u64;
                state.events.extend(events);
                while state.events.len() > capacity {
                    state.events.pop_front();
                }
            }
            if result.lines_reset {
                state.log_lines.clear();
            }
            if let Some(lines) = lines {
                state.lines_received += lines.len() as u64;
                state.log_lines.extend(lines);
                while state.log_lines.len() > capacity {
                    state.log_lines.pop_front();
                }
            }
            state.missed_events += missed;
            if info.is_some() {
                state.running_info = info;
            }
            if traffic.is_some() {
                state.traffic = traffic;
            }
            if died {
                state.enabled = false;
                state.phase = Phase::Idle;
                state.session = None;
                state.identifier = 0;
                state.started_at = 0.0;
                state.traffic = None;
                state.last_error = Some("engine stopped unexpectedly".to_string());
            }
        });
    }
}

async fn run_activation(
    control: &dyn ControlPlane,
    settings: &ClientSettings,
    config_path: &std::path::Path,
    session: Uuid,
) -> ActivationOutcome {
    // Reclaim ports and handles an ungraceful previous run may still hold.
    if let Err(err) = control.stop().await {
        tracing::debug!(%session, error = %err, "forced stop failed");
    }
    tokio::time::sleep(settings.stop_grace()).await;

    let mut last_error = None;
    match StagedConfig::stage(config_path) {
        Ok(staged) => {
            for attempt in 0..=settings.max_start_retries {
                if attempt > 0 {
                    tokio::time::sleep(settings.retry_backoff()).await;
                }
                match control.start(staged.path(), &settings.log_level).await {
                    Ok(identifier) => {
                        let started_at = control.start_time().await.unwrap_or_default();
                        return ActivationOutcome {
                            status: StatusReply {
                                running: true,
                                identifier,
                            },
                            started_at,
                            error: None,
                        };
                    }
                    Err(err) => {
                        tracing::warn!(%session, attempt, error = %err, "start attempt failed");
                        last_error = Some(err.to_string());
                    }
                }
            }
        }
        Err(err) => {
            tracing::warn!(%session, error = %err, "cannot stage config");
            last_error = Some(err.to_string());
        }
    }

    reconcile(control, session, last_error).await
}

/// Adopt whatever the daemon reports; the engine may be up despite the errors.
async fn reconcile(
    control: &dyn ControlPlane,
    session: Uuid,
    last_error: Option<String>,
) -> ActivationOutcome {
    match control.status().await {
        Ok(status) if status.running => {
            tracing::info!(%session, "engine running despite start errors, adopting");
            ActivationOutcome {
                status,
                started_at: control.start_time().await.unwrap_or_default(),
                error: None,
            }
        }
        Ok(status) => ActivationOutcome {
            status,
            started_at: 0.0,
            error: last_error,
        },
        Err(err) => ActivationOutcome {
            status: StatusReply::default(),
            started_at: 0.0,
            error: Some(last_error.unwrap_or_else(|| err.to_string())),
        },
    }
}

async fn fetch_telemetry(control: &dyn ControlPlane, since_event: u64, since_line: u64) -> PollResult {
    let events = fetch_page(
        since_event,
        |since| control.recent_events(since),
        |page: &EventsPage| page.next_index,
    )
    .await;
    let lines = fetch_page(
        since_line,
        |since| control.recent_logs(since),
        |page: &LogLinesPage| page.next_index,
    )
    .await;
    let info = control
        .running_info()
        .await
        .map_err(|err| tracing::debug!(error = %err, "running info poll failed"))
        .ok()
        .flatten();
    let status = control
        .status()
        .await
        .map_err(|err| tracing::debug!(error = %err, "status poll failed"))
        .ok();

    let events_reset = events.as_ref().is_some_and(|(reset, _)| *reset);
    let lines_reset = lines.as_ref().is_some_and(|(reset, _)| *reset);
    PollResult {
        since_event: if events_reset { 0 } else { since_event },
        events_reset,
        events: events.map(|(_, page)| page),
        since_line: if lines_reset { 0 } else { since_line },
        lines_reset,
        lines: lines.map(|(_, page)| page),
        info,
        status,
        taken_at: Instant::now(),
    }
}

/// Fetch from `since`. If the daemon's index is behind the cursor its buffer
/// was cleared, so fetch again from zero. The flag reports that reset.
async fn fetch_page<P, F, Fut>(since: u64, fetch: F, next_index: fn(&P) -> u64) -> Option<(bool, P)>
where
    F: Fn(u64) -> Fut,
    Fut: std::future::Future<Output = Result<P, ClientError>>,
{
    let page = match fetch(since).await {
        Ok(page) => page,
        Err(err) => {
            tracing::debug!(error = %err, "telemetry poll failed");
            return None;
        }
    };
    if next_index(&page) >= since {
        return Some((false, page));
    }
    tracing::debug!(since, next_index = next_index(&page), "daemon buffer was reset, refetching");
    match fetch(0).await {
        Ok(page) => Some((true, page)),
        Err(err) => {
            tracing::debug!(error = %err, "telemetry refetch failed");
            None
        }
    }
}
