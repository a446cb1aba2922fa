//! Lazily established, self-invalidating connection to the daemon socket.
//!
//! One [`ChannelManager`] holds at most one live channel. Calls on it are
//! multiplexed by request id; a reader task routes each response line to the
//! waiting caller. When the daemon closes the connection the reader clears the
//! cached channel, so the next call connects afresh. A call that fails at the
//! transport level also drops the channel right away and is retried once on a
//! new one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use meshbar_daemon::{Command, Request, Response};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::control::ControlPlane;
use crate::error::ClientError;

type Slot = Arc<Mutex<Option<Arc<Channel>>>>;

pub struct ChannelManager {
    socket: PathBuf,
    call_timeout: Duration,
    slot: Slot,
    next_id: AtomicU64,
    generation: AtomicU64,
}

impl ChannelManager {
    pub fn new(socket: PathBuf, call_timeout: Duration) -> Self {
        Self {
            socket,
            call_timeout,
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
            generation: AtomicU64::new(0),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.slot).is_some()
    }

    /// The cached channel, or a freshly connected one.
    pub async fn channel(&self) -> Result<Arc<Channel>, ClientError> {
        if let Some(channel) = lock(&self.slot).clone() {
            return Ok(channel);
        }

        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|err| ClientError::Unreachable {
                socket: self.socket.clone(),
                reason: err.to_string(),
            })?;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let channel = Arc::new(Channel::open(stream, generation, Arc::downgrade(&self.slot)));

        let mut slot = lock(&self.slot);
        match slot.as_ref() {
            // Another caller connected first; use theirs.
            Some(existing) => Ok(existing.clone()),
            None => {
                tracing::debug!(socket = %self.socket.display(), generation, "channel established");
                *slot = Some(channel.clone());
                Ok(channel)
            }
        }
    }

    /// Drop the cached channel; the next call reconnects.
    pub fn invalidate(&self) {
        if lock(&self.slot).take().is_some() {
            tracing::debug!(socket = %self.socket.display(), "channel invalidated");
        }
    }

    fn invalidate_generation(&self, generation: u64) {
        clear_slot(&self.slot, generation);
    }

    /// Send one command. Transport failures are retried once on a new channel.
    pub async fn call(&self, command: Command) -> Result<Value, ClientError> {
        let mut last_failure = String::new();

        for attempt in 0..2 {
            let channel = match self.channel().await {
                Ok(channel) => channel,
                Err(ClientError::Unreachable { reason, .. }) => {
                    tracing::debug!(attempt, error = %reason, "connect failed");
                    last_failure = reason;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            match channel.request(id, command.clone(), self.call_timeout).await {
                Ok(response) => return response.into_result().map_err(ClientError::Remote),
                Err(CallFailure::Transport(reason)) => {
                    tracing::warn!(
                        op = command.name(),
                        attempt,
                        error = %reason,
                        "transport failure, dropping channel",
                    );
                    self.invalidate_generation(channel.generation);
                    last_failure = reason;
                }
                Err(CallFailure::Timeout) => {
                    self.invalidate_generation(channel.generation);
                    return Err(ClientError::Timeout {
                        op: command.name(),
                        after: self.call_timeout,
                    });
                }
            }
        }

        Err(ClientError::Unreachable {
            socket: self.socket.clone(),
            reason: last_failure,
        })
    }
}

#[async_trait]
impl ControlPlane for ChannelManager {
    async fn call(&self, command: Command) -> Result<Value, ClientError> {
        ChannelManager::call(self, command).await
    }
}

enum CallFailure {
    Transport(String),
    Timeout,
}

#[derive(Default)]
struct Waiters {
    closed: bool,
    pending: HashMap<u64, oneshot::Sender<Response>>,
}

/// One connection to the daemon.
pub struct Channel {
    generation: u64,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    waiters: Arc<Mutex<Waiters>>,
    reader: JoinHandle<()>,
}

impl Channel {
    fn open(stream: UnixStream, generation: u64, slot: Weak<Mutex<Option<Arc<Channel>>>>) -> Self {
        let (reader, writer) = stream.into_split();
        let waiters = Arc::new(Mutex::new(Waiters::default()));
        let reader = tokio::spawn(read_responses(reader, waiters.clone(), slot, generation));
        Self {
            generation,
            writer: tokio::sync::Mutex::new(writer),
            waiters,
            reader,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.waiters).closed
    }

    async fn request(
        &self,
        id: u64,
        cmd: Command,
        timeout: Duration,
    ) -> Result<Response, CallFailure> {
        let (tx, rx) = oneshot::channel();
        {
            let mut waiters = lock(&self.waiters);
            if waiters.closed {
                return Err(CallFailure::Transport("channel closed".to_string()));
            }
            waiters.pending.insert(id, tx);
        }

        let mut line = serde_json::to_string(&Request { id, cmd })
            .map_err(|err| CallFailure::Transport(err.to_string()))?;
        line.push('\n');

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.write_all(line.as_bytes()).await {
                Ok(()) => writer.flush().await,
                Err(err) => Err(err),
            }
        };
        if let Err(err) = written {
            lock(&self.waiters).pending.remove(&id);
            return Err(CallFailure::Transport(err.to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(CallFailure::Transport(
                "connection closed before response".to_string(),
            )),
            Err(_) => {
                lock(&self.waiters).pending.remove(&id);
                Err(CallFailure::Timeout)
            }
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_responses(
    reader: OwnedReadHalf,
    waiters: Arc<Mutex<Waiters>>,
    slot: Weak<Mutex<Option<Arc<Channel>>>>,
    generation: u64,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let response: Response = match serde_json::from_str(&line) {
                    Ok(response) => response,
                    Err(err) => {
                        tracing::debug!(error = %err, "ignoring malformed response line");
                        continue;
                    }
                };
                let waiter = lock(&waiters).pending.remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => tracing::debug!(id = response.id, "response for unknown request"),
                }
            }
            Ok(None) => {
                tracing::debug!(generation, "service closed the channel");
                break;
            }
            Err(err) => {
                tracing::debug!(generation, error = %err, "channel read failed");
                break;
            }
        }
    }

    {
        let mut waiters = lock(&waiters);
        waiters.closed = true;
        // Dropping the senders fails every in-flight call.
        waiters.pending.clear();
    }
    if let Some(slot) = slot.upgrade() {
        clear_slot(&slot, generation);
    }
}

fn clear_slot(slot: &Mutex<Option<Arc<Channel>>>, generation: u64) {
    let mut slot = lock(slot);
    if slot.as_ref().map(|c| c.generation) == Some(generation) {
        tracing::debug!(generation, "channel invalidated");
        *slot = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
