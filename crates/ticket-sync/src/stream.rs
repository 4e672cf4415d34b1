//! Server-push consumer: one logical connection, reconnected with backoff.
//!
//! State machine:
//!
//! ```text
//! Disconnected --start--> Connecting --handshake ok--> Open
//! Connecting --4xx--> Disconnected (terminal)
//! Connecting/Open --recoverable failure--> Backoff --timer--> Connecting
//! any --stop / superseded--> Disconnected (terminal)
//! ```
//!
//! The run loop is the only writer of the connection state. Observers read the
//! current state from a watch channel and transitions from a broadcast channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::Backoff;
use crate::error::{SyncError, SyncResult};
use crate::protocol::StreamMessage;
use crate::store::ReconciliationStore;

const LOG_FRAME_PREVIEW: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Backoff,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Failed { error: SyncError, fatal: bool },
    RetryScheduled { attempt: u32, delay: Duration },
    FrameDropped(String),
}

/// Text frames of one open connection, in delivery order.
pub type FrameStream = BoxStream<'static, SyncResult<String>>;

#[async_trait]
pub trait EventSource: Send + Sync {
    /// Opens a connection and resolves once the handshake has been accepted.
    /// A 4xx rejection must be reported as [`SyncError::Protocol`].
    async fn connect(&self) -> SyncResult<FrameStream>;
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub backoff: Backoff,
    pub handshake_timeout: Duration,
    /// Maximum silence (heartbeats included) before the connection is recycled.
    pub liveness_timeout: Option<Duration>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            handshake_timeout: Duration::from_secs(10),
            liveness_timeout: Some(Duration::from_secs(45)),
        }
    }
}

/// Connection-generation identity shared by every consumer of a session.
///
/// Starting a newer generation retires all older ones; a retired consumer's
/// late frames and state changes are discarded.
#[derive(Debug, Clone)]
pub struct Generation {
    current: Arc<AtomicU64>,
    mine: u64,
}

impl Generation {
    pub fn root() -> Self {
        Self {
            current: Arc::new(AtomicU64::new(0)),
            mine: 0,
        }
    }

    pub fn next(&self) -> Self {
        let mine = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            current: Arc::clone(&self.current),
            mine,
        }
    }

    pub fn id(&self) -> u64 {
        self.mine
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.mine
    }
}

struct ConsumerShared {
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    last_error: Mutex<Option<SyncError>>,
    cancel: CancellationToken,
    stopped: AtomicBool,
    generation: Generation,
}

impl ConsumerShared {
    fn live(&self) -> bool {
        !self.cancel.is_cancelled() && self.generation.is_current()
    }

    fn transition(&self, next: ConnectionState) {
        if !self.live() {
            return;
        }
        self.force_state(next);
    }

    fn force_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!(
                target = "ticket_sync::stream",
                generation = self.generation.id(),
                state = ?next,
                "connection state changed"
            );
            let _ = self.events.send(ConnectionEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }
}

/// A not-yet-started consumer. [`StreamConsumer::start`] consumes it, so a
/// stopped connection can only be revived by building a new instance.
pub struct StreamConsumer {
    source: Arc<dyn EventSource>,
    store: ReconciliationStore,
    config: StreamConfig,
    shared: Arc<ConsumerShared>,
}

impl StreamConsumer {
    pub fn new(
        source: Arc<dyn EventSource>,
        store: ReconciliationStore,
        config: StreamConfig,
        generation: Generation,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        Self {
            source,
            store,
            config,
            shared: Arc::new(ConsumerShared {
                state,
                events,
                last_error: Mutex::new(None),
                cancel: CancellationToken::new(),
                stopped: AtomicBool::new(false),
                generation,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn start(self) -> StreamHandle {
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(self.run());
        StreamHandle {
            shared,
            task: Some(task),
        }
    }

    async fn run(self) {
        let shared = Arc::clone(&self.shared);
        let mut attempt: u32 = 0;
        info!(
            target = "ticket_sync::stream",
            generation = shared.generation.id(),
            "stream consumer started"
        );

        loop {
            if !shared.live() {
                break;
            }
            shared.transition(ConnectionState::Connecting);

            let handshake = timeout(self.config.handshake_timeout, self.source.connect());
            let outcome = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => break,
                outcome = handshake => outcome,
            };

            let failure = match outcome {
                Err(_) => SyncError::HandshakeTimeout(self.config.handshake_timeout),
                Ok(Err(err)) => err,
                Ok(Ok(frames)) => {
                    if !shared.live() {
                        break;
                    }
                    info!(
                        target = "ticket_sync::stream",
                        generation = shared.generation.id(),
                        "stream connection open"
                    );
                    shared.last_error.lock().take();
                    shared.transition(ConnectionState::Open);
                    attempt = 0;
                    match self.consume(frames).await {
                        Some(err) => err,
                        None => break,
                    }
                }
            };

            if !shared.live() {
                break;
            }
            *shared.last_error.lock() = Some(failure.clone());

            if failure.is_fatal() {
                error!(
                    target = "ticket_sync::stream",
                    generation = shared.generation.id(),
                    error = %failure,
                    "stream rejected by server; not reconnecting"
                );
                shared.emit(ConnectionEvent::Failed {
                    error: failure,
                    fatal: true,
                });
                shared.transition(ConnectionState::Disconnected);
                return;
            }

            let delay = self.config.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            warn!(
                target = "ticket_sync::stream",
                generation = shared.generation.id(),
                error = %failure,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "stream failed; reconnecting after backoff"
            );
            shared.emit(ConnectionEvent::Failed {
                error: failure,
                fatal: false,
            });
            shared.transition(ConnectionState::Backoff);
            shared.emit(ConnectionEvent::RetryScheduled { attempt, delay });

            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        shared.force_state(ConnectionState::Disconnected);
        debug!(
            target = "ticket_sync::stream",
            generation = shared.generation.id(),
            "stream consumer exited"
        );
    }

    /// Drains one connection. Returns the failure that ended it, or `None`
    /// when the consumer was stopped or superseded.
    async fn consume(&self, mut frames: FrameStream) -> Option<SyncError> {
        let shared = &self.shared;
        loop {
            let next = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => return None,
                next = next_frame(&mut frames, self.config.liveness_timeout) => next,
            };
            match next {
                Err(err) => return Some(err),
                Ok(None) => return Some(SyncError::StreamClosed),
                Ok(Some(Err(err))) => return Some(err),
                Ok(Some(Ok(text))) => {
                    if !shared.live() {
                        return None;
                    }
                    self.handle_frame(&text);
                }
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let message = match StreamMessage::parse(text) {
            Ok(message) => message,
            Err(err) => {
                let preview: String = text.chars().take(LOG_FRAME_PREVIEW).collect();
                warn!(
                    target = "ticket_sync::stream",
                    error = %err,
                    frame = %preview,
                    "dropping malformed frame"
                );
                self.shared
                    .emit(ConnectionEvent::FrameDropped(err.to_string()));
                return;
            }
        };

        match message {
            StreamMessage::Connected => {
                debug!(target = "ticket_sync::stream", "server acknowledged subscription");
                self.shared.transition(ConnectionState::Open);
            }
            StreamMessage::Heartbeat { timestamp } => {
                trace!(target = "ticket_sync::stream", ?timestamp, "heartbeat");
            }
            StreamMessage::Upsert(record) => {
                self.store.apply_upsert_if(record, || self.shared.live());
            }
            StreamMessage::Delete(id) => {
                self.store.apply_delete_if(&id, || self.shared.live());
            }
            StreamMessage::Unknown(kind) => {
                debug!(target = "ticket_sync::stream", kind = %kind, "ignoring unknown frame kind");
            }
        }
    }
}

async fn next_frame(
    frames: &mut FrameStream,
    liveness: Option<Duration>,
) -> SyncResult<Option<SyncResult<String>>> {
    match liveness {
        Some(window) => timeout(window, frames.next())
            .await
            .map_err(|_| SyncError::Liveness(window)),
        None => Ok(frames.next().await),
    }
}

/// Running consumer. Dropping the handle stops the connection.
pub struct StreamHandle {
    shared: Arc<ConsumerShared>,
    task: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.shared.last_error.lock().clone()
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation.id()
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Aborts the connection (open, opening, or backing off). Idempotent.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.cancel.cancel();
        self.shared.force_state(ConnectionState::Disconnected);
        info!(
            target = "ticket_sync::stream",
            generation = self.shared.generation.id(),
            "stream consumer stopped"
        );
    }

    /// Waits for the run loop to exit.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!(target = "ticket_sync::stream", error = %err, "stream task panicked");
            }
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
