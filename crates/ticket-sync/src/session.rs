use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::{MergePolicy, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::http::{HttpEventSource, HttpPageSource};
use crate::loader::{LoadOutcome, PageCursorLoader, PageSource};
use crate::projector::ViewProjector;
use crate::protocol::Record;
use crate::store::ReconciliationStore;
use crate::stream::{
    ConnectionState, EventSource, Generation, StreamConfig, StreamConsumer, StreamHandle,
};

/// Side channel for mutating a ticket's status on the server.
#[async_trait]
pub trait StatusCommand: Send + Sync {
    /// Returns whether the server accepted the change.
    async fn update_status(&self, id: &str, status: i64) -> SyncResult<bool>;
}

/// One live view of a collection: a store fed by a page cursor and a stream
/// consumer, torn down together.
pub struct SyncSession {
    store: ReconciliationStore,
    loader: PageCursorLoader,
    events: Arc<dyn EventSource>,
    commands: Option<Arc<dyn StatusCommand>>,
    stream_config: StreamConfig,
    generations: Generation,
    stream: Mutex<Option<StreamHandle>>,
    status: Arc<watch::Sender<ConnectionState>>,
    closed: AtomicBool,
}

impl SyncSession {
    pub fn new(
        pages: Arc<dyn PageSource>,
        events: Arc<dyn EventSource>,
        stream_config: StreamConfig,
        policy: MergePolicy,
    ) -> Self {
        let store = ReconciliationStore::new(policy);
        let (status, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            status: Arc::new(status),
            loader: PageCursorLoader::new(pages, store.clone()),
            store,
            events,
            commands: None,
            stream_config,
            generations: Generation::root(),
            stream: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// HTTP-backed session; the listing client doubles as the status command.
    pub fn from_config(config: &SyncConfig) -> Self {
        let pages = Arc::new(HttpPageSource::from_config(config));
        let events = Arc::new(HttpEventSource::from_config(config));
        Self::new(
            pages.clone(),
            events,
            config.stream_config(),
            config.merge_policy,
        )
        .with_status_command(pages)
    }

    pub fn with_status_command(mut self, commands: Arc<dyn StatusCommand>) -> Self {
        self.commands = Some(commands);
        self
    }

    /// Starts the stream consumer unless one is already running.
    pub fn start(&self) -> SyncResult<()> {
        if self.stream.lock().is_some() {
            return Ok(());
        }
        self.restart_stream().map(|_| ())
    }

    /// Replaces the stream consumer with a fresh one. The previous consumer is
    /// stopped and anything it still delivers is discarded.
    pub fn restart_stream(&self) -> SyncResult<u64> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled);
        }
        let generation = self.generations.next();
        let consumer = StreamConsumer::new(
            Arc::clone(&self.events),
            self.store.clone(),
            self.stream_config.clone(),
            generation.clone(),
        );
        let state = consumer.watch_state();
        let handle = consumer.start();
        tokio::spawn(relay_state(
            state,
            Arc::clone(&self.status),
            generation.clone(),
        ));

        let previous = self.stream.lock().replace(handle);
        if let Some(previous) = previous {
            previous.stop();
        }
        info!(
            target = "ticket_sync::session",
            generation = generation.id(),
            "stream consumer (re)started"
        );
        Ok(generation.id())
    }

    pub async fn load_next(&self) -> SyncResult<LoadOutcome> {
        self.loader.load_next().await
    }

    pub fn has_more(&self) -> bool {
        self.loader.has_more()
    }

    pub fn is_loading(&self) -> bool {
        self.loader.is_loading()
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.loader.last_error()
    }

    pub fn snapshot(&self) -> Vec<Record> {
        self.store.snapshot()
    }

    pub fn connection_status(&self) -> ConnectionState {
        *self.status.borrow()
    }

    pub fn last_stream_error(&self) -> Option<SyncError> {
        self.stream.lock().as_ref().and_then(StreamHandle::last_error)
    }

    pub fn store(&self) -> &ReconciliationStore {
        &self.store
    }

    pub fn projector(&self) -> ViewProjector {
        ViewProjector::new(self.store.clone(), self.status.subscribe())
    }

    /// Merges `patch` into the record for `id` as if the stream had sent it.
    pub fn apply_local_patch(&self, id: &str, patch: Map<String, Value>) -> Option<Record> {
        self.store.apply_local_patch(id, patch)
    }

    /// Sends a status change and, once accepted, patches the local copy.
    /// Returns the patched record, or `None` if the server declined or the
    /// record is not loaded.
    pub async fn update_status(&self, id: &str, status: i64) -> SyncResult<Option<Record>> {
        let commands = self
            .commands
            .as_ref()
            .ok_or(SyncError::NotConfigured("status command"))?;
        if !commands.update_status(id, status).await? {
            info!(target = "ticket_sync::session", id, status, "status update declined");
            return Ok(None);
        }
        let mut patch = Map::new();
        patch.insert("status".to_string(), Value::from(status));
        Ok(self.store.apply_local_patch(id, patch))
    }

    /// Empties the view and rewinds the cursor; the stream keeps running.
    pub fn reset(&self) {
        self.loader.reset();
        self.store.clear();
        info!(target = "ticket_sync::session", "session reset");
    }

    /// Cancels page loading and stops the stream. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.loader.close();
        if let Some(handle) = self.stream.lock().take() {
            handle.stop();
        }
        self.status.send_replace(ConnectionState::Disconnected);
        info!(target = "ticket_sync::session", "session shut down");
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn relay_state(
    mut source: watch::Receiver<ConnectionState>,
    sink: Arc<watch::Sender<ConnectionState>>,
    generation: Generation,
) {
    loop {
        let state = *source.borrow_and_update();
        let mut superseded = false;
        // The generation check runs under the sink's lock so a relay that
        // lost a restart race cannot publish after its successor.
        sink.send_if_modified(|current| {
            if !generation.is_current() {
                superseded = true;
                return false;
            }
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if superseded || source.changed().await.is_err() {
            break;
        }
    }
    debug!(
        target = "ticket_sync::session",
        generation = generation.id(),
        "state relay finished"
    );
}
