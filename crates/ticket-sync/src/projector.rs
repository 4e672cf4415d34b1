use tokio::sync::watch;

use crate::protocol::Record;
use crate::store::ReconciliationStore;
use crate::stream::ConnectionState;

/// Read-only view over a session: the ordered records, the selected one, and
/// the connection status. Holds no state of its own beyond its receivers, so
/// it can be rebuilt at any time.
#[derive(Clone)]
pub struct ViewProjector {
    store: ReconciliationStore,
    revision: watch::Receiver<u64>,
    status: watch::Receiver<ConnectionState>,
}

impl ViewProjector {
    pub fn new(store: ReconciliationStore, status: watch::Receiver<ConnectionState>) -> Self {
        let revision = store.watch_revision();
        Self {
            store,
            revision,
            status,
        }
    }

    pub fn records(&self) -> Vec<Record> {
        self.store.snapshot()
    }

    /// The record with `id` as currently ordered in the snapshot, if any.
    pub fn selected(&self, id: &str) -> Option<Record> {
        self.store
            .snapshot()
            .into_iter()
            .find(|record| record.id == id)
    }

    pub fn connection_status(&self) -> ConnectionState {
        *self.status.borrow()
    }

    /// Waits until the store or the connection status changes. Returns
    /// `false` once the session behind this view is gone.
    pub async fn changed(&mut self) -> bool {
        tokio::select! {
            res = self.revision.changed() => res.is_ok(),
            res = self.status.changed() => res.is_ok(),
        }
    }
}
