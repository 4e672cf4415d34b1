//! Ticket Sync: live record synchronization for the support-ticket dashboard.
//!
//! Responsibilities:
//! - paging historical tickets forward from the REST listing
//! - following the server-push event stream across reconnects
//! - merging both feeds into one deduplicated, presentation-ordered set
//! - projecting selection and connection status for the presentation layer

pub mod backoff;
pub mod config;
pub mod error;
pub mod http;
pub mod loader;
pub mod projector;
pub mod protocol;
pub mod session;
pub mod store;
pub mod stream;

pub use backoff::Backoff;
pub use config::{MergePolicy, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use http::{HttpEventSource, HttpPageSource};
pub use loader::{LoadOutcome, PageCursorLoader, PageSource};
pub use projector::ViewProjector;
pub use protocol::{Page, PageMeta, Record, StreamMessage};
pub use session::{StatusCommand, SyncSession};
pub use store::{PageSummary, ReconciliationStore, StoreChange};
pub use stream::{
    ConnectionEvent, ConnectionState, EventSource, FrameStream, Generation, StreamConfig,
    StreamConsumer, StreamHandle,
};
