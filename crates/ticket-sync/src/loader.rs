use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::protocol::Page;
use crate::store::ReconciliationStore;

/// Paginated listing the loader walks forward through.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetches the 1-based `page`.
    async fn fetch_page(&self, page: u32) -> SyncResult<Page>;
}

#[derive(Debug, Clone)]
pub enum LoadOutcome {
    Loaded(Arc<Page>),
    /// The listing ended on an earlier page; nothing was fetched.
    Exhausted,
}

type InFlight = Shared<BoxFuture<'static, SyncResult<LoadOutcome>>>;

struct CursorState {
    next_page: u32,
    has_more: bool,
    last_error: Option<SyncError>,
    in_flight: Option<InFlight>,
    epoch: u64,
    cancel: CancellationToken,
    closed: bool,
}

impl CursorState {
    fn fresh(epoch: u64) -> Self {
        Self {
            next_page: 1,
            has_more: true,
            last_error: None,
            in_flight: None,
            epoch,
            cancel: CancellationToken::new(),
            closed: false,
        }
    }
}

struct LoaderInner {
    source: Arc<dyn PageSource>,
    store: ReconciliationStore,
    state: Mutex<CursorState>,
}

/// Forward-only page cursor with at most one fetch outstanding.
#[derive(Clone)]
pub struct PageCursorLoader {
    inner: Arc<LoaderInner>,
}

impl PageCursorLoader {
    pub fn new(source: Arc<dyn PageSource>, store: ReconciliationStore) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                source,
                store,
                state: Mutex::new(CursorState::fresh(0)),
            }),
        }
    }

    /// Fetches the next page and merges it into the store.
    ///
    /// Calls made while a fetch is outstanding join that fetch and observe its
    /// result. Once the listing is exhausted this returns
    /// [`LoadOutcome::Exhausted`] without touching the network. Failures leave
    /// the cursor where it was so the next trigger retries the same page.
    pub async fn load_next(&self) -> SyncResult<LoadOutcome> {
        let pending = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(SyncError::Cancelled);
            }
            if !state.has_more {
                return Ok(LoadOutcome::Exhausted);
            }
            match &state.in_flight {
                Some(pending) => {
                    debug!(
                        target = "ticket_sync::loader",
                        page = state.next_page,
                        "joining in-flight page fetch"
                    );
                    pending.clone()
                }
                None => {
                    let pending = fetch(
                        Arc::clone(&self.inner),
                        state.next_page,
                        state.epoch,
                        state.cancel.clone(),
                    )
                    .boxed()
                    .shared();
                    state.in_flight = Some(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    pub fn has_more(&self) -> bool {
        self.inner.state.lock().has_more
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.lock().in_flight.is_some()
    }

    pub fn last_error(&self) -> Option<SyncError> {
        self.inner.state.lock().last_error.clone()
    }

    /// Page the next `load_next` will request.
    pub fn next_page(&self) -> u32 {
        self.inner.state.lock().next_page
    }

    /// Cancels any in-flight fetch and rewinds to page 1.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.cancel.cancel();
        *state = CursorState::fresh(state.epoch + 1);
    }

    /// Cancels any in-flight fetch; later calls fail with [`SyncError::Cancelled`].
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        state.cancel.cancel();
        state.epoch += 1;
        state.in_flight = None;
        state.closed = true;
    }
}

async fn fetch(
    inner: Arc<LoaderInner>,
    page: u32,
    epoch: u64,
    cancel: CancellationToken,
) -> SyncResult<LoadOutcome> {
    debug!(target = "ticket_sync::loader", page, "fetching page");
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SyncError::Cancelled),
        result = inner.source.fetch_page(page) => result,
    };

    let mut state = inner.state.lock();
    if state.epoch != epoch {
        debug!(
            target = "ticket_sync::loader",
            page, "discarding page fetched before reset"
        );
        return Err(SyncError::Cancelled);
    }
    state.in_flight = None;
    match result {
        Ok(fetched) => {
            let has_more = fetched.has_more();
            let fetched = Arc::new(fetched);
            inner.store.apply_page(fetched.data.iter().cloned());
            state.next_page = page + 1;
            state.has_more = has_more;
            state.last_error = None;
            info!(
                target = "ticket_sync::loader",
                page,
                records = fetched.data.len(),
                has_more,
                "page loaded"
            );
            Ok(LoadOutcome::Loaded(fetched))
        }
        Err(err) => {
            warn!(target = "ticket_sync::loader", page, error = %err, "page fetch failed");
            state.last_error = Some(err.clone());
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PageMeta, Record};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct ScriptedSource {
        calls: AtomicUsize,
        requested: Mutex<Vec<u32>>,
        responses: Mutex<VecDeque<SyncResult<Page>>>,
        delay: Duration,
    }

    impl ScriptedSource {
        fn new(responses: Vec<SyncResult<Page>>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                requested: Mutex::new(Vec::new()),
                responses: Mutex::new(responses.into()),
                delay,
            })
        }
    }

    #[async_trait]
    impl PageSource for ScriptedSource {
        async fn fetch_page(&self, page: u32) -> SyncResult<Page> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requested.lock().push(page);
            tokio::time::sleep(self.delay).await;
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(SyncError::Transport("script exhausted".into())))
        }
    }

    fn page(current: u32, next: Option<u32>, ids: &[&str]) -> Page {
        Page {
            data: ids.iter().map(|id| Record::new(*id)).collect(),
            meta: PageMeta {
                is_first_page: current == 1,
                is_last_page: next.is_none(),
                current_page: current,
                previous_page: current.checked_sub(1).filter(|p| *p > 0),
                next_page: next,
            },
        }
    }

    #[tokio::test]
    async fn walks_pages_until_exhausted() {
        let source = ScriptedSource::new(
            vec![
                Ok(page(1, Some(2), &["a", "b"])),
                Ok(page(2, None, &["c"])),
            ],
            Duration::ZERO,
        );
        let store = ReconciliationStore::default();
        let loader = PageCursorLoader::new(source.clone(), store.clone());

        assert!(matches!(
            loader.load_next().await.unwrap(),
            LoadOutcome::Loaded(_)
        ));
        assert!(loader.has_more());
        loader.load_next().await.unwrap();
        assert!(!loader.has_more());
        assert!(matches!(
            loader.load_next().await.unwrap(),
            LoadOutcome::Exhausted
        ));

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(*source.requested.lock(), vec![1, 2]);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_fetch() {
        let source = ScriptedSource::new(
            vec![Ok(page(1, Some(2), &["a"]))],
            Duration::from_millis(30),
        );
        let loader = PageCursorLoader::new(source.clone(), ReconciliationStore::default());

        let (first, second) = tokio::join!(loader.load_next(), loader.load_next());
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(loader.next_page(), 2);
        assert!(!loader.is_loading());
    }

    #[tokio::test]
    async fn failure_keeps_cursor_and_surfaces_error() {
        let source = ScriptedSource::new(
            vec![
                Err(SyncError::protocol(reqwest::StatusCode::BAD_GATEWAY)),
                Ok(page(1, None, &["a"])),
            ],
            Duration::ZERO,
        );
        let loader = PageCursorLoader::new(source.clone(), ReconciliationStore::default());

        let err = loader.load_next().await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol { status: 502, .. }));
        assert!(loader.has_more());
        assert_eq!(loader.last_error(), Some(err));
        assert_eq!(loader.next_page(), 1);

        loader.load_next().await.unwrap();
        assert_eq!(*source.requested.lock(), vec![1, 1]);
        assert_eq!(loader.last_error(), None);
        assert!(!loader.has_more());
    }

    #[tokio::test]
    async fn close_cancels_in_flight_fetch() {
        let source = ScriptedSource::new(
            vec![Ok(page(1, Some(2), &["a"]))],
            Duration::from_secs(30),
        );
        let store = ReconciliationStore::default();
        let loader = PageCursorLoader::new(source.clone(), store.clone());

        let pending = tokio::spawn({
            let loader = loader.clone();
            async move { loader.load_next().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(loader.is_loading());
        loader.close();

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("cancelled fetch returns promptly")
            .expect("task joined");
        assert_eq!(result.unwrap_err(), SyncError::Cancelled);
        assert!(store.is_empty());
        assert_eq!(loader.load_next().await.unwrap_err(), SyncError::Cancelled);
    }

    #[tokio::test]
    async fn reset_rewinds_to_first_page() {
        let source = ScriptedSource::new(
            vec![Ok(page(1, None, &["a"])), Ok(page(1, None, &["a"]))],
            Duration::ZERO,
        );
        let loader = PageCursorLoader::new(source.clone(), ReconciliationStore::default());
        loader.load_next().await.unwrap();
        assert!(!loader.has_more());

        loader.reset();
        assert!(loader.has_more());
        assert_eq!(loader.next_page(), 1);
        loader.load_next().await.unwrap();
        assert_eq!(*source.requested.lock(), vec![1, 1]);
    }
}
