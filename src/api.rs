//! # Async API for NestDB
//!
//! [`EventStore`] is synchronous: every call takes a lock and, with a SQLite
//! backend, may do disk I/O. Calling it from async code would block the
//! runtime's worker threads, so [`StoreHandle`] moves the work onto a
//! dedicated OS thread and hands results back over oneshot channels.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                Tokio Runtime                 │
//! │   task1 ─┐                                   │
//! │   task2 ─┼── mpsc::Sender<StoreRequest> ──┐  │
//! │   task3 ─┘        (async send)            │  │
//! └───────────────────────────────────────────┼──┘
//!                                             ▼
//!                               ┌──────────────────────────┐
//!                               │   "nestdb-store" thread  │
//!                               │   blocking_recv loop     │
//!                               │   owns an EventStore     │
//!                               └──────────────────────────┘
//! ```
//!
//! Views and subscriptions don't go through the thread. They only read the
//! in-process change feed, so [`StoreHandle::store`] exposes the store for
//! them directly.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::pointer::Pointer;
use crate::store::EventStore;
use crate::types::{Event, EventId, ReplaceableKey};

// =============================================================================
// Requests
// =============================================================================

type Responder<T> = oneshot::Sender<Result<T>>;

/// Work sent to the store thread.
enum StoreRequest {
    Add {
        event: Event,
        response: Responder<(Arc<Event>, bool)>,
    },
    AddBatch {
        events: Vec<Event>,
        response: oneshot::Sender<Vec<Result<(Arc<Event>, bool)>>>,
    },
    Remove {
        id: EventId,
        response: Responder<bool>,
    },
    Get {
        id: EventId,
        response: Responder<Option<Arc<Event>>>,
    },
    GetReplaceable {
        key: ReplaceableKey,
        response: Responder<Option<Arc<Event>>>,
    },
    GetByPointer {
        pointer: Pointer,
        response: Responder<Option<Arc<Event>>>,
    },
    Query {
        filters: Vec<Filter>,
        response: Responder<Vec<Arc<Event>>>,
    },
    QueryTimeline {
        filters: Vec<Filter>,
        include_old_versions: bool,
        response: Responder<Vec<Arc<Event>>>,
    },
    Prune {
        max: usize,
        response: Responder<usize>,
    },
    PruneExpired {
        response: Responder<usize>,
    },
    Close {
        response: Responder<()>,
    },
}

// =============================================================================
// Store Handle
// =============================================================================

/// Async handle to an [`EventStore`].
///
/// `Clone`, `Send` and `Sync`; all clones talk to the same thread. After
/// [`close`](Self::close) every request fails with `Error::Closed`.
///
/// # Example
///
/// ```rust,ignore
/// let handle = StoreHandle::spawn(EventStore::open("events.db", StoreConfig::from_env())?)?;
/// handle.add(event).await?;
/// let notes = handle.query_timeline(vec![Filter::new().kinds([1u16])], false).await?;
/// handle.close().await?;
/// ```
#[derive(Clone)]
pub struct StoreHandle {
    store: EventStore,
    request_tx: mpsc::Sender<StoreRequest>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("store", &self.store)
            .field("closed", &self.request_tx.is_closed())
            .finish()
    }
}

impl StoreHandle {
    /// Starts the store thread. The request channel is sized by the store's
    /// `request_channel_size` setting.
    pub fn spawn(store: EventStore) -> Result<Self> {
        let (request_tx, request_rx) = mpsc::channel(store.config().request_channel_size.max(1));
        let thread_store = store.clone();
        let thread = thread::Builder::new()
            .name("nestdb-store".to_string())
            .spawn(move || run_store_thread(thread_store, request_rx))
            .map_err(|e| Error::Backend(format!("failed to spawn store thread: {e}")))?;

        Ok(Self {
            store,
            request_tx,
            thread: Arc::new(Mutex::new(Some(thread))),
        })
    }

    /// The store itself, for views and feed subscriptions.
    pub fn store(&self) -> &EventStore {
        &self.store
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> StoreRequest) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send(make(response_tx))
            .await
            .map_err(|_| Error::Closed)?;
        response_rx.await.map_err(|_| Error::Closed)
    }

    /// See [`EventStore::add`].
    pub async fn add(&self, event: Event) -> Result<(Arc<Event>, bool)> {
        self.request(|response| StoreRequest::Add { event, response })
            .await?
    }

    /// Adds events in order on the store thread. One result per event; a
    /// rejected event does not stop the rest.
    pub async fn add_batch(&self, events: Vec<Event>) -> Result<Vec<Result<(Arc<Event>, bool)>>> {
        self.request(|response| StoreRequest::AddBatch { events, response })
            .await
    }

    /// See [`EventStore::remove`].
    pub async fn remove(&self, id: impl Into<EventId>) -> Result<bool> {
        let id = id.into();
        self.request(|response| StoreRequest::Remove { id, response })
            .await?
    }

    /// See [`EventStore::get`].
    pub async fn get(&self, id: impl Into<EventId>) -> Result<Option<Arc<Event>>> {
        let id = id.into();
        self.request(|response| StoreRequest::Get { id, response })
            .await?
    }

    /// See [`EventStore::get_replaceable`].
    pub async fn get_replaceable(&self, key: ReplaceableKey) -> Result<Option<Arc<Event>>> {
        self.request(|response| StoreRequest::GetReplaceable { key, response })
            .await?
    }

    /// See [`EventStore::get_by_pointer`].
    pub async fn get_by_pointer(&self, pointer: Pointer) -> Result<Option<Arc<Event>>> {
        self.request(|response| StoreRequest::GetByPointer { pointer, response })
            .await?
    }

    /// See [`EventStore::query`].
    pub async fn query(&self, filters: Vec<Filter>) -> Result<Vec<Arc<Event>>> {
        self.request(|response| StoreRequest::Query { filters, response })
            .await?
    }

    /// See [`EventStore::query_timeline`].
    pub async fn query_timeline(
        &self,
        filters: Vec<Filter>,
        include_old_versions: bool,
    ) -> Result<Vec<Arc<Event>>> {
        self.request(|response| StoreRequest::QueryTimeline {
            filters,
            include_old_versions,
            response,
        })
        .await?
    }

    /// See [`EventStore::prune`].
    pub async fn prune(&self, max: usize) -> Result<usize> {
        self.request(|response| StoreRequest::Prune { max, response })
            .await?
    }

    /// See [`EventStore::prune_expired`].
    pub async fn prune_expired(&self) -> Result<usize> {
        self.request(|response| StoreRequest::PruneExpired { response })
            .await?
    }

    /// Closes the store and stops the thread. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let result = match self.request(|response| StoreRequest::Close { response }).await {
            Ok(result) => result,
            Err(Error::Closed) => Ok(()),
            Err(err) => Err(err),
        };

        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            tokio::task::spawn_blocking(move || {
                if thread.join().is_err() {
                    error!("store thread panicked");
                }
            })
            .await
            .map_err(|e| Error::Backend(format!("failed to join store thread: {e}")))?;
        }
        result
    }
}

// =============================================================================
// Store Thread
// =============================================================================

fn run_store_thread(store: EventStore, mut request_rx: mpsc::Receiver<StoreRequest>) {
    debug!("store thread started");
    // Dropped senders are fine: the caller gave up waiting.
    while let Some(request) = request_rx.blocking_recv() {
        match request {
            StoreRequest::Add { event, response } => {
                let _ = response.send(store.add(event));
            }
            StoreRequest::AddBatch { events, response } => {
                let results = events.into_iter().map(|e| store.add(e)).collect();
                let _ = response.send(results);
            }
            StoreRequest::Remove { id, response } => {
                let _ = response.send(store.remove(&id));
            }
            StoreRequest::Get { id, response } => {
                let _ = response.send(store.get(&id));
            }
            StoreRequest::GetReplaceable { key, response } => {
                let _ = response.send(store.get_replaceable(&key));
            }
            StoreRequest::GetByPointer { pointer, response } => {
                let _ = response.send(store.get_by_pointer(&pointer));
            }
            StoreRequest::Query { filters, response } => {
                let _ = response.send(store.query(&filters));
            }
            StoreRequest::QueryTimeline {
                filters,
                include_old_versions,
                response,
            } => {
                let _ = response.send(store.query_timeline(&filters, include_old_versions));
            }
            StoreRequest::Prune { max, response } => {
                let _ = response.send(store.prune(max));
            }
            StoreRequest::PruneExpired { response } => {
                let _ = response.send(store.prune_expired());
            }
            StoreRequest::Close { response } => {
                let _ = response.send(store.close());
                break;
            }
        }
    }
    info!("store thread stopped");
}
