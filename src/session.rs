//! Sync session: full snapshot on connect, then incremental updates driven by
//! filesystem changes until the transport goes away.

use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    decode::{self, DecodeOptions},
    error::Error,
    graph::{self, Graph, GraphElement, Snapshot},
    identity::path_to_id,
    store::ObjectStore,
    transport::{Transport, TransportEvent},
    watch::{ChangeAction, ChangeEvent},
};

/// How the initial snapshot is handed to the transport
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// One JSON array holding every element
    #[default]
    Batched,
    /// One JSON object per element
    PerObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Snapshotting,
    Live,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Connecting => "connecting",
            SessionState::Snapshotting => "snapshotting",
            SessionState::Live => "live",
            SessionState::Closed => "closed",
        })
    }
}

/// Why a session reached `Closed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The observer closed the connection
    TransportClosed { code: Option<u16>, reason: String },
    /// A send failed or the connection errored
    TransportFailed(String),
    /// Local shutdown request; the connection was closed from our side
    Shutdown,
}

impl SessionEnd {
    pub fn is_graceful(&self) -> bool {
        !matches!(self, SessionEnd::TransportFailed(_))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    pub delivery: DeliveryMode,
    pub decode: DecodeOptions,
    pub read_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
}

/// One observer connection. Store access is serialised through the mutex and
/// runs on the blocking pool.
pub struct SyncSession<S, T> {
    store: Arc<Mutex<S>>,
    transport: T,
    options: SessionOptions,
    graph: Graph,
    state: SessionState,
}

impl<S, T> SyncSession<S, T>
where
    S: ObjectStore + 'static,
    T: Transport,
{
    /// Start a session on an already connected transport
    pub fn new(store: Arc<Mutex<S>>, transport: T, options: SessionOptions) -> Self {
        Self {
            store,
            transport,
            options,
            graph: Graph::new(),
            state: SessionState::Connecting,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Elements sent so far
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!("Session {} -> {}", self.state, next);
        self.state = next;
    }

    /// Drive the session to completion.
    ///
    /// Errors are fatal conditions (store failure or a missing object during the
    /// snapshot). Per-event failures while live are logged and skipped.
    pub async fn run<F>(
        mut self,
        mut changes: mpsc::Receiver<ChangeEvent>,
        mut transport_events: mpsc::Receiver<TransportEvent>,
        shutdown: F,
    ) -> Result<SessionEnd, Error>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        self.transition(SessionState::Snapshotting);
        let delivered = tokio::select! {
            biased;

            _ = &mut shutdown => None,
            delivered = self.send_snapshot() => Some(delivered),
        };
        match delivered {
            None => {
                tracing::info!("Shutdown requested during snapshot, closing connection");
                self.close_transport().await;
                self.transition(SessionState::Closed);
                return Ok(SessionEnd::Shutdown);
            }
            Some(delivered) => {
                if let Err(end) = delivered? {
                    self.transition(SessionState::Closed);
                    return Ok(end);
                }
            }
        }

        self.transition(SessionState::Live);
        let mut watching = true;

        let end = loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, closing connection");
                    self.close_transport().await;
                    break SessionEnd::Shutdown;
                }

                event = transport_events.recv() => match event {
                    Some(TransportEvent::Closed { code, reason }) => {
                        tracing::info!("Connection closed with status code {:?} {}", code, reason);
                        break SessionEnd::TransportClosed { code, reason };
                    }
                    Some(TransportEvent::Error(info)) => {
                        tracing::error!("Transport error: {}", info);
                        break SessionEnd::TransportFailed(info);
                    }
                    None => {
                        break SessionEnd::TransportClosed {
                            code: None,
                            reason: "transport event channel closed".to_string(),
                        };
                    }
                },

                change = changes.recv(), if watching => match change {
                    Some(change) => {
                        if let Err(end) = self.handle_change(change).await {
                            break end;
                        }
                    }
                    None => {
                        tracing::warn!("Filesystem watch ended; no further updates will be sent");
                        watching = false;
                    }
                },
            }
        };

        tracing::info!(
            "Session closed after sending {} nodes and {} edges",
            self.graph.node_count(),
            self.graph.edge_count()
        );
        self.transition(SessionState::Closed);
        Ok(end)
    }

    async fn close_transport(&mut self) {
        if let Err(e) = self.transport.close().await {
            tracing::warn!("{}", e);
        }
    }

    fn with_store<R, F>(&self, what: String, f: F) -> impl Future<Output = Result<R, Error>>
    where
        R: Send + 'static,
        F: FnOnce(&S) -> Result<R, Error> + Send + 'static,
    {
        run_blocking(Arc::clone(&self.store), self.options.read_timeout, what, f)
    }

    /// Send one payload, turning failures into a session end
    async fn send(&mut self, payload: String) -> Result<(), SessionEnd> {
        let result = match self.options.send_timeout {
            Some(limit) => tokio::time::timeout(limit, self.transport.send(payload))
                .await
                .unwrap_or_else(|_| Err(Error::Timeout("transport send".to_string()))),
            None => self.transport.send(payload).await,
        };

        result.map_err(|e| {
            tracing::warn!("Dropping payload: {}", e);
            SessionEnd::TransportFailed(e.to_string())
        })
    }

    async fn send_elements(&mut self, elements: Vec<GraphElement>) -> Result<(), SessionEnd> {
        for element in elements {
            let payload = element
                .to_json()
                .map_err(|e| SessionEnd::TransportFailed(e.to_string()))?;
            self.send(payload).await?;
            self.graph.insert(element);
        }
        Ok(())
    }

    /// Enumerate, decode and deliver everything in the store. The outer error is
    /// fatal, the inner one means the transport went away.
    async fn send_snapshot(&mut self) -> Result<Result<(), SessionEnd>, Error> {
        let ids = self
            .with_store("object enumeration".to_string(), |store| store.enumerate())
            .await?;
        tracing::info!("Building snapshot of {} objects", ids.len());

        // One store call per object; the read timeout bounds each decode
        let pb = graph::snapshot_progress(ids.len());
        let mut snapshot = Snapshot::default();
        for id in ids {
            let options = self.options.decode;
            let target = id.clone();
            let decoded = self
                .with_store(format!("decode of {}", id), move |store| {
                    decode::decode(store, &target, &options)
                })
                .await;

            let recorded = snapshot.record(&id, decoded);
            if let Some(ref bar) = pb {
                if recorded.is_err() {
                    bar.abandon();
                } else {
                    bar.inc(1);
                }
            }
            recorded?;
        }
        if let Some(ref bar) = pb {
            bar.finish_with_message("Snapshot decoded");
        }

        if !snapshot.skipped.is_empty() {
            tracing::warn!("{} malformed object(s) left out of the snapshot", snapshot.skipped.len());
        }

        tracing::info!(
            "Sending snapshot of {} elements ({:?})",
            snapshot.elements.len(),
            self.options.delivery
        );
        let delivered = match self.options.delivery {
            DeliveryMode::Batched => {
                let payload = serde_json::to_string(&snapshot.elements)?;
                let sent = self.send(payload).await;
                if sent.is_ok() {
                    self.graph.extend(snapshot.elements);
                }
                sent
            }
            DeliveryMode::PerObject => self.send_elements(snapshot.elements).await,
        };
        Ok(delivered)
    }

    /// Live-state handling of one filesystem change. Only transport failures end
    /// the session.
    async fn handle_change(&mut self, change: ChangeEvent) -> Result<(), SessionEnd> {
        tracing::info!("{}", change);

        if change.action == ChangeAction::Delete {
            // Deleted objects stay in the observer's graph.
            return Ok(());
        }

        let id = match path_to_id(&change.directory, &change.filename) {
            Ok(id) => id,
            Err(e) => {
                tracing::trace!("Ignoring change: {}", e);
                return Ok(());
            }
        };

        let options = self.options.decode;
        let target = id.clone();
        let elements = match self
            .with_store(format!("decode of {}", id), move |store| {
                graph::update(store, &target, &options)
            })
            .await
        {
            Ok(elements) => elements,
            Err(e) => {
                tracing::warn!("Skipping update for {}: {}", id, e);
                return Ok(());
            }
        };

        self.send_elements(elements).await
    }
}

/// Run `f` against the store on the blocking pool, bounded by `limit`
async fn run_blocking<S, R, F>(
    store: Arc<Mutex<S>>,
    limit: Option<Duration>,
    what: String,
    f: F,
) -> Result<R, Error>
where
    S: ObjectStore + 'static,
    R: Send + 'static,
    F: FnOnce(&S) -> Result<R, Error> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(move || {
        let guard = store
            .lock()
            .map_err(|_| Error::StoreUnavailable("store lock poisoned".to_string()))?;
        f(&guard)
    });

    let joined = match limit {
        Some(limit) => tokio::time::timeout(limit, task)
            .await
            .map_err(|_| Error::Timeout(what))?,
        None => task.await,
    };
    joined.map_err(|e| Error::StoreUnavailable(format!("store task failed: {}", e)))?
}
