//! Catalog aggregator — owns every backend connection and the current
//! catalog snapshot.
//!
//! The connection registry is fixed at construction. The catalog is rebuilt
//! once after startup and again whenever a connection changes state or tool
//! list. Each rebuild publishes a fresh `Arc<Catalog>`; readers holding the
//! previous one are unaffected.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::registry::Catalog;
use crate::backend::{
    BackendConnection, BackendError, BackendEvent, ConnectionSettings, ConnectionState,
    ProviderSpec,
};

/// Supervises all provider connections and serves the merged catalog.
pub struct CatalogAggregator {
    connections: BTreeMap<String, Arc<BackendConnection>>,
    snapshot: watch::Sender<Arc<Catalog>>,
    revision: AtomicU64,
    /// Serializes rebuilds so revisions are published in order.
    rebuild_lock: Mutex<()>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<BackendEvent>>>,
}

impl CatalogAggregator {
    /// Create one connection per provider spec. Nothing is launched yet.
    pub fn new<I>(specs: I, settings: ConnectionSettings) -> Arc<Self>
    where
        I: IntoIterator<Item = ProviderSpec>,
    {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connections = specs
            .into_iter()
            .map(|spec| {
                let name = spec.name.clone();
                (name, BackendConnection::new(spec, settings, events_tx.clone()))
            })
            .collect();
        let (snapshot, _) = watch::channel(Arc::new(Catalog::empty()));

        Arc::new(Self {
            connections,
            snapshot,
            revision: AtomicU64::new(0),
            rebuild_lock: Mutex::new(()),
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Launch every provider concurrently, discover capabilities, rebuild.
    ///
    /// Returns the providers that failed (partial startup is fine: a failed
    /// provider contributes no capabilities). Also starts the rebuild loop.
    pub async fn start_all(self: &Arc<Self>) -> Vec<(String, BackendError)> {
        let handles: Vec<_> = self
            .connections
            .iter()
            .map(|(name, conn)| {
                let conn = Arc::clone(conn);
                (
                    name.clone(),
                    tokio::spawn(async move {
                        conn.start().await?;
                        conn.list_capabilities().await.map(|_| ())
                    }),
                )
            })
            .collect();

        let mut errors = Vec::new();
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(provider = %name, error = %e, "provider failed to start (non-fatal)");
                    errors.push((name, e));
                }
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "provider startup task panicked");
                    errors.push((
                        name.clone(),
                        BackendError::Launch {
                            provider: name,
                            reason: format!("join error: {e}"),
                        },
                    ));
                }
            }
        }

        // Everything that happened so far is reflected by the rebuild below.
        if let Some(rx) = self.events_rx.lock().as_mut() {
            while rx.try_recv().is_ok() {}
        }
        let catalog = self.rebuild();
        tracing::info!(
            revision = catalog.revision(),
            summary = %catalog.summary(),
            "initial catalog built"
        );

        self.spawn_event_loop();
        errors
    }

    /// Shut down every provider and publish an empty catalog.
    pub async fn shutdown_all(&self) {
        let shutdowns = self.connections.values().map(|conn| conn.shutdown());
        futures::future::join_all(shutdowns).await;
        self.rebuild();
    }

    // ─── Catalog ─────────────────────────────────────────────────────────

    /// Rebuild the catalog from every `ready` connection and swap it in.
    pub fn rebuild(&self) -> Arc<Catalog> {
        let _guard = self.rebuild_lock.lock();

        let ready: Vec<(&str, Arc<Vec<_>>)> = self
            .connections
            .values()
            .filter(|conn| conn.state() == ConnectionState::Ready)
            .map(|conn| (conn.name(), conn.tools()))
            .collect();

        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let catalog = Arc::new(Catalog::from_providers(
            revision,
            ready.iter().map(|(name, tools)| (*name, tools.as_slice())),
        ));

        self.snapshot.send_replace(Arc::clone(&catalog));
        tracing::debug!(revision, capabilities = catalog.len(), "catalog rebuilt");
        catalog
    }

    /// The current snapshot.
    pub fn get(&self) -> Arc<Catalog> {
        Arc::clone(&self.snapshot.borrow())
    }

    /// Receive every future snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Catalog>> {
        self.snapshot.subscribe()
    }

    // ─── Connections ─────────────────────────────────────────────────────

    /// The connection serving `provider`, if configured.
    pub fn backend(&self, provider: &str) -> Option<Arc<BackendConnection>> {
        self.connections.get(provider).cloned()
    }

    /// `(provider, state)` for every configured provider, sorted by name.
    pub fn connection_states(&self) -> Vec<(String, ConnectionState)> {
        self.connections
            .iter()
            .map(|(name, conn)| (name.clone(), conn.state()))
            .collect()
    }

    /// Number of connections currently `ready`.
    pub fn ready_count(&self) -> usize {
        self.connections
            .values()
            .filter(|conn| conn.state() == ConnectionState::Ready)
            .count()
    }

    fn spawn_event_loop(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let rx = self.events_rx.lock().take()?;
        Some(tokio::spawn(run_events(Arc::downgrade(self), rx)))
    }
}

/// Rebuild on every connection event, coalescing bursts.
async fn run_events(aggregator: Weak<CatalogAggregator>, mut rx: mpsc::UnboundedReceiver<BackendEvent>) {
    while let Some(event) = rx.recv().await {
        let mut coalesced = 0usize;
        while rx.try_recv().is_ok() {
            coalesced += 1;
        }

        let Some(aggregator) = aggregator.upgrade() else {
            break;
        };
        tracing::debug!(
            provider = %event.provider,
            state = %event.state,
            coalesced,
            "connection event, rebuilding catalog"
        );
        let catalog = aggregator.rebuild();
        tracing::info!(
            revision = catalog.revision(),
            summary = %catalog.summary(),
            "catalog updated"
        );
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
