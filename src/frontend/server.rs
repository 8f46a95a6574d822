//! TCP listener — one session per accepted connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use super::router::Router;
use super::session::run_session;
use crate::catalog::CatalogAggregator;

/// Accepts front-end connections and serves each on its own task.
pub struct FrontendServer {
    listener: TcpListener,
    aggregator: Arc<CatalogAggregator>,
    router: Router,
    queue_capacity: usize,
}

impl FrontendServer {
    /// Bind the listener. Binding is the only step that can fail.
    pub async fn bind(
        addr: &str,
        aggregator: Arc<CatalogAggregator>,
        queue_capacity: usize,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let router = Router::new(Arc::clone(&aggregator));
        Ok(Self {
            listener,
            aggregator,
            router,
            queue_capacity,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever. Accept errors are logged and skipped.
    pub async fn serve(self) {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(addr = %addr, "front-end listener ready");
        }

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept connection");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(peer = %peer, error = %e, "could not set TCP_NODELAY");
            }

            let (reader, writer) = stream.into_split();
            tokio::spawn(run_session(
                reader,
                writer,
                peer.to_string(),
                Arc::clone(&self.aggregator),
                self.router.clone(),
                self.queue_capacity,
            ));
        }
    }

    /// Run `serve` on a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.serve())
    }
}
