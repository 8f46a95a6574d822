//! Tool proxy — supervises stdio tool providers and serves one unified
//! capability catalog to front-end clients.

pub mod backend;
pub mod catalog;
pub mod config;
pub mod frontend;
pub mod logging;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use catalog::CatalogAggregator;
use config::ProxyConfig;
use frontend::FrontendServer;

/// A running proxy: providers started, listener accepting.
pub struct Proxy {
    aggregator: Arc<CatalogAggregator>,
    local_addr: SocketAddr,
    server: JoinHandle<()>,
}

impl Proxy {
    /// Bind the listener, start every provider, then begin accepting.
    ///
    /// Provider failures are logged and leave the rest running. Only a bind
    /// failure is returned.
    pub async fn start(config: &ProxyConfig) -> std::io::Result<Self> {
        let aggregator =
            CatalogAggregator::new(config.provider_specs(), config.connection_settings());
        let server = FrontendServer::bind(
            &config.listen,
            Arc::clone(&aggregator),
            config.session_queue_capacity,
        )
        .await?;
        let local_addr = server.local_addr()?;

        let failed = aggregator.start_all().await;
        tracing::info!(
            providers = config.providers.len(),
            ready = aggregator.ready_count(),
            failed = failed.len(),
            "providers started"
        );
        for (provider, error) in &failed {
            tracing::warn!(provider = %provider, kind = error.kind(), error = %error, "provider unavailable");
        }

        Ok(Self {
            aggregator,
            local_addr,
            server: server.spawn(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn aggregator(&self) -> &Arc<CatalogAggregator> {
        &self.aggregator
    }

    /// Stop accepting and shut down every provider.
    pub async fn shutdown(self) {
        self.server.abort();
        self.aggregator.shutdown_all().await;
        tracing::info!("proxy stopped");
    }
}

/// Run the proxy until `shutdown` resolves.
pub async fn run<F>(config: ProxyConfig, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()>,
{
    let proxy = Proxy::start(&config).await?;
    tracing::info!(addr = %proxy.local_addr(), "proxy ready");

    shutdown.await;
    tracing::warn!("shutdown requested, stopping providers");
    proxy.shutdown().await;
    Ok(())
}
