//! API Server
//!
//! Serves the REST router until shutdown is requested.

use crate::context::RelayContext;
use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use super::rest::RestRouter;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// HTTP server for the subscription API
pub struct ApiServer {
    config: ApiServerConfig,
    context: Arc<RelayContext>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(config: ApiServerConfig, context: Arc<RelayContext>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            context,
            shutdown_tx,
        }
    }

    /// Run until [`shutdown`](Self::shutdown) is called
    pub async fn run(&self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.config.rest_addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let app = RestRouter::new(self.context.clone()).build();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let addr = listener.local_addr()?;
        info!(addr = %addr, "REST API listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Sender half of the shutdown signal, for use from another task
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::RelayMetrics;
    use crate::notify::{DispatcherConfig, ExpoConfig, ExpoPushProvider, NotificationDispatcher};
    use crate::persistence::MemorySnapshotStore;
    use crate::registry::{RegistryConfig, SubscriptionRegistry};
    use crate::stream::{EventStreamClient, StreamClientConfig, WebSocketSource};
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.rest_addr.port(), 3000);
    }

    #[tokio::test]
    async fn test_graceful_shutdown() {
        let registry = SubscriptionRegistry::new(
            Arc::new(MemorySnapshotStore::new()),
            RegistryConfig::default(),
        );
        let metrics = Arc::new(RelayMetrics::new().unwrap());
        let dispatcher = NotificationDispatcher::new(
            DispatcherConfig::default(),
            registry.clone(),
            Arc::new(ExpoPushProvider::new(ExpoConfig::default()).unwrap()),
            metrics.clone(),
        );
        let stream = EventStreamClient::new(
            StreamClientConfig::default(),
            Arc::new(WebSocketSource::new()),
        );
        let context = RelayContext::new(registry, dispatcher, stream, metrics);

        let server = Arc::new(ApiServer::new(ApiServerConfig::default(), context));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        server.shutdown();
        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
