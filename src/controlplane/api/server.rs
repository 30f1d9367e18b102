//! API Server
//!
//! Runs the REST server for the control plane API.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::rest::RestRouter;
use crate::controlplane::discovery::DiscoveryOrchestrator;
use crate::controlplane::sync::SyncOrchestrator;
use crate::domain::ports::DatabaseRef;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
    /// Metrics and health probe bind address
    pub metrics_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// REST API server
pub struct ApiServer {
    config: ApiServerConfig,
    discovery: Arc<DiscoveryOrchestrator>,
    sync: Arc<SyncOrchestrator>,
    db: DatabaseRef,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(
        config: ApiServerConfig,
        discovery: Arc<DiscoveryOrchestrator>,
        sync: Arc<SyncOrchestrator>,
        db: DatabaseRef,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            discovery,
            sync,
            db,
            shutdown_tx,
        }
    }

    /// Run the API server until shutdown
    pub async fn run(&self) -> Result<()> {
        info!("Starting API server");
        info!("  REST API: {}", self.config.rest_addr);

        let rest_handle = self.spawn_rest_server();

        match rest_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("REST server error: {}", e);
                return Err(e);
            }
            Err(e) => {
                error!("REST server task failed: {:?}", e);
                return Err(Error::Internal(format!("REST server task failed: {}", e)));
            }
        }

        Ok(())
    }

    /// Spawn the REST server
    fn spawn_rest_server(&self) -> tokio::task::JoinHandle<Result<()>> {
        let addr = self.config.rest_addr;
        let router = RestRouter::new(self.discovery.clone(), self.sync.clone(), self.db.clone());
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move { run_rest_server(addr, router, shutdown_rx).await })
    }

    /// Handle that triggers graceful shutdown
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Run the REST API server
async fn run_rest_server(
    addr: SocketAddr,
    router: RestRouter,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let app = router.build().layer(TraceLayer::new_for_http());

    info!("REST API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("REST server shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

    Ok(())
}
