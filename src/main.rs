//! Storage Array Manager
//!
//! Service entry point: loads configuration, wires the driver cache, the
//! orchestrators and the task executor together and serves the REST API
//! until interrupted.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_array_manager::controlplane::api::{run_probe_server, ProbeState};
use storage_array_manager::domain::ports::{
    CredentialCipherRef, DatabaseRef, TaskDispatcherRef,
};
use storage_array_manager::{
    build_lock_manager, ApiServer, Base64Cipher, ChannelDispatcher, DiscoveryOrchestrator,
    DriverManager, DriverRegistry, KindCatalogue, LockBackend, MemoryDatabase, Metrics,
    ServiceConfig, SyncOrchestrator, TaskExecutor,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Array Manager - registration and inventory sync for storage arrays
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// REST API bind address
    #[arg(long, env = "API_ADDR")]
    api_addr: Option<SocketAddr>,

    /// Metrics and health probe bind address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// CA bundle file or directory used to verify array certificates
    #[arg(long, env = "STORAGE_CA_PATH")]
    ca_path: Option<PathBuf>,

    /// Lock backend (local, kubernetes)
    #[arg(long, env = "LOCK_BACKEND")]
    lock_backend: Option<LockBackend>,

    /// Namespace holding Lease objects
    #[arg(long, env = "LOCK_NAMESPACE")]
    lock_namespace: Option<String>,

    /// Periodic sync interval in seconds
    #[arg(long, env = "SYNC_INTERVAL")]
    sync_interval_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Load the configuration file, then apply command line overrides
    fn service_config(&self) -> anyhow::Result<ServiceConfig> {
        let mut config = match &self.config {
            Some(path) => ServiceConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => ServiceConfig::default(),
        };

        if let Some(addr) = self.api_addr {
            config.api.rest_addr = addr;
        }
        if let Some(addr) = self.metrics_addr {
            config.api.metrics_addr = addr;
        }
        if let Some(path) = &self.ca_path {
            config.drivers.ca_path = Some(path.clone());
        }
        if let Some(backend) = self.lock_backend {
            config.coordination.backend = backend;
        }
        if let Some(namespace) = &self.lock_namespace {
            config.coordination.namespace = namespace.clone();
        }
        if let Some(secs) = self.sync_interval_secs {
            config.sync.periodic_interval_secs = secs;
        }

        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = args.service_config()?;

    info!("Starting Storage Array Manager");
    info!("  Version: {}", storage_array_manager::VERSION);
    info!("  REST API: {}", config.api.rest_addr);
    info!("  Metrics: {}", config.api.metrics_addr);
    info!("  Lock backend: {:?}", config.coordination.backend);

    let registry = prometheus::Registry::new();
    let metrics = Arc::new(Metrics::new(&registry).context("failed to register metrics")?);

    let db: DatabaseRef = Arc::new(MemoryDatabase::new());
    let cipher: CredentialCipherRef = Arc::new(Base64Cipher);

    let plugins = Arc::new(DriverRegistry::with_builtin()?);
    info!("Driver plugins: {}", plugins.names().join(", "));
    let drivers = DriverManager::new(
        config.drivers.clone(),
        plugins,
        db.clone(),
        cipher.clone(),
        metrics.clone(),
    );

    let locks = build_lock_manager(&config.coordination)
        .await
        .context("failed to initialize lock backend")?;

    let catalogue = Arc::new(KindCatalogue::with_defaults());
    let (dispatcher, task_rx) = ChannelDispatcher::new(config.tasks.queue_capacity, metrics.clone());
    let dispatcher: TaskDispatcherRef = Arc::new(dispatcher);

    let sync = SyncOrchestrator::new(
        config.sync.clone(),
        db.clone(),
        catalogue.clone(),
        dispatcher.clone(),
        metrics.clone(),
    );

    let shutdown = CancellationToken::new();

    let executor = TaskExecutor::new(drivers.clone(), db.clone(), catalogue, sync.clone());
    tokio::spawn(executor.run(task_rx, shutdown.clone()));
    tokio::spawn(sync.clone().run_periodic(shutdown.clone()));

    let discovery = DiscoveryOrchestrator::new(
        config.discovery.clone(),
        drivers,
        db.clone(),
        locks,
        cipher,
        sync.clone(),
        dispatcher,
        metrics,
    );

    // Metrics and probes
    let probes = ProbeState::new(registry);
    {
        let probes = probes.clone();
        let addr = config.api.metrics_addr;
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_probe_server(addr, probes, shutdown).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let api_server = ApiServer::new(config.api.clone(), discovery, sync, db);

    let api_shutdown = api_server.shutdown_handle();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_shutdown.cancel();
        let _ = api_shutdown.send(());
    });

    probes.set_ready(true);
    info!("Starting REST API server");
    let result = api_server.run().await;

    probes.set_ready(false);
    shutdown.cancel();
    result.context("REST API server failed")?;

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "axum=info", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
