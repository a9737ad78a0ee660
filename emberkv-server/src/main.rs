//! emberkv server: HTTP front end for the master storage engine

mod api;
mod cluster;

use cluster::{HttpCoordinator, HttpReplicator, HttpSessionManager};
use emberkv_core::coordinator::{CoordinatorClient, NullCoordinator};
use emberkv_core::log::{NullReplicator, SegmentReplicator};
use emberkv_core::{MasterConfig, MasterEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Locator other servers use to reach this master
    pub locator: String,
    /// Coordinator base URL, if any
    pub coordinator: Option<String>,
    /// Backup base URLs receiving segment replicas
    pub backups: Vec<String>,
    /// Pause between cleaner passes
    pub cleaner_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8070".parse().unwrap(),
            locator: "http://127.0.0.1:8070".to_string(),
            coordinator: None,
            backups: Vec::new(),
            cleaner_interval: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Apply `EMBERKV_*` environment overrides to the defaults.
    fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("EMBERKV_ADDR") {
            config.http_addr = addr.parse()?;
        }
        if let Ok(locator) = std::env::var("EMBERKV_LOCATOR") {
            config.locator = locator;
        }
        if let Ok(coordinator) = std::env::var("EMBERKV_COORDINATOR") {
            config.coordinator = Some(coordinator);
        }
        if let Ok(backups) = std::env::var("EMBERKV_BACKUPS") {
            config.backups = backups
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let config = ServerConfig::from_env()?;

    info!("Starting emberkv server...");
    info!("HTTP server: http://{}", config.http_addr);
    info!("Locator: {}", config.locator);

    let coordinator: Arc<dyn CoordinatorClient> = match &config.coordinator {
        Some(base) => {
            info!("Coordinator: {}", base);
            Arc::new(HttpCoordinator::new(base))
        }
        None => Arc::new(NullCoordinator),
    };
    let replicator: Arc<dyn SegmentReplicator> = if config.backups.is_empty() {
        Arc::new(NullReplicator)
    } else {
        info!("Replicating segments to {} backups", config.backups.len());
        Arc::new(HttpReplicator::new(config.backups.clone()))
    };

    // Enlistment talks to the coordinator, so build the engine off the
    // async runtime.
    let master_config = MasterConfig {
        locator: config.locator.clone(),
        ..Default::default()
    };
    let engine = tokio::task::spawn_blocking(move || {
        MasterEngine::new(
            master_config,
            coordinator,
            Arc::new(HttpSessionManager),
            replicator,
        )
    })
    .await??;
    let engine = Arc::new(engine);

    // Cleaner runs on its own thread, off the serving path.
    let cleaner = engine.clone();
    let interval = config.cleaner_interval;
    std::thread::spawn(move || loop {
        std::thread::sleep(interval);
        let reclaimed = cleaner.clean_log();
        if reclaimed > 0 {
            info!("cleaner reclaimed {} segments", reclaimed);
        }
    });

    // Create router
    let app = api::create_router(engine);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("emberkv server listening on {}", config.http_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
