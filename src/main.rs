use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roombook::auth::ApiAuth;
use roombook::catalog::{OpenCatalog, ResourceCatalog, StaticCatalog};
use roombook::config::Config;
use roombook::engine::store::ReservationStore;
use roombook::engine::Engine;
use roombook::http::{self, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    roombook::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(ReservationStore::open(&config.wal_path())?);
    let catalog: Arc<dyn ResourceCatalog> = match &config.resources {
        Some(ids) => Arc::new(StaticCatalog::new(ids.iter().cloned())),
        None => Arc::new(OpenCatalog),
    };
    let engine = Arc::new(Engine::new(store.clone(), catalog, config.lock_timeout));

    let compactor_store = store.clone();
    let threshold = config.compact_threshold;
    tokio::spawn(async move {
        roombook::compactor::run_compactor(compactor_store, threshold).await;
    });

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("roombook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  lock_timeout: {:?}", config.lock_timeout);
    info!("  auth: {}", if config.api_token.is_some() { "bearer token" } else { "principal header only" });
    info!("  catalog: {}", config.resources.as_ref().map_or("open".to_string(), |r| format!("{} resources", r.len())));
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    let state = AppState {
        engine,
        auth: ApiAuth::new(config.api_token.clone()),
    };
    http::serve(listener, state, shutdown_signal()).await?;

    // Compact on the way out so the next start replays a short log.
    if let Err(e) = store.compact().await {
        tracing::warn!("final compaction failed: {e}");
    }
    info!("roombook stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received, draining requests");
}
