use mcc_proxy::{
    cache_connector::InMemoryCacheStore,
    config::Config,
    db_connector::InMemoryDatabase,
    logging::LoggerManager,
    predictor::build_predictor,
    proxy::MccProxy,
    server::ApiServer,
    shutdown::ShutdownCoordinator,
    task_queue::spawn_worker,
    Result,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    let hostname = gethostname::gethostname().to_string_lossy().to_string();
    let logger_manager = LoggerManager::from_config(&config.logging, hostname.clone());
    logger_manager.initialize()?;

    info!(
        "Starting MCC proxy {} on {}",
        env!("BUILD_VERSION"),
        hostname
    );
    info!("Build timestamp: {}", env!("BUILD_TIMESTAMP"));
    info!(
        "API server: {}:{}",
        config.server.bind_address, config.server.port
    );
    info!(
        "Cache: size={} bytes, table={}, tracker={:?}, policy={:?}",
        config.cache.cache_size,
        config.cache.table,
        config.cache.access_tracker.kind(),
        config.version_selection_policy
    );
    warn!(
        "Using in-memory collaborators in place of database {} (user {}) and cache store {}:{}",
        config.database.url,
        config.database.user,
        config.cache_store.host,
        config.cache_store.port
    );
    if config.cache.verify_monotonic_reads {
        info!("Monotonic read verification enabled");
    }

    let predictor = build_predictor(&config.predictor)?;
    let proxy = MccProxy::new(
        &config.cache,
        config.version_selection_policy,
        Arc::new(InMemoryDatabase::new()),
        Arc::new(InMemoryCacheStore::new()),
        predictor,
    );
    proxy.start().await?;
    let (handle, worker) = spawn_worker(proxy);

    let mut shutdown_coordinator = ShutdownCoordinator::new(config.shutdown_timeout);
    shutdown_coordinator.set_proxy_handle(handle.clone());

    let api_server = ApiServer::new(&config.server, handle, hostname);
    let listener = api_server.bind().await?;
    let server_shutdown = shutdown_coordinator.subscribe();
    let server_task = tokio::spawn(async move {
        if let Err(e) = api_server.serve(listener, server_shutdown).await {
            error!("API server failed: {}", e);
        }
    });

    if let Err(e) = shutdown_coordinator.listen_for_shutdown().await {
        error!("Shutdown coordinator failed: {}", e);
    }

    if tokio::time::timeout(Duration::from_secs(10), server_task)
        .await
        .is_err()
    {
        warn!("API server did not stop in time");
    }
    if !shutdown_coordinator.join_worker(worker).await {
        error!("Proxy worker aborted during shutdown");
    }

    info!("MCC proxy shutdown complete");
    Ok(())
}
