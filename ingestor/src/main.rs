mod hub;
mod rest;

use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use alcowatch_ingestor::{
    db, metrics, mqtt::MqttConnector, registry::ConnectionRegistry, Broadcaster, CleanupScheduler,
    Config, ConnectionManager, LivenessMonitor, Repository, StatusTracker, SystemClock,
    TelemetryBatcher,
};

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting alcowatch ingestor");
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.database_display());

    if let Err(e) = run(config).await {
        error!("Ingestor failed: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    // Initialize metrics
    metrics::init_metrics()?;

    let pool = db::make_pool(&config.database_url).await?;
    let repo: Arc<dyn Repository> = Arc::new(db::PgRepository::new(pool));
    let clock = Arc::new(SystemClock);

    let batcher = Arc::new(TelemetryBatcher::new(repo.clone(), config.batcher));
    batcher.start();

    let hub = hub::Hub::new(config.broadcast_capacity);
    let tracker = Arc::new(StatusTracker::new(repo.clone(), Broadcaster::new(), clock.clone()));
    let manager = Arc::new(ConnectionManager::new(
        repo.clone(),
        Arc::new(MqttConnector::new()),
        Arc::new(ConnectionRegistry::new()),
        batcher.clone(),
        tracker.clone(),
        config.connection,
    ));
    manager.set_broadcast_sink(hub.sink());

    let scheduler = Arc::new(CleanupScheduler::new(repo.clone(), clock, config.cleanup));

    // Everything that can fail runs before any broker connection opens.
    let startup = async {
        let devices = repo.get_devices().await?;
        scheduler.start().await?;
        let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
        anyhow::Ok((devices, listener))
    };
    let (devices, listener) = match startup.await {
        Ok(ready) => ready,
        Err(e) => {
            scheduler.stop().await;
            manager.disconnect().await;
            return Err(e);
        }
    };
    info!("HTTP server listening on {}", config.http_addr);

    manager.initialize(devices).await;

    let liveness = Arc::new(LivenessMonitor::new(repo.clone(), tracker, config.liveness));
    liveness.start();

    let app = rest::create_router(rest::AppState {
        manager: manager.clone(),
        scheduler: scheduler.clone(),
        hub,
    });

    let (stop_http, http_stopped) = tokio::sync::oneshot::channel::<()>();
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = http_stopped.await;
            })
            .await
    });

    let server_running = tokio::select! {
        result = &mut server_handle => {
            error!("HTTP server terminated: {:?}", result);
            false
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            true
        }
    };

    info!("Shutting down");
    if server_running {
        let _ = stop_http.send(());
        if let Err(e) = server_handle.await {
            error!("HTTP server task failed: {}", e);
        }
    }

    liveness.stop().await;
    scheduler.stop().await;

    let persisted = manager.disconnect().await;
    info!("Shutdown complete, {} buffered readings persisted", persisted);
    Ok(())
}
