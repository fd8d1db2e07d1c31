use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::api::{self, AppState};
use crate::config::Config;
use crate::services::{
    CacheStore, EventBus, EventProcessor, HealthChecker, RealtimeHub, ServiceDiscovery,
    ServiceRegistry,
};

/// 组装各组件、启动后台任务并对外提供 HTTP / WebSocket 服务
pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let cache = CacheStore::new();
    let events = EventBus::new(cache.clone(), config.events.clone());

    // 注册成功后立即探测一次
    let (probe_tx, probe_rx) = mpsc::unbounded_channel();
    let registry = ServiceRegistry::new(cache.clone(), events.clone(), config.registry.clone())
        .with_probe_requests(probe_tx);
    let discovery = ServiceDiscovery::new(registry.clone(), cache.clone(), config.discovery.clone());
    let health = HealthChecker::new(
        registry.clone(),
        events.clone(),
        cache.clone(),
        config.health.clone(),
    )?;

    let processor = EventProcessor::new();
    processor.register_builtin_handlers();
    processor.attach(&events);

    let hub = RealtimeHub::new(registry.clone());

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    tracker.spawn(purge_loop(
        cache.clone(),
        config.cache.purge_interval_secs,
        cancel.clone(),
    ));
    tracker.spawn(events.start_dispatcher(cancel.clone()));
    tracker.spawn(hub.start_relay(events.receiver(), cancel.clone()));
    tracker.spawn(registry.start_cleanup_task(cancel.clone()));
    tracker.spawn(health.start_probe_worker(probe_rx, cancel.clone()));
    tracker.spawn(health.start_probe_task(cancel.clone()));
    tracker.spawn(health.start_metrics_task(cancel.clone()));
    tracker.close();

    let addr = config.listen_addr();
    let state = AppState {
        config: Arc::new(config),
        registry: registry.clone(),
        discovery,
        events,
        processor,
        health,
        hub,
    };
    let app = api::router(state);

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Service registry listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal(cancel.clone()));
    if let Err(e) = server.await {
        tracing::error!(error = %e, "HTTP server error");
    }

    tracing::info!("Shutting down background tasks...");
    cancel.cancel();
    tracker.wait().await;
    registry.shutdown().await;
    tracing::info!("Service registry stopped");

    Ok(())
}

async fn purge_loop(cache: CacheStore, interval_secs: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let purged = cache.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged = purged, "Purged expired cache entries");
                }
            }
        }
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Received Ctrl-C, shutting down");
        }
        _ = cancel.cancelled() => {}
    }
}
