use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::alerts::evaluate_alerts;
use super::probe::{HealthProbe, HttpProbe, build_client, check_endpoint};
use super::system::HostSampler;
use super::types::{
    DependencyHealth, DependencyStatus, HealthCheckResult, HostMetrics, ServiceCounts,
    SystemHealthMetrics,
};
use crate::config::HealthConfig;
use crate::services::cache::CacheStore;
use crate::services::event::{EventBus, EventType, HealthChangedPayload, PublishEvent};
use crate::services::registry::{
    RegistryHealthSummary, ServiceInstance, ServiceRegistry, ServiceStatus,
};

pub const SYSTEM_METRICS_KEY: &str = "health:system_metrics";
const EVENT_SOURCE: &str = "health-check-service";

/// 健康检查引擎
#[derive(Clone)]
pub struct HealthChecker {
    registry: ServiceRegistry,
    events: EventBus,
    cache: CacheStore,
    probe: Arc<dyn HealthProbe>,
    http: reqwest::Client,
    sampler: HostSampler,
    config: HealthConfig,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl HealthChecker {
    pub fn new(
        registry: ServiceRegistry,
        events: EventBus,
        cache: CacheStore,
        config: HealthConfig,
    ) -> Result<Self, reqwest::Error> {
        let probe = Arc::new(HttpProbe::new(config.probe_timeout())?);
        Self::with_probe(registry, events, cache, config, probe)
    }

    pub fn with_probe(
        registry: ServiceRegistry,
        events: EventBus,
        cache: CacheStore,
        config: HealthConfig,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            registry,
            events,
            cache,
            probe,
            http: build_client(config.external_timeout())?,
            sampler: HostSampler::new(),
            config,
        })
    }

    /// 探测单个实例并写回注册表，状态变化时发布 SERVICE_HEALTH_CHANGED
    ///
    /// 实例在探测期间被删除时返回 `None`。
    pub async fn check_service(&self, instance: &ServiceInstance) -> Option<HealthCheckResult> {
        let health = self.probe.probe(instance).await;

        let (updated, previous_status) = match self.registry.update_service_health(health.clone()) {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                tracing::debug!(service_id = %instance.id, "Service removed during health check");
                return None;
            }
            Err(e) => {
                tracing::error!(service_id = %instance.id, error = %e, "Failed to record health check");
                return None;
            }
        };

        let status_changed = previous_status != updated.status;
        if status_changed {
            tracing::info!(
                service_id = %updated.id,
                service_name = %updated.name,
                old_status = %previous_status,
                new_status = %updated.status,
                response_time_ms = health.response_time,
                "Service health changed"
            );
            let payload = HealthChangedPayload {
                service_id: updated.id.clone(),
                service_name: updated.name.clone(),
                old_status: previous_status,
                new_status: updated.status,
                response_time: health.response_time,
                error: health.error.clone(),
            };
            if let Err(e) = self.events.publish(payload.into_event(EVENT_SOURCE)) {
                tracing::error!(service_id = %updated.id, error = %e, "Failed to publish health change");
            }
        }

        Some(HealthCheckResult {
            service_id: updated.id,
            health,
            previous_status,
            status_changed,
        })
    }

    /// 并发探测所有未注销的实例，并发数受 `max_concurrent_probes` 限制
    pub async fn check_all_services(&self) -> Vec<HealthCheckResult> {
        let targets: Vec<ServiceInstance> = self
            .registry
            .list_services()
            .into_iter()
            .filter(|instance| instance.status != ServiceStatus::Shutdown)
            .collect();

        tracing::debug!(services = targets.len(), "Performing health checks");

        let results: Vec<HealthCheckResult> = stream::iter(targets)
            .map(|instance| async move { self.check_service(&instance).await })
            .buffer_unordered(self.config.max_concurrent_probes.max(1))
            .filter_map(|result| async move { result })
            .collect()
            .await;
        results
    }

    pub async fn check_service_by_id(&self, service_id: &str) -> Option<HealthCheckResult> {
        let instance = self.registry.get_service(service_id)?;
        if instance.status == ServiceStatus::Shutdown {
            return None;
        }
        self.check_service(&instance).await
    }

    /// 缓存连通性与外部端点
    pub async fn check_dependencies(
        &self,
    ) -> (BTreeMap<String, DependencyHealth>, BTreeMap<String, DependencyHealth>) {
        let started = std::time::Instant::now();
        let cache_health = match self.cache.ping() {
            Ok(()) => DependencyHealth {
                status: DependencyStatus::Healthy,
                response_time: started.elapsed().as_millis() as u64,
                error: None,
                details: Some(serde_json::json!({ "entries": self.cache.len() })),
            },
            Err(e) => DependencyHealth {
                status: DependencyStatus::Unhealthy,
                response_time: started.elapsed().as_millis() as u64,
                error: Some(e.to_string()),
                details: None,
            },
        };
        let database = BTreeMap::from([("cache".to_string(), cache_health)]);

        let checks = self.config.external_endpoints.iter().map(|(name, url)| {
            let client = self.http.clone();
            async move { (name.clone(), check_endpoint(&client, url).await) }
        });
        let external = futures::future::join_all(checks).await.into_iter().collect();

        (database, external)
    }

    /// 采集系统指标、写入缓存并按阈值发布告警
    pub async fn collect_system_metrics(&self) -> SystemHealthMetrics {
        let sampler = self.sampler.clone();
        let host = tokio::task::spawn_blocking(move || sampler.sample())
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "Host metrics sampling failed");
                HostMetrics::default()
            });

        self.build_snapshot(host).await
    }

    // 汇总主机指标、服务计数与依赖状态
    async fn build_snapshot(&self, host: HostMetrics) -> SystemHealthMetrics {
        let summary: RegistryHealthSummary = self.registry.summary();
        let (database, external) = self.check_dependencies().await;

        let metrics = SystemHealthMetrics {
            timestamp: Utc::now(),
            cpu: host.cpu,
            memory: host.memory,
            disk: host.disk,
            network: host.network,
            services: ServiceCounts {
                total: summary.total,
                healthy: summary.healthy,
                unhealthy: summary.unhealthy,
                critical: summary.critical,
            },
            database,
            external,
        };

        self.cache.set(
            SYSTEM_METRICS_KEY,
            metrics.clone(),
            Some(self.config.metrics_ttl()),
        );
        self.publish_alerts(&metrics);
        metrics
    }

    fn publish_alerts(&self, metrics: &SystemHealthMetrics) {
        for alert in evaluate_alerts(metrics) {
            tracing::warn!(severity = ?alert.severity, message = %alert.message, "System alert raised");
            let draft = PublishEvent::new(
                EventType::SystemAlert,
                EVENT_SOURCE,
                serde_json::to_value(&alert).unwrap_or_default(),
            )
            .with_priority(alert.severity.priority())
            .with_tags(["system-alert", "health-check"]);
            if let Err(e) = self.events.publish(draft) {
                tracing::error!(error = %e, "Failed to publish system alert");
            }
        }
    }

    pub fn get_system_metrics(&self) -> Option<SystemHealthMetrics> {
        self.cache.get(SYSTEM_METRICS_KEY).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to read system metrics");
            None
        })
    }

    /// 周期性探测所有实例
    pub fn start_probe_task(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let checker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(checker.config.check_interval());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if checker.config.jitter_ms > 0 {
                    let jitter = rand::rng().random_range(0..=checker.config.jitter_ms);
                    tokio::time::sleep(Duration::from_millis(jitter)).await;
                }
                let results = checker.check_all_services().await;
                let changed = results.iter().filter(|r| r.status_changed).count();
                tracing::debug!(checked = results.len(), changed = changed, "Health sweep completed");
            }
            tracing::debug!("Health probe task stopped");
        })
    }

    /// 周期性采集系统指标
    pub fn start_metrics_task(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let checker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(checker.config.metrics_interval());
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let started = std::time::Instant::now();
                checker.collect_system_metrics().await;
                tracing::debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "System metrics collected"
                );
            }
            tracing::debug!("System metrics task stopped");
        })
    }

    /// 处理注册时提交的首次探测请求
    pub fn start_probe_worker(
        &self,
        mut requests: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let checker = self.clone();
        tokio::spawn(async move {
            loop {
                let service_id = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = requests.recv() => match received {
                        Some(id) => id,
                        None => break,
                    },
                };
                let checker = checker.clone();
                tokio::spawn(async move {
                    if checker.check_service_by_id(&service_id).await.is_none() {
                        tracing::debug!(service_id = %service_id, "Initial health check skipped");
                    }
                });
            }
            tracing::debug!("Initial probe worker stopped");
        })
    }
}
