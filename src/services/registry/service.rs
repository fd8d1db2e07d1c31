use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::types::{
    DEFAULT_HEALTH_ENDPOINT, DEFAULT_WEIGHT, RegisterServiceDescriptor, RegistryError,
    RegistryHealthSummary, ServiceHealth, ServiceInstance, ServiceMetrics, ServiceStatus,
    ServiceType, StaleSweepReport,
};
use crate::config::RegistryConfig;
use crate::services::cache::CacheStore;
use crate::services::event::{
    EventBus, EventPriority, EventType, HealthChangedPayload, MetricsUpdatedPayload, PublishEvent,
};

pub const REGISTRY_KEY: &str = "services:registry";
const EVENT_SOURCE: &str = "service-registry";

type Registry = HashMap<String, ServiceInstance>;

pub fn service_key(service_id: &str) -> String {
    format!("service:{service_id}")
}

pub fn health_key(service_id: &str) -> String {
    format!("health:{service_id}")
}

pub fn metrics_key(service_id: &str) -> String {
    format!("metrics:{service_id}")
}

/// 服务注册表
///
/// 整张注册表作为一个值存放在 `services:registry` 下，所有变更都经过
/// `CacheStore::update`，同一时刻只有一个写者。`service:<id>` 是单个实例的副本，
/// 供共享存储的其他读者使用，本进程只读总表。
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    cache: CacheStore,
    events: EventBus,
    /// 注册后立即探测的请求队列，由健康检查引擎消费
    probe_requests: Option<mpsc::UnboundedSender<String>>,
    /// 注销宽限期内等待删除的实例
    pending_removals: Arc<DashMap<String, CancellationToken>>,
    task_tracker: TaskTracker,
    config: RegistryConfig,
}

impl ServiceRegistry {
    pub fn new(cache: CacheStore, events: EventBus, config: RegistryConfig) -> Self {
        Self {
            cache,
            events,
            probe_requests: None,
            pending_removals: Arc::new(DashMap::new()),
            task_tracker: TaskTracker::new(),
            config,
        }
    }

    pub fn with_probe_requests(mut self, sender: mpsc::UnboundedSender<String>) -> Self {
        self.probe_requests = Some(sender);
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// 注册服务实例，返回带新 ID 的实例
    pub fn register(
        &self,
        descriptor: RegisterServiceDescriptor,
    ) -> Result<ServiceInstance, RegistryError> {
        descriptor.validate()?;
        let now = Utc::now();

        let instance = self.cache.update(
            REGISTRY_KEY,
            Some(self.config.service_ttl()),
            |registry: &mut Registry| {
                let id = generate_service_id(&descriptor, registry);
                let instance = ServiceInstance {
                    id: id.clone(),
                    name: descriptor.name,
                    version: descriptor.version,
                    host: descriptor.host,
                    port: descriptor.port,
                    service_type: descriptor.service_type,
                    status: ServiceStatus::Starting,
                    health_endpoint: descriptor
                        .health_endpoint
                        .unwrap_or_else(|| DEFAULT_HEALTH_ENDPOINT.to_string()),
                    tags: descriptor.tags.into_iter().collect(),
                    metadata: descriptor.metadata,
                    dependencies: descriptor.dependencies.into_iter().collect(),
                    weight: descriptor.weight.unwrap_or(DEFAULT_WEIGHT),
                    environment: descriptor
                        .environment
                        .unwrap_or_else(|| "production".to_string()),
                    registered_at: now,
                    last_heartbeat: now,
                    health_check_count: 0,
                    consecutive_failures: 0,
                };
                registry.insert(id, instance.clone());
                instance
            },
        )?;

        self.mirror(&instance);
        tracing::info!(
            service_id = %instance.id,
            service_name = %instance.name,
            address = %instance.address(),
            "Registered service"
        );

        self.emit(
            PublishEvent::new(
                EventType::ServiceRegistered,
                EVENT_SOURCE,
                serde_json::json!({ "serviceId": instance.id, "service": instance }),
            )
            .with_tags(["service", "registry"]),
        );
        self.request_probe(&instance.id);

        Ok(instance)
    }

    /// 注销: 立即置为 shutdown，宽限期后删除
    ///
    /// 未知 ID 或已注销的实例返回 `false`。
    pub fn deregister(&self, service_id: &str) -> Result<bool, RegistryError> {
        let instance = self.cache.update(
            REGISTRY_KEY,
            Some(self.config.service_ttl()),
            |registry: &mut Registry| match registry.get_mut(service_id) {
                Some(instance) if instance.status != ServiceStatus::Shutdown => {
                    instance.status = ServiceStatus::Shutdown;
                    Some(instance.clone())
                }
                _ => None,
            },
        )?;

        let Some(instance) = instance else {
            return Ok(false);
        };

        self.mirror(&instance);
        self.schedule_removal(service_id);

        tracing::info!(
            service_id = %service_id,
            service_name = %instance.name,
            grace_secs = self.config.deregister_grace_secs,
            "Deregistered service"
        );

        self.emit(
            PublishEvent::new(
                EventType::ServiceDeregistered,
                EVENT_SOURCE,
                serde_json::json!({ "serviceId": instance.id, "service": instance }),
            )
            .with_tags(["service", "registry"]),
        );

        Ok(true)
    }

    fn schedule_removal(&self, service_id: &str) {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .pending_removals
            .insert(service_id.to_string(), token.clone())
        {
            previous.cancel();
        }

        let registry = self.clone();
        let grace = self.config.deregister_grace();
        let service_id = service_id.to_string();

        self.task_tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }
            registry.pending_removals.remove(&service_id);

            let still_shutdown = registry
                .get_service(&service_id)
                .is_some_and(|instance| instance.status == ServiceStatus::Shutdown);
            if still_shutdown && registry.remove_service(&service_id) {
                tracing::info!(service_id = %service_id, "Removed deregistered service after grace period");
            }
        });
    }

    /// 心跳: 刷新时间戳，starting/unhealthy 提升为 healthy
    pub fn heartbeat(&self, service_id: &str) -> Result<bool, RegistryError> {
        let now = Utc::now();
        let outcome = self.cache.update(
            REGISTRY_KEY,
            Some(self.config.service_ttl()),
            |registry: &mut Registry| {
                let instance = registry.get_mut(service_id)?;
                instance.last_heartbeat = now;
                let promoted = match instance.status {
                    ServiceStatus::Starting | ServiceStatus::Unhealthy => {
                        let previous = instance.status;
                        instance.status = ServiceStatus::Healthy;
                        Some(previous)
                    }
                    _ => None,
                };
                Some((instance.clone(), promoted))
            },
        )?;

        let Some((instance, promoted)) = outcome else {
            tracing::debug!(service_id = %service_id, "Heartbeat for unknown service");
            return Ok(false);
        };
        self.mirror(&instance);

        if let Some(previous) = promoted {
            tracing::info!(
                service_id = %service_id,
                old_status = %previous,
                "Service promoted to healthy by heartbeat"
            );
            self.emit(
                HealthChangedPayload {
                    service_id: instance.id.clone(),
                    service_name: instance.name.clone(),
                    old_status: previous,
                    new_status: ServiceStatus::Healthy,
                    response_time: 0,
                    error: None,
                }
                .into_event(EVENT_SOURCE),
            );
        }

        Ok(true)
    }

    // 读取注册表，缓存异常时按空表处理
    fn with_registry<R: Default>(&self, f: impl FnOnce(&Registry) -> R) -> R {
        match self.cache.read(REGISTRY_KEY, f) {
            Ok(Some(result)) => result,
            Ok(None) => R::default(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to read service registry");
                R::default()
            }
        }
    }

    pub fn get_service(&self, service_id: &str) -> Option<ServiceInstance> {
        self.with_registry(|registry| registry.get(service_id).cloned())
    }

    pub fn get_all_services(&self) -> HashMap<String, ServiceInstance> {
        self.with_registry(|registry| registry.clone())
    }

    /// 按注册时间排序，保证轮询顺序稳定
    pub fn list_services(&self) -> Vec<ServiceInstance> {
        let mut services: Vec<ServiceInstance> =
            self.with_registry(|registry| registry.values().cloned().collect());
        sort_by_registration(&mut services);
        services
    }

    pub fn get_services_by_type(&self, service_type: ServiceType) -> Vec<ServiceInstance> {
        let mut services: Vec<ServiceInstance> = self.with_registry(|registry| {
            registry
                .values()
                .filter(|instance| instance.service_type == service_type)
                .cloned()
                .collect()
        });
        sort_by_registration(&mut services);
        services
    }

    pub fn get_services_by_name(&self, name: &str) -> Vec<ServiceInstance> {
        let mut services: Vec<ServiceInstance> = self.with_registry(|registry| {
            registry
                .values()
                .filter(|instance| instance.name == name)
                .cloned()
                .collect()
        });
        sort_by_registration(&mut services);
        services
    }

    pub fn get_healthy_services(&self, name: &str) -> Vec<ServiceInstance> {
        let mut services = self.get_services_by_name(name);
        services.retain(|instance| instance.status == ServiceStatus::Healthy);
        services
    }

    /// 按权重随机挑选一个健康实例
    pub fn pick_weighted(&self, name: &str) -> Option<ServiceInstance> {
        let healthy = self.get_healthy_services(name);
        let total: u64 = healthy.iter().map(|i| u64::from(i.weight)).sum();
        if total == 0 {
            return None;
        }
        let point = rand::rng().random_range(0..total);
        select_weighted(&healthy, point).cloned()
    }

    /// 记录一次探测结果，返回更新后的实例与之前的状态
    ///
    /// 已处于 shutdown 的实例只记录快照与计数，状态保持不变。
    pub fn update_service_health(
        &self,
        health: ServiceHealth,
    ) -> Result<Option<(ServiceInstance, ServiceStatus)>, RegistryError> {
        let outcome = self.cache.update(
            REGISTRY_KEY,
            Some(self.config.service_ttl()),
            |registry: &mut Registry| {
                let instance = registry.get_mut(&health.service_id)?;
                let previous = instance.status;
                instance.health_check_count += 1;
                if health.status == ServiceStatus::Healthy {
                    instance.consecutive_failures = 0;
                } else {
                    instance.consecutive_failures += 1;
                }
                if previous != ServiceStatus::Shutdown {
                    instance.status = health.status;
                }
                Some((instance.clone(), previous))
            },
        )?;

        if let Some((instance, _)) = &outcome {
            self.mirror(instance);
            self.cache.set(
                &health_key(&health.service_id),
                health,
                Some(self.config.health_ttl()),
            );
        }
        Ok(outcome)
    }

    pub fn get_service_health(&self, service_id: &str) -> Option<ServiceHealth> {
        self.cache
            .get(&health_key(service_id))
            .unwrap_or_else(|e| {
                tracing::error!(service_id = %service_id, error = %e, "Failed to read health snapshot");
                None
            })
    }

    /// 保存性能采样 (不修改实例)
    pub fn update_service_metrics(
        &self,
        service_id: &str,
        mut metrics: ServiceMetrics,
    ) -> Result<(), RegistryError> {
        if self.get_service(service_id).is_none() {
            return Err(RegistryError::NotFound {
                service_id: service_id.to_string(),
            });
        }

        metrics.service_id = service_id.to_string();
        let payload = MetricsUpdatedPayload {
            service_id: service_id.to_string(),
            metrics: serde_json::to_value(&metrics).unwrap_or_default(),
        };
        self.cache.set(
            &metrics_key(service_id),
            metrics,
            Some(self.config.health_ttl()),
        );

        self.emit(
            PublishEvent::new(
                EventType::ServiceMetricsUpdated,
                EVENT_SOURCE,
                serde_json::to_value(&payload).unwrap_or_default(),
            )
            .with_priority(EventPriority::Low)
            .with_tags(["metrics"]),
        );
        Ok(())
    }

    pub fn get_service_metrics(&self, service_id: &str) -> Option<ServiceMetrics> {
        self.cache
            .get(&metrics_key(service_id))
            .unwrap_or_else(|e| {
                tracing::error!(service_id = %service_id, error = %e, "Failed to read metrics snapshot");
                None
            })
    }

    pub fn summary(&self) -> RegistryHealthSummary {
        self.with_registry(|registry| RegistryHealthSummary::from_instances(registry.values()))
    }

    /// 彻底删除一个实例及其快照
    pub fn remove_service(&self, service_id: &str) -> bool {
        let removed = self
            .cache
            .update(
                REGISTRY_KEY,
                Some(self.config.service_ttl()),
                |registry: &mut Registry| registry.remove(service_id).is_some(),
            )
            .unwrap_or_else(|e| {
                tracing::error!(service_id = %service_id, error = %e, "Failed to remove service");
                false
            });

        self.forget(service_id);
        removed
    }

    /// 过期清理
    ///
    /// - 非 shutdown 且心跳超时的实例置为 unhealthy
    /// - shutdown 且心跳早于清除阈值的实例删除
    /// - shutdown 但没有待执行删除任务的实例 (例如进程重启后) 在宽限期过后删除
    pub fn cleanup_stale_services(
        &self,
        now: DateTime<Utc>,
    ) -> Result<StaleSweepReport, RegistryError> {
        let heartbeat_timeout = elapsed_limit(self.config.heartbeat_timeout());
        let shutdown_purge = elapsed_limit(self.config.shutdown_purge());
        let grace = elapsed_limit(self.config.deregister_grace());
        let pending = &self.pending_removals;

        let (marked, purged) = self.cache.update(
            REGISTRY_KEY,
            Some(self.config.service_ttl()),
            |registry: &mut Registry| {
                let mut marked = Vec::new();
                let mut purged = Vec::new();

                for instance in registry.values_mut() {
                    let silence = now - instance.last_heartbeat;
                    if instance.status == ServiceStatus::Shutdown {
                        let orphaned = !pending.contains_key(&instance.id) && silence > grace;
                        if silence > shutdown_purge || orphaned {
                            purged.push(instance.id.clone());
                        }
                    } else if silence > heartbeat_timeout
                        && instance.status != ServiceStatus::Unhealthy
                    {
                        let previous = instance.status;
                        instance.status = ServiceStatus::Unhealthy;
                        marked.push((instance.clone(), previous));
                    }
                }

                for id in &purged {
                    registry.remove(id);
                }
                (marked, purged)
            },
        )?;

        for id in &purged {
            self.forget(id);
            tracing::info!(service_id = %id, "Purged shutdown service");
        }

        for (instance, previous) in &marked {
            self.mirror(instance);
            tracing::warn!(
                service_id = %instance.id,
                service_name = %instance.name,
                last_heartbeat = %instance.last_heartbeat,
                "Service heartbeat timed out, marking unhealthy"
            );
            self.emit(
                HealthChangedPayload {
                    service_id: instance.id.clone(),
                    service_name: instance.name.clone(),
                    old_status: *previous,
                    new_status: ServiceStatus::Unhealthy,
                    response_time: 0,
                    error: Some("heartbeat timeout".to_string()),
                }
                .into_event(EVENT_SOURCE),
            );
        }

        Ok(StaleSweepReport {
            marked_unhealthy: marked.into_iter().map(|(i, _)| i.id).collect(),
            purged,
        })
    }

    /// 取消所有待执行的删除任务并等待它们退出
    pub async fn shutdown(&self) {
        for entry in self.pending_removals.iter() {
            entry.value().cancel();
        }
        self.task_tracker.close();
        self.task_tracker.wait().await;
    }

    fn mirror(&self, instance: &ServiceInstance) {
        self.cache.set(
            &service_key(&instance.id),
            instance.clone(),
            Some(self.config.service_ttl()),
        );
    }

    // 删除实例副本、快照与待执行的删除任务
    fn forget(&self, service_id: &str) {
        self.cache.delete(&service_key(service_id));
        self.cache.delete(&health_key(service_id));
        self.cache.delete(&metrics_key(service_id));
        if let Some((_, token)) = self.pending_removals.remove(service_id) {
            token.cancel();
        }
    }

    fn request_probe(&self, service_id: &str) {
        if let Some(sender) = &self.probe_requests {
            if sender.send(service_id.to_string()).is_err() {
                tracing::debug!(service_id = %service_id, "Probe worker not running, skipping initial probe");
            }
        }
    }

    fn emit(&self, draft: PublishEvent) {
        let event_type = draft.event_type;
        if let Err(e) = self.events.publish(draft) {
            tracing::error!(event_type = %event_type, error = %e, "Failed to publish registry event");
        }
    }
}

// <name>-<host>-<port>-<随机后缀>，与现有 ID 冲突时重新生成
fn generate_service_id(descriptor: &RegisterServiceDescriptor, registry: &Registry) -> String {
    let base: String = format!("{}-{}-{}", descriptor.name, descriptor.host, descriptor.port)
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();

    loop {
        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!("{base}-{}", &suffix[..12]);
        if !registry.contains_key(&id) {
            return id;
        }
    }
}

fn sort_by_registration(services: &mut [ServiceInstance]) {
    services.sort_by(|a, b| {
        a.registered_at
            .cmp(&b.registered_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// `point` 取值于 `0..总权重`
pub(crate) fn select_weighted(instances: &[ServiceInstance], point: u64) -> Option<&ServiceInstance> {
    let mut cumulative = 0u64;
    for instance in instances {
        cumulative += u64::from(instance.weight);
        if point < cumulative {
            return Some(instance);
        }
    }
    None
}

// 超出 chrono 可表示范围的时长视为永不过期
fn elapsed_limit(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
