use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;

use super::balancer;
use super::types::{DiscoveryQuery, LoadBalancerState};
use crate::config::DiscoveryConfig;
use crate::services::cache::CacheStore;
use crate::services::registry::{ServiceInstance, ServiceRegistry};

/// 服务发现: 注册表之上的查询与负载均衡层
#[derive(Debug, Clone)]
pub struct ServiceDiscovery {
    registry: ServiceRegistry,
    cache: CacheStore,
    // 每个服务名一把锁
    balancers: Arc<DashMap<String, Arc<Mutex<LoadBalancerState>>>>,
    config: DiscoveryConfig,
}

impl ServiceDiscovery {
    pub fn new(registry: ServiceRegistry, cache: CacheStore, config: DiscoveryConfig) -> Self {
        Self {
            registry,
            cache,
            balancers: Arc::new(DashMap::new()),
            config,
        }
    }

    /// 过滤后的候选集，按过滤条件缓存
    pub fn discover_all(&self, service_name: &str, query: &DiscoveryQuery) -> Vec<ServiceInstance> {
        let key = query.cache_key(service_name);
        match self.cache.get::<Vec<ServiceInstance>>(&key) {
            Ok(Some(candidates)) => return candidates,
            Ok(None) => {}
            Err(e) => tracing::warn!(key = %key, error = %e, "Discovery cache read failed"),
        }

        let mut candidates = self.registry.get_services_by_name(service_name);
        candidates.retain(|instance| query.matches(instance));

        self.cache.set(
            &key,
            candidates.clone(),
            Some(Duration::from_secs(self.config.cache_ttl_secs)),
        );
        candidates
    }

    /// 选出一个实例；没有候选时返回 `None`
    pub fn discover_one(&self, service_name: &str, query: &DiscoveryQuery) -> Option<ServiceInstance> {
        let mut candidates = self.discover_all(service_name, query);
        match candidates.len() {
            0 => {
                tracing::debug!(service_name = %service_name, "No instances available");
                None
            }
            1 => candidates.pop(),
            _ if !self.config.load_balancing => Some(candidates.swap_remove(0)),
            _ => {
                let state = self.balancer(service_name);
                let mut state = match state.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                let index = balancer::select(
                    self.config.strategy,
                    &mut state,
                    &candidates,
                    self.config.failure_threshold,
                    &mut rand::rng(),
                );
                Some(candidates.swap_remove(index))
            }
        }
    }

    /// `protocol://host:port/path`
    pub fn resolve_url(
        &self,
        service_name: &str,
        path: &str,
        protocol: &str,
        query: &DiscoveryQuery,
    ) -> Option<String> {
        let instance = self.discover_one(service_name, query)?;
        let path = path.trim_start_matches('/');
        Some(format!("{protocol}://{}/{path}", instance.address()))
    }

    /// 调用结果回报，返回是否找到对应的负载均衡状态
    pub fn report_outcome(&self, instance_id: &str, success: bool, response_time: Option<u64>) -> bool {
        let state = match self.registry.get_service(instance_id) {
            Some(instance) => Some(self.balancer(&instance.name)),
            // 实例可能已被删除，但状态仍在
            None => self.balancers.iter().find_map(|entry| {
                let tracked = entry
                    .value()
                    .lock()
                    .map(|state| state.tracks(instance_id))
                    .unwrap_or(false);
                tracked.then(|| entry.value().clone())
            }),
        };
        let Some(state) = state else {
            tracing::debug!(instance_id = %instance_id, "Outcome reported for unknown instance");
            return false;
        };

        let mut state = match state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if success {
            state.record_success(instance_id);
        } else {
            state.record_failure(instance_id);
            tracing::debug!(
                instance_id = %instance_id,
                failures = state.failures(instance_id),
                response_time_ms = ?response_time,
                "Recorded failed call"
            );
        }
        true
    }

    /// 某个服务名当前的负载均衡状态快照
    pub fn balancer_state(&self, service_name: &str) -> Option<LoadBalancerState> {
        let state = self.balancers.get(service_name)?.value().clone();
        let snapshot = state.lock().map(|s| s.clone()).ok();
        snapshot
    }

    // 首次访问时创建
    fn balancer(&self, service_name: &str) -> Arc<Mutex<LoadBalancerState>> {
        self.balancers
            .entry(service_name.to_string())
            .or_default()
            .value()
            .clone()
    }
}
