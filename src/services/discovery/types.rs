use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::services::registry::{ServiceInstance, ServiceStatus};

/// 负载均衡策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    Weighted,
    LeastConnections,
    Random,
}

/// 服务发现过滤条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryQuery {
    pub version: Option<String>,
    pub tags: Vec<String>,
    pub exclude_unhealthy: bool,
}

impl Default for DiscoveryQuery {
    fn default() -> Self {
        Self {
            version: None,
            tags: Vec::new(),
            exclude_unhealthy: true,
        }
    }
}

impl DiscoveryQuery {
    /// 候选集缓存键，标签顺序不影响结果
    pub fn cache_key(&self, service_name: &str) -> String {
        let mut tags = self.tags.clone();
        tags.sort();
        tags.dedup();
        format!(
            "discovery:{}:{}:{}:{}",
            service_name,
            self.version.as_deref().unwrap_or("*"),
            tags.join(","),
            if self.exclude_unhealthy { "healthy" } else { "all" }
        )
    }

    pub fn matches(&self, instance: &ServiceInstance) -> bool {
        let status_ok = if self.exclude_unhealthy {
            instance.status == ServiceStatus::Healthy
        } else {
            instance.status != ServiceStatus::Shutdown
        };
        status_ok
            && self
                .version
                .as_deref()
                .is_none_or(|version| instance.version == version)
            && self.tags.iter().all(|tag| instance.tags.contains(tag))
    }
}

/// 单个服务名下的负载均衡状态，只存在于本进程
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerState {
    pub current_index: usize,
    pub connections: HashMap<String, u32>,
    pub failure_count: HashMap<String, u32>,
    pub last_used: HashMap<String, DateTime<Utc>>,
}

impl LoadBalancerState {
    pub fn failures(&self, instance_id: &str) -> u32 {
        self.failure_count.get(instance_id).copied().unwrap_or(0)
    }

    pub fn connections(&self, instance_id: &str) -> u32 {
        self.connections.get(instance_id).copied().unwrap_or(0)
    }

    pub fn tracks(&self, instance_id: &str) -> bool {
        self.failure_count.contains_key(instance_id)
            || self.connections.contains_key(instance_id)
            || self.last_used.contains_key(instance_id)
    }

    pub fn record_success(&mut self, instance_id: &str) {
        self.failure_count.insert(instance_id.to_string(), 0);
        if let Some(active) = self.connections.get_mut(instance_id) {
            *active = active.saturating_sub(1);
        }
    }

    pub fn record_failure(&mut self, instance_id: &str) {
        *self.failure_count.entry(instance_id.to_string()).or_insert(0) += 1;
    }
}

/// 调用方回报的调用结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeReport {
    pub service_id: String,
    pub success: bool,
    #[serde(default)]
    pub response_time: Option<u64>,
}
