use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::services::registry::{ServiceHealth, ServiceStatus};

/// 依赖项状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyHealth {
    pub status: DependencyStatus,
    /// 毫秒
    pub response_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuMetrics {
    /// 百分比
    pub usage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMetrics {
    pub used: u64,
    pub total: u64,
    pub percentage: f64,
}

impl UsageMetrics {
    pub fn new(used: u64, total: u64) -> Self {
        let percentage = if total == 0 {
            0.0
        } else {
            (used as f64 / total as f64 * 100.0).round()
        };
        Self {
            used,
            total,
            percentage,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_sec: f64,
    pub tx_sec: f64,
}

/// 本机资源采样
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub cpu: CpuMetrics,
    pub memory: UsageMetrics,
    pub disk: UsageMetrics,
    pub network: NetworkMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceCounts {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub critical: usize,
}

/// 系统健康快照，每次采集覆盖一次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealthMetrics {
    pub timestamp: DateTime<Utc>,
    pub cpu: CpuMetrics,
    pub memory: UsageMetrics,
    pub disk: UsageMetrics,
    pub network: NetworkMetrics,
    pub services: ServiceCounts,
    /// 内部存储依赖 (缓存)
    pub database: BTreeMap<String, DependencyHealth>,
    pub external: BTreeMap<String, DependencyHealth>,
}

/// 单次探测的结果
#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckResult {
    pub service_id: String,
    pub health: ServiceHealth,
    pub previous_status: ServiceStatus,
    pub status_changed: bool,
}
