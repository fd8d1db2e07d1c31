use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::cache::CacheError;

pub const DEFAULT_HEALTH_ENDPOINT: &str = "/health";
pub const DEFAULT_WEIGHT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Api,
    Worker,
    Database,
    Cache,
    Gateway,
    External,
}

// 服务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Starting,
    Healthy,
    Unhealthy,
    Critical,
    Maintenance,
    Shutdown,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Starting => "starting",
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Unhealthy => "unhealthy",
            ServiceStatus::Critical => "critical",
            ServiceStatus::Maintenance => "maintenance",
            ServiceStatus::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 已注册的服务实例
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub status: ServiceStatus,
    pub health_endpoint: String,
    pub tags: BTreeSet<String>,
    pub metadata: HashMap<String, serde_json::Value>,
    pub dependencies: BTreeSet<String>,
    pub weight: u32,
    pub environment: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub health_check_count: u64,
    pub consecutive_failures: u32,
}

impl ServiceInstance {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn health_url(&self) -> String {
        let path = if self.health_endpoint.starts_with('/') {
            self.health_endpoint.clone()
        } else {
            format!("/{}", self.health_endpoint)
        };
        format!("http://{}{}", self.address(), path)
    }
}

/// 注册请求
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterServiceDescriptor {
    pub name: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    #[serde(default)]
    pub health_endpoint: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub weight: Option<u32>,
    #[serde(default)]
    pub environment: Option<String>,
}

impl RegisterServiceDescriptor {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        service_type: ServiceType,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            host: host.into(),
            port,
            service_type,
            health_endpoint: None,
            tags: Vec::new(),
            metadata: HashMap::new(),
            dependencies: Vec::new(),
            weight: None,
            environment: None,
        }
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::Validation("name is required".into()));
        }
        if self.version.trim().is_empty() {
            return Err(RegistryError::Validation("version is required".into()));
        }
        if self.host.trim().is_empty() {
            return Err(RegistryError::Validation("host is required".into()));
        }
        if self.port == 0 {
            return Err(RegistryError::Validation("port must be in 1..=65535".into()));
        }
        if self.weight == Some(0) {
            return Err(RegistryError::Validation("weight must be positive".into()));
        }
        Ok(())
    }
}

/// 最近一次健康探测结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub service_id: String,
    pub status: ServiceStatus,
    pub timestamp: DateTime<Utc>,
    /// 毫秒
    pub response_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// 最近一次性能采样
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMetrics {
    #[serde(default)]
    pub service_id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub requests_per_second: f64,
    pub error_rate: f64,
    #[serde(default)]
    pub average_response_time: f64,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<serde_json::Value>,
}

/// 按状态统计的注册表概况
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryHealthSummary {
    pub total: usize,
    pub starting: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub critical: usize,
    pub maintenance: usize,
    pub shutdown: usize,
}

impl RegistryHealthSummary {
    pub fn from_instances<'a>(instances: impl IntoIterator<Item = &'a ServiceInstance>) -> Self {
        let mut summary = Self::default();
        for instance in instances {
            summary.total += 1;
            match instance.status {
                ServiceStatus::Starting => summary.starting += 1,
                ServiceStatus::Healthy => summary.healthy += 1,
                ServiceStatus::Unhealthy => summary.unhealthy += 1,
                ServiceStatus::Critical => summary.critical += 1,
                ServiceStatus::Maintenance => summary.maintenance += 1,
                ServiceStatus::Shutdown => summary.shutdown += 1,
            }
        }
        summary
    }
}

/// 一次过期清理的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaleSweepReport {
    pub marked_unhealthy: Vec<String>,
    pub purged: Vec<String>,
}

/// 注册表错误类型
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Service not found: {service_id}")]
    NotFound { service_id: String },

    #[error("Invalid service descriptor: {0}")]
    Validation(String),

    #[error("Registry store unavailable: {0}")]
    Cache(#[from] CacheError),
}
