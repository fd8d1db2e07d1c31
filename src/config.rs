use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::services::discovery::LoadBalancingStrategy;

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const ENV_PREFIX: &str = "REGISTRY_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub registry: RegistryConfig,
    pub discovery: DiscoveryConfig,
    pub health: HealthConfig,
    pub events: EventsConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3010,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub purge_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            purge_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// 实例记录与注册表总表的 TTL
    pub service_ttl_secs: u64,
    /// 健康/指标快照的 TTL
    pub health_ttl_secs: u64,
    /// 注销后到物理删除的宽限期
    pub deregister_grace_secs: u64,
    /// 心跳超时，超过则强制置为 unhealthy
    pub heartbeat_timeout_secs: u64,
    /// shutdown 状态保留多久后彻底清除
    pub shutdown_purge_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            service_ttl_secs: 3600,
            health_ttl_secs: 300,
            deregister_grace_secs: 30,
            heartbeat_timeout_secs: 300,
            shutdown_purge_secs: 1800,
            cleanup_interval_secs: 60,
        }
    }
}

impl RegistryConfig {
    pub fn service_ttl(&self) -> Duration {
        Duration::from_secs(self.service_ttl_secs)
    }

    pub fn health_ttl(&self) -> Duration {
        Duration::from_secs(self.health_ttl_secs)
    }

    pub fn deregister_grace(&self) -> Duration {
        Duration::from_secs(self.deregister_grace_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn shutdown_purge(&self) -> Duration {
        Duration::from_secs(self.shutdown_purge_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub load_balancing: bool,
    pub strategy: LoadBalancingStrategy,
    /// 熔断阈值
    pub failure_threshold: u32,
    pub cache_ttl_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            load_balancing: true,
            strategy: LoadBalancingStrategy::RoundRobin,
            failure_threshold: 3,
            cache_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_secs: u64,
    pub probe_timeout_secs: u64,
    pub max_concurrent_probes: usize,
    /// 每轮探测开始前的随机抖动上限
    pub jitter_ms: u64,
    pub metrics_interval_secs: u64,
    pub metrics_ttl_secs: u64,
    /// 外部依赖名 -> URL
    pub external_endpoints: HashMap<String, String>,
    pub external_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            probe_timeout_secs: 10,
            max_concurrent_probes: 16,
            jitter_ms: 0,
            metrics_interval_secs: 60,
            metrics_ttl_secs: 300,
            external_endpoints: HashMap::new(),
            external_timeout_secs: 5,
        }
    }
}

impl HealthConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn metrics_ttl(&self) -> Duration {
        Duration::from_secs(self.metrics_ttl_secs)
    }

    pub fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.external_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub history_capacity: usize,
    pub history_ttl_secs: u64,
    pub channel_capacity: usize,
    pub default_event_ttl_secs: u64,
    /// 快速通道内再次发布事件的最大嵌套深度
    pub max_fast_path_depth: u8,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            history_capacity: 10_000,
            history_ttl_secs: 86_400,
            channel_capacity: 1024,
            default_event_ttl_secs: 3600,
            max_fast_path_depth: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub tokens: Vec<String>,
}

// 环境变量覆盖项 (REGISTRY_ 前缀)
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    host: Option<String>,
    port: Option<u16>,
    load_balancing: Option<bool>,
    strategy: Option<LoadBalancingStrategy>,
    failure_threshold: Option<u32>,
    health_check_interval: Option<u64>,
    probe_timeout: Option<u64>,
    tokens: Option<String>,
    elasticsearch_url: Option<String>,
}

impl Config {
    /// 依次加载 .env、配置文件与环境变量覆盖
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        let path = std::env::var(format!("{ENV_PREFIX}CONFIG"))
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(&path)?;

        let overrides: EnvOverrides = envy::prefixed(ENV_PREFIX).from_env()?;
        config.apply_overrides(overrides);

        Ok(config)
    }

    /// 配置文件不存在时使用默认值
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let config_str = fs::read_to_string(path)?;
        Self::from_toml(&config_str)
    }

    pub fn from_toml(config_str: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: Config = toml::from_str(config_str)?;
        Ok(config)
    }

    fn apply_overrides(&mut self, overrides: EnvOverrides) {
        if let Some(host) = overrides.host {
            self.server.host = host;
        }
        if let Some(port) = overrides.port {
            self.server.port = port;
        }
        if let Some(enabled) = overrides.load_balancing {
            self.discovery.load_balancing = enabled;
        }
        if let Some(strategy) = overrides.strategy {
            self.discovery.strategy = strategy;
        }
        if let Some(threshold) = overrides.failure_threshold {
            self.discovery.failure_threshold = threshold;
        }
        if let Some(interval) = overrides.health_check_interval {
            self.health.check_interval_secs = interval;
        }
        if let Some(timeout) = overrides.probe_timeout {
            self.health.probe_timeout_secs = timeout;
        }
        if let Some(tokens) = overrides.tokens {
            self.security.tokens = tokens
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(url) = overrides.elasticsearch_url {
            self.health
                .external_endpoints
                .insert("elastic-search".to_string(), url);
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// 未配置任何 token 时不做校验
    pub fn validate_token(&self, token: &str) -> bool {
        self.security.tokens.is_empty() || self.security.tokens.iter().any(|t| t == token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [server]
            port = 9000

            [discovery]
            strategy = "least_connections"

            [health.external_endpoints]
            ghana-npa = "https://npa.gov.gh"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(
            config.discovery.strategy,
            LoadBalancingStrategy::LeastConnections
        );
        assert_eq!(config.discovery.failure_threshold, 3);
        assert_eq!(config.events.history_capacity, 10_000);
        assert_eq!(config.health.external_endpoints.len(), 1);
    }

    #[test]
    fn test_overrides_win_over_file() {
        let mut config = Config::default();
        config.apply_overrides(EnvOverrides {
            port: Some(4000),
            strategy: Some(LoadBalancingStrategy::Random),
            tokens: Some("a, b,".to_string()),
            ..Default::default()
        });

        assert_eq!(config.server.port, 4000);
        assert_eq!(config.discovery.strategy, LoadBalancingStrategy::Random);
        assert_eq!(config.security.tokens, vec!["a", "b"]);
    }

    #[test]
    fn test_validate_token() {
        let mut config = Config::default();
        assert!(config.validate_token("anything"));

        config.security.tokens = vec!["secret".to_string()];
        assert!(config.validate_token("secret"));
        assert!(!config.validate_token("wrong"));
    }
}
