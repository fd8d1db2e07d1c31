use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;

use super::types::{DependencyHealth, DependencyStatus};
use crate::services::registry::{ServiceHealth, ServiceInstance, ServiceStatus};

const USER_AGENT: &str = "service-mesh-registry-health-check/1.0";

/// 单个实例的健康探测
///
/// 实现不得返回错误: 超时、连接失败都折算成 unhealthy 的结果。
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, instance: &ServiceInstance) -> ServiceHealth;
}

/// 对实例的健康端点发起 HTTP GET
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }
}

pub fn build_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, instance: &ServiceInstance) -> ServiceHealth {
        let url = instance.health_url();
        let started = Instant::now();
        let result = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await;

        match result {
            Ok(response) => {
                let status_code = response.status();
                let body = response.json::<serde_json::Value>().await.ok();
                let status = if status_code.is_success() {
                    ServiceStatus::Healthy
                } else {
                    ServiceStatus::Unhealthy
                };
                ServiceHealth {
                    service_id: instance.id.clone(),
                    status,
                    timestamp: Utc::now(),
                    response_time: elapsed_ms(started),
                    error: (!status_code.is_success())
                        .then(|| format!("health endpoint returned {status_code}")),
                    details: Some(body.unwrap_or_else(
                        || serde_json::json!({ "statusCode": status_code.as_u16() }),
                    )),
                }
            }
            Err(e) => {
                tracing::warn!(
                    service_id = %instance.id,
                    service_name = %instance.name,
                    url = %url,
                    error = %e,
                    "Health check failed"
                );
                ServiceHealth {
                    service_id: instance.id.clone(),
                    status: ServiceStatus::Unhealthy,
                    timestamp: Utc::now(),
                    response_time: elapsed_ms(started),
                    error: Some(e.to_string()),
                    details: Some(serde_json::json!({
                        "errorType": error_kind(&e),
                        "timeout": e.is_timeout(),
                    })),
                }
            }
        }
    }
}

/// 外部依赖检查: 200 为 healthy，其他状态码 degraded，请求失败 unhealthy
pub async fn check_endpoint(client: &reqwest::Client, url: &str) -> DependencyHealth {
    let started = Instant::now();
    match client.get(url).send().await {
        Ok(response) => {
            let status_code = response.status();
            DependencyHealth {
                status: if status_code == StatusCode::OK {
                    DependencyStatus::Healthy
                } else {
                    DependencyStatus::Degraded
                },
                response_time: elapsed_ms(started),
                error: None,
                details: Some(serde_json::json!({ "statusCode": status_code.as_u16() })),
            }
        }
        Err(e) => DependencyHealth {
            status: DependencyStatus::Unhealthy,
            response_time: elapsed_ms(started),
            error: Some(e.to_string()),
            details: None,
        },
    }
}

fn error_kind(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "TIMEOUT"
    } else if e.is_connect() {
        "CONNECTION"
    } else if e.is_decode() {
        "DECODE"
    } else {
        "UNKNOWN"
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
