use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::cache::CacheError;
use crate::services::registry::ServiceStatus;

/// 系统事件类型 (封闭集合)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    ServiceRegistered,
    ServiceDeregistered,
    ServiceHealthChanged,
    ServiceMetricsUpdated,
    SystemAlert,
    SystemError,
    TransactionCreated,
    TransactionCompleted,
    PriceUpdated,
    InventoryLow,
    UppfClaimSubmitted,
    DealerSettlement,
}

impl EventType {
    pub const ALL: [EventType; 12] = [
        EventType::ServiceRegistered,
        EventType::ServiceDeregistered,
        EventType::ServiceHealthChanged,
        EventType::ServiceMetricsUpdated,
        EventType::SystemAlert,
        EventType::SystemError,
        EventType::TransactionCreated,
        EventType::TransactionCompleted,
        EventType::PriceUpdated,
        EventType::InventoryLow,
        EventType::UppfClaimSubmitted,
        EventType::DealerSettlement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ServiceRegistered => "SERVICE_REGISTERED",
            EventType::ServiceDeregistered => "SERVICE_DEREGISTERED",
            EventType::ServiceHealthChanged => "SERVICE_HEALTH_CHANGED",
            EventType::ServiceMetricsUpdated => "SERVICE_METRICS_UPDATED",
            EventType::SystemAlert => "SYSTEM_ALERT",
            EventType::SystemError => "SYSTEM_ERROR",
            EventType::TransactionCreated => "TRANSACTION_CREATED",
            EventType::TransactionCompleted => "TRANSACTION_COMPLETED",
            EventType::PriceUpdated => "PRICE_UPDATED",
            EventType::InventoryLow => "INVENTORY_LOW",
            EventType::UppfClaimSubmitted => "UPPF_CLAIM_SUBMITTED",
            EventType::DealerSettlement => "DEALER_SETTLEMENT",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| EventError::InvalidEventType {
                event_type: s.to_string(),
            })
    }
}

/// 事件优先级
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    #[serde(alias = "LOW")]
    Low,
    #[default]
    #[serde(alias = "NORMAL")]
    Normal,
    #[serde(alias = "HIGH")]
    High,
    #[serde(alias = "CRITICAL")]
    Critical,
}

impl EventPriority {
    pub const ALL: [EventPriority; 4] = [
        EventPriority::Low,
        EventPriority::Normal,
        EventPriority::High,
        EventPriority::Critical,
    ];

    /// HIGH / CRITICAL 走快速通道
    pub fn is_urgent(&self) -> bool {
        matches!(self, EventPriority::High | EventPriority::Critical)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventPriority::Low => "low",
            EventPriority::Normal => "normal",
            EventPriority::High => "high",
            EventPriority::Critical => "critical",
        }
    }
}

impl FromStr for EventPriority {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventPriority::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| EventError::InvalidPriority {
                priority: s.to_string(),
            })
    }
}

/// 已发布的不可变事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: serde_json::Value,
    pub source: String,
    pub priority: EventPriority,
    pub tags: Vec<String>,
    /// 为空表示广播
    pub targets: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// 建议性 TTL (秒)
    pub ttl: u64,
    pub retry_count: u32,
    pub processed: bool,
}

impl SystemEvent {
    /// 把开放的 `data` 解析为该事件类型对应的具体载荷
    pub fn payload<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.data.clone()).ok()
    }
}

/// 待发布的事件草稿
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub data: serde_json::Value,
    pub source: String,
    #[serde(default)]
    pub priority: Option<EventPriority>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub ttl: Option<u64>,
}

impl PublishEvent {
    pub fn new(event_type: EventType, source: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type,
            data,
            source: source.into(),
            priority: None,
            tags: Vec::new(),
            targets: Vec::new(),
            correlation_id: None,
            ttl: None,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// 历史查询过滤条件
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<EventType>,
    pub priority: Option<EventPriority>,
    pub source: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start_date: Some(start),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &SystemEvent) -> bool {
        self.event_type.is_none_or(|t| event.event_type == t)
            && self.priority.is_none_or(|p| event.priority == p)
            && self.source.as_deref().is_none_or(|s| event.source == s)
            && self.start_date.is_none_or(|start| event.timestamp >= start)
            && self.end_date.is_none_or(|end| event.timestamp <= end)
    }
}

/// 告警严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn priority(&self) -> EventPriority {
        match self {
            AlertSeverity::Critical => EventPriority::Critical,
            AlertSeverity::High => EventPriority::High,
            AlertSeverity::Medium => EventPriority::Normal,
            AlertSeverity::Low => EventPriority::Low,
        }
    }
}

/// SYSTEM_ALERT 载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    pub severity: AlertSeverity,
    #[serde(default)]
    pub title: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
}

/// SERVICE_HEALTH_CHANGED 载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthChangedPayload {
    pub service_id: String,
    pub service_name: String,
    pub old_status: ServiceStatus,
    pub new_status: ServiceStatus,
    pub response_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthChangedPayload {
    /// 新状态为 unhealthy/critical 时以 HIGH 发布，会触发快速通道告警
    pub fn into_event(self, source: &str) -> PublishEvent {
        let priority = match self.new_status {
            ServiceStatus::Unhealthy | ServiceStatus::Critical => EventPriority::High,
            _ => EventPriority::Normal,
        };
        PublishEvent::new(
            EventType::ServiceHealthChanged,
            source,
            serde_json::to_value(&self).unwrap_or_default(),
        )
        .with_priority(priority)
        .with_tags(["health-check", "service-status"])
    }
}

/// SERVICE_METRICS_UPDATED 载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsUpdatedPayload {
    pub service_id: String,
    pub metrics: serde_json::Value,
}

/// INVENTORY_LOW 载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryLowPayload {
    pub product: String,
    pub current_level: f64,
}

/// 事件总线错误类型
#[derive(Error, Debug)]
pub enum EventError {
    #[error("Event not found: {event_id}")]
    NotFound { event_id: String },

    #[error("Invalid event type: {event_type}")]
    InvalidEventType { event_type: String },

    #[error("Invalid event priority: {priority}")]
    InvalidPriority { priority: String },

    #[error("Invalid event: {0}")]
    Invalid(String),

    #[error("Event history unavailable: {0}")]
    Cache(#[from] CacheError),
}

/// 处理器执行失败
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// 进程内事件处理器
pub type EventHandlerFn = Arc<dyn Fn(SystemEvent) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// 把异步闭包包装成 `EventHandlerFn`
pub fn handler_fn<F, Fut>(f: F) -> EventHandlerFn
where
    F: Fn(SystemEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// 订阅键: 具体事件类型或通配符 `*`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSelector {
    Type(EventType),
    Any,
}

impl FromStr for EventSelector {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            Ok(EventSelector::Any)
        } else {
            s.parse().map(EventSelector::Type)
        }
    }
}

impl From<EventType> for EventSelector {
    fn from(event_type: EventType) -> Self {
        EventSelector::Type(event_type)
    }
}

/// 处理器注册句柄，用于取消订阅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u64);

/// 总线健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBusHealth {
    pub status: BusStatus,
    pub queue_size: usize,
    pub processing_errors: usize,
    pub last_event_processed: Option<DateTime<Utc>>,
    pub subscribers: usize,
}

/// 事件统计信息
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStats {
    /// 已发布的事件总数
    pub events_published: u64,
    /// 已分发到处理器的次数
    pub events_delivered: u64,
    /// 处理器失败次数
    pub delivery_failures: u64,
    /// 分发任务落后而跳过的事件数
    pub events_skipped: u64,
    /// 广播通道上的外部接收者数量
    pub channel_receivers: usize,
}
