use chrono::{DateTime, Utc};
use serde::de;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::channels::Channel;
use crate::services::event::{AlertSeverity, SystemEvent};
use crate::services::registry::{ServiceHealth, ServiceInstance, ServiceMetrics};

/// 客户端发来的消息: `{"type": "...", "data": {...}}`，`data` 可省略
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawClientMessage")]
pub enum ClientMessage {
    Subscribe { channels: Vec<Channel> },
    Unsubscribe { channels: Vec<Channel> },
    GetServiceStatus { service_id: Option<String> },
    GetSystemDashboard,
}

const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "subscribe",
    "unsubscribe",
    "get_service_status",
    "get_system_dashboard",
];

#[derive(Deserialize)]
struct RawClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct ChannelsData {
    channels: Vec<Channel>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceStatusData {
    #[serde(default)]
    service_id: Option<String>,
}

impl TryFrom<RawClientMessage> for ClientMessage {
    type Error = serde_json::Error;

    fn try_from(raw: RawClientMessage) -> Result<Self, Self::Error> {
        // 缺省或 null 的 data 视为空对象
        let data = match raw.data {
            Value::Null => Value::Object(Default::default()),
            data => data,
        };

        match raw.kind.as_str() {
            "subscribe" => {
                let ChannelsData { channels } = serde_json::from_value(data)?;
                Ok(ClientMessage::Subscribe { channels })
            }
            "unsubscribe" => {
                let ChannelsData { channels } = serde_json::from_value(data)?;
                Ok(ClientMessage::Unsubscribe { channels })
            }
            "get_service_status" => {
                let ServiceStatusData { service_id } = serde_json::from_value(data)?;
                Ok(ClientMessage::GetServiceStatus { service_id })
            }
            "get_system_dashboard" => Ok(ClientMessage::GetSystemDashboard),
            other => Err(de::Error::unknown_variant(other, CLIENT_MESSAGE_TYPES)),
        }
    }
}

/// 服务端推送
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    ConnectionEstablished {
        client_id: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    SystemStatus(SystemStatus),
    SubscriptionConfirmed {
        channels: Vec<Channel>,
        timestamp: DateTime<Utc>,
    },
    UnsubscriptionConfirmed {
        channels: Vec<Channel>,
        timestamp: DateTime<Utc>,
    },
    ServiceStatus {
        service: Option<ServiceInstance>,
        health: Option<ServiceHealth>,
        metrics: Option<ServiceMetrics>,
        timestamp: DateTime<Utc>,
    },
    AllServicesStatus {
        services: Vec<ServiceInstance>,
        timestamp: DateTime<Utc>,
    },
    SystemDashboard(SystemDashboard),
    SystemEvent {
        event: SystemEvent,
        timestamp: DateTime<Utc>,
    },
    ServiceUpdate {
        service: ServiceInstance,
        timestamp: DateTime<Utc>,
    },
    Alert {
        severity: AlertSeverity,
        title: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        service: Option<String>,
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    MetricsUpdate {
        service_id: String,
        metrics: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>, error: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            error,
            timestamp: Utc::now(),
        }
    }

    /// 推送类型名，用于日志
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::ConnectionEstablished { .. } => "connection_established",
            ServerMessage::SystemStatus(_) => "system_status",
            ServerMessage::SubscriptionConfirmed { .. } => "subscription_confirmed",
            ServerMessage::UnsubscriptionConfirmed { .. } => "unsubscription_confirmed",
            ServerMessage::ServiceStatus { .. } => "service_status",
            ServerMessage::AllServicesStatus { .. } => "all_services_status",
            ServerMessage::SystemDashboard(_) => "system_dashboard",
            ServerMessage::SystemEvent { .. } => "system_event",
            ServerMessage::ServiceUpdate { .. } => "service_update",
            ServerMessage::Alert { .. } => "alert",
            ServerMessage::MetricsUpdate { .. } => "metrics_update",
            ServerMessage::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub total_services: usize,
    pub healthy_services: usize,
    pub unhealthy_services: usize,
    pub critical_services: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemDashboard {
    pub total_services: usize,
    pub healthy_services: usize,
    pub unhealthy_services: usize,
    pub services: Vec<ServiceInstance>,
    pub timestamp: DateTime<Utc>,
}

/// 网关错误类型
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Malformed client message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unknown client: {client_id}")]
    UnknownClient { client_id: String },
}
