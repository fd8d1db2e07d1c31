use std::fmt;

use serde::{Deserialize, Serialize};

use crate::services::event::EventType;

/// 实时网关的逻辑频道
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    ServiceUpdates,
    Metrics,
    Alerts,
    Transactions,
    Pricing,
    Inventory,
    Uppf,
    Dealers,
    General,
}

impl Channel {
    /// 每种事件类型固定映射到一个频道
    pub fn for_event(event_type: EventType) -> Channel {
        match event_type {
            EventType::ServiceRegistered
            | EventType::ServiceDeregistered
            | EventType::ServiceHealthChanged => Channel::ServiceUpdates,
            EventType::ServiceMetricsUpdated => Channel::Metrics,
            EventType::SystemAlert => Channel::Alerts,
            EventType::TransactionCreated | EventType::TransactionCompleted => {
                Channel::Transactions
            }
            EventType::PriceUpdated => Channel::Pricing,
            EventType::InventoryLow => Channel::Inventory,
            EventType::UppfClaimSubmitted => Channel::Uppf,
            EventType::DealerSettlement => Channel::Dealers,
            EventType::SystemError => Channel::General,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::ServiceUpdates => "service_updates",
            Channel::Metrics => "metrics",
            Channel::Alerts => "alerts",
            Channel::Transactions => "transactions",
            Channel::Pricing => "pricing",
            Channel::Inventory => "inventory",
            Channel::Uppf => "uppf",
            Channel::Dealers => "dealers",
            Channel::General => "general",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
