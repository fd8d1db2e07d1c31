//! 服务注册表
//!
//! - `types`: 实例、描述符、快照与错误类型
//! - `service`: 注册、注销、心跳与查询
//! - `cleanup`: 周期性的过期清理

pub mod cleanup;
pub mod service;
pub mod types;

pub use service::{REGISTRY_KEY, ServiceRegistry};
pub use types::{
    RegisterServiceDescriptor, RegistryError, RegistryHealthSummary, ServiceHealth,
    ServiceInstance, ServiceMetrics, ServiceStatus, ServiceType, StaleSweepReport,
};
