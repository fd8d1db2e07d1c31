//! 健康检查引擎: 实例探测、系统指标与告警

pub mod alerts;
pub mod checker;
pub mod probe;
pub mod system;
pub mod types;

pub use alerts::evaluate_alerts;
pub use checker::{HealthChecker, SYSTEM_METRICS_KEY};
pub use probe::{HealthProbe, HttpProbe};
pub use types::{DependencyHealth, DependencyStatus, HealthCheckResult, SystemHealthMetrics};
