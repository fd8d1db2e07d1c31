//! 事件总线模块
//!
//! - `types`: 事件、载荷、过滤条件与错误类型
//! - `dispatch`: 按类型分桶、带通配桶的处理器分发表
//! - `event_bus`: 发布、历史缓冲、广播与分发
//! - `handler`: 总线之上的处理层 (优先级处理器、谓词订阅、处理统计)

pub mod dispatch;
pub mod event_bus;
pub mod handler;
pub mod types;

pub use event_bus::EventBus;
pub use handler::{EventPredicate, EventProcessor, ProcessingStats};
pub use types::*;
