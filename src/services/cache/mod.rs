//! 共享 KV 缓存
//!
//! 进程内唯一的共享可变状态，在启动时构造一次并以 `Arc` 注入到各组件:
//! - `types`: 错误类型与缓存条目
//! - `store`: 带 TTL 的存储实现，提供按键原子的读改写

pub mod store;
pub mod types;

pub use store::CacheStore;
pub use types::CacheError;
