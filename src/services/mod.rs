pub mod cache;
pub mod discovery;
pub mod event;
pub mod gateway;
pub mod health;
pub mod registry;

pub use cache::CacheStore;
pub use discovery::ServiceDiscovery;
pub use event::{EventBus, EventProcessor};
pub use gateway::RealtimeHub;
pub use health::HealthChecker;
pub use registry::ServiceRegistry;
