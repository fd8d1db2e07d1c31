pub mod balancer;
pub mod service;
pub mod types;

pub use service::ServiceDiscovery;
pub use types::{DiscoveryQuery, LoadBalancerState, LoadBalancingStrategy, OutcomeReport};
