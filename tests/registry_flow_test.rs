use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use service_mesh_registry::config::Config;
use service_mesh_registry::services::discovery::DiscoveryQuery;
use service_mesh_registry::services::event::{EventFilter, EventType};
use service_mesh_registry::services::health::HealthProbe;
use service_mesh_registry::services::registry::{
    RegisterServiceDescriptor, ServiceHealth, ServiceInstance, ServiceStatus, ServiceType,
};
use service_mesh_registry::services::{
    CacheStore, EventBus, HealthChecker, ServiceDiscovery, ServiceRegistry,
};

/// 按 ID 控制结果的探测器
#[derive(Default)]
struct ScriptedProbe {
    down: Mutex<HashSet<String>>,
}

impl ScriptedProbe {
    fn take_down(&self, service_id: &str) {
        self.down.lock().unwrap().insert(service_id.to_string());
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, instance: &ServiceInstance) -> ServiceHealth {
        let down = self.down.lock().unwrap().contains(&instance.id);
        ServiceHealth {
            service_id: instance.id.clone(),
            status: if down {
                ServiceStatus::Unhealthy
            } else {
                ServiceStatus::Healthy
            },
            timestamp: Utc::now(),
            response_time: 4,
            error: down.then(|| "connection refused".to_string()),
            details: None,
        }
    }
}

struct Mesh {
    events: EventBus,
    registry: ServiceRegistry,
    discovery: ServiceDiscovery,
    checker: HealthChecker,
    probe: Arc<ScriptedProbe>,
}

fn mesh() -> Mesh {
    let mut config = Config::default();
    // 每次发现都直接读注册表
    config.discovery.cache_ttl_secs = 0;

    let cache = CacheStore::new();
    let events = EventBus::new(cache.clone(), config.events.clone());
    let registry = ServiceRegistry::new(cache.clone(), events.clone(), config.registry.clone());
    let discovery = ServiceDiscovery::new(registry.clone(), cache.clone(), config.discovery.clone());
    let probe = Arc::new(ScriptedProbe::default());
    let checker = HealthChecker::with_probe(
        registry.clone(),
        events.clone(),
        cache,
        config.health.clone(),
        probe.clone(),
    )
    .unwrap();

    Mesh {
        events,
        registry,
        discovery,
        checker,
        probe,
    }
}

fn pricing(port: u16) -> RegisterServiceDescriptor {
    let mut descriptor =
        RegisterServiceDescriptor::new("pricing-service", "2.1.0", "10.0.1.7", port, ServiceType::Api);
    descriptor.tags = vec!["pricing".to_string()];
    descriptor
}

fn pick_counts(mesh: &Mesh, rounds: usize) -> HashMap<String, usize> {
    let query = DiscoveryQuery::default();
    let mut counts = HashMap::new();
    for _ in 0..rounds {
        let picked = mesh
            .discovery
            .discover_one("pricing-service", &query)
            .expect("a healthy instance");
        *counts.entry(picked.id).or_default() += 1;
    }
    counts
}

fn count_events(events: &EventBus, event_type: EventType) -> usize {
    events.count(&EventFilter {
        event_type: Some(event_type),
        ..Default::default()
    })
}

#[tokio::test]
async fn test_register_probe_discover_deregister() {
    let mesh = mesh();
    let a = mesh.registry.register(pricing(8001)).unwrap();
    let b = mesh.registry.register(pricing(8002)).unwrap();
    mesh.registry
        .register(RegisterServiceDescriptor::new(
            "ledger",
            "1.0.0",
            "10.0.1.9",
            9000,
            ServiceType::Worker,
        ))
        .unwrap();
    assert_eq!(count_events(&mesh.events, EventType::ServiceRegistered), 3);

    // 新注册的实例处于 starting，不参与发现
    assert!(
        mesh.discovery
            .discover_all("pricing-service", &DiscoveryQuery::default())
            .is_empty()
    );

    let results = mesh.checker.check_all_services().await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.status_changed));
    assert_eq!(count_events(&mesh.events, EventType::ServiceHealthChanged), 3);

    // 两个健康实例轮询分摊
    let counts = pick_counts(&mesh, 4);
    assert_eq!(counts.get(&a.id), Some(&2));
    assert_eq!(counts.get(&b.id), Some(&2));

    // 连续 3 次失败后 a 被熔断
    for _ in 0..3 {
        assert!(mesh.discovery.report_outcome(&a.id, false, Some(5000)));
    }
    let counts = pick_counts(&mesh, 4);
    assert_eq!(counts.get(&b.id), Some(&4));
    assert!(!counts.contains_key(&a.id));

    // 探测失败使 a 变为 unhealthy 并触发告警
    mesh.probe.take_down(&a.id);
    let result = mesh.checker.check_service_by_id(&a.id).await.unwrap();
    assert!(result.status_changed);
    assert_eq!(result.previous_status, ServiceStatus::Healthy);
    assert_eq!(
        mesh.registry.get_service(&a.id).unwrap().consecutive_failures,
        1
    );
    assert_eq!(count_events(&mesh.events, EventType::SystemAlert), 1);

    let healthy = mesh
        .discovery
        .discover_all("pricing-service", &DiscoveryQuery::default());
    assert_eq!(healthy.len(), 1);
    assert_eq!(healthy[0].id, b.id);

    // 注销后立即从发现中消失，宽限期内仍可查询
    assert!(mesh.registry.deregister(&b.id).unwrap());
    assert!(!mesh.registry.deregister(&b.id).unwrap());
    assert_eq!(
        mesh.registry.get_service(&b.id).unwrap().status,
        ServiceStatus::Shutdown
    );
    assert!(
        mesh.discovery
            .discover_one("pricing-service", &DiscoveryQuery::default())
            .is_none()
    );
    assert_eq!(count_events(&mesh.events, EventType::ServiceDeregistered), 1);

    let summary = mesh.registry.summary();
    assert_eq!(summary.total, 3);
    assert_eq!(summary.healthy, 1);
    assert_eq!(summary.unhealthy, 1);
    assert_eq!(summary.shutdown, 1);

    mesh.registry.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_recovers_unhealthy_instance() {
    let mesh = mesh();
    let a = mesh.registry.register(pricing(8001)).unwrap();
    mesh.probe.take_down(&a.id);
    mesh.checker.check_all_services().await;
    assert_eq!(
        mesh.registry.get_service(&a.id).unwrap().status,
        ServiceStatus::Unhealthy
    );

    assert!(mesh.registry.heartbeat(&a.id).unwrap());
    let instance = mesh.registry.get_service(&a.id).unwrap();
    assert_eq!(instance.status, ServiceStatus::Healthy);
    assert!(
        mesh.discovery
            .discover_one("pricing-service", &DiscoveryQuery::default())
            .is_some()
    );

    assert!(!mesh.registry.heartbeat("unknown").unwrap());
}

#[tokio::test]
async fn test_shutdown_instances_are_not_probed() {
    let mesh = mesh();
    let a = mesh.registry.register(pricing(8001)).unwrap();
    mesh.registry.deregister(&a.id).unwrap();

    let results = mesh.checker.check_all_services().await;
    assert!(results.is_empty());
    assert_eq!(
        mesh.registry.get_service(&a.id).unwrap().status,
        ServiceStatus::Shutdown
    );

    mesh.registry.shutdown().await;
}
