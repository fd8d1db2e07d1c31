use chrono::Utc;
use rand::Rng;

use super::types::{LoadBalancerState, LoadBalancingStrategy};
use crate::services::registry::ServiceInstance;

/// 按策略从候选实例中选出一个，返回其下标
///
/// `candidates` 不能为空。
pub fn select<R: Rng + ?Sized>(
    strategy: LoadBalancingStrategy,
    state: &mut LoadBalancerState,
    candidates: &[ServiceInstance],
    failure_threshold: u32,
    rng: &mut R,
) -> usize {
    let index = match strategy {
        LoadBalancingStrategy::RoundRobin => round_robin(state, candidates, failure_threshold),
        LoadBalancingStrategy::Weighted => weighted(state, candidates, rng),
        LoadBalancingStrategy::LeastConnections => {
            least_connections(state, candidates, failure_threshold)
        }
        LoadBalancingStrategy::Random => rng.random_range(0..candidates.len()),
    };

    state
        .last_used
        .insert(candidates[index].id.clone(), Utc::now());
    index
}

fn available(state: &LoadBalancerState, candidates: &[ServiceInstance], threshold: u32) -> Vec<usize> {
    candidates
        .iter()
        .enumerate()
        .filter(|(_, instance)| state.failures(&instance.id) < threshold)
        .map(|(index, _)| index)
        .collect()
}

// 全部熔断时清零计数并回到第一个实例
fn reset_failures(state: &mut LoadBalancerState, candidates: &[ServiceInstance]) -> usize {
    tracing::warn!(
        candidates = candidates.len(),
        "All instances tripped the circuit breaker, resetting failure counts"
    );
    for instance in candidates {
        state.failure_count.insert(instance.id.clone(), 0);
    }
    state.current_index = 0;
    0
}

fn round_robin(state: &mut LoadBalancerState, candidates: &[ServiceInstance], threshold: u32) -> usize {
    let available = available(state, candidates, threshold);
    if available.is_empty() {
        return reset_failures(state, candidates);
    }
    let index = available[state.current_index % available.len()];
    state.current_index = state.current_index.wrapping_add(1);
    index
}

// 选中概率与 1/(失败次数+1) 成正比
fn weighted<R: Rng + ?Sized>(
    state: &LoadBalancerState,
    candidates: &[ServiceInstance],
    rng: &mut R,
) -> usize {
    let weights: Vec<f64> = candidates
        .iter()
        .map(|instance| 1.0 / (f64::from(state.failures(&instance.id)) + 1.0))
        .collect();
    let total: f64 = weights.iter().sum();

    let mut point = rng.random::<f64>() * total;
    for (index, weight) in weights.iter().enumerate() {
        if point < *weight {
            return index;
        }
        point -= weight;
    }
    candidates.len() - 1
}

fn least_connections(
    state: &mut LoadBalancerState,
    candidates: &[ServiceInstance],
    threshold: u32,
) -> usize {
    let mut pool = available(state, candidates, threshold);
    if pool.is_empty() {
        pool = (0..candidates.len()).collect();
    }

    let index = pool
        .into_iter()
        .min_by_key(|&index| state.connections(&candidates[index].id))
        .unwrap_or(0);
    *state
        .connections
        .entry(candidates[index].id.clone())
        .or_insert(0) += 1;
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::registry::{ServiceStatus, ServiceType};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::{BTreeSet, HashMap};

    fn instances(ids: &[&str]) -> Vec<ServiceInstance> {
        ids.iter()
            .map(|id| ServiceInstance {
                id: id.to_string(),
                name: "pricing".into(),
                version: "1.0.0".into(),
                host: "localhost".into(),
                port: 8080,
                service_type: ServiceType::Api,
                status: ServiceStatus::Healthy,
                health_endpoint: "/health".into(),
                tags: BTreeSet::new(),
                metadata: HashMap::new(),
                dependencies: BTreeSet::new(),
                weight: 100,
                environment: "test".into(),
                registered_at: Utc::now(),
                last_heartbeat: Utc::now(),
                health_check_count: 0,
                consecutive_failures: 0,
            })
            .collect()
    }

    #[test]
    fn test_round_robin_skips_tripped_instances() {
        let candidates = instances(&["a", "b", "c"]);
        let mut state = LoadBalancerState::default();
        state.failure_count.insert("a".into(), 3);
        let mut rng = StdRng::seed_from_u64(7);

        let picks: Vec<&str> = (0..6)
            .map(|_| {
                let i = select(LoadBalancingStrategy::RoundRobin, &mut state, &candidates, 3, &mut rng);
                candidates[i].id.as_str()
            })
            .collect();
        assert_eq!(picks, vec!["b", "c", "b", "c", "b", "c"]);
    }

    #[test]
    fn test_round_robin_resets_when_all_tripped() {
        let candidates = instances(&["a", "b", "c"]);
        let mut state = LoadBalancerState::default();
        for id in ["a", "b", "c"] {
            state.failure_count.insert(id.into(), 5);
        }
        let mut rng = StdRng::seed_from_u64(7);

        let index = select(LoadBalancingStrategy::RoundRobin, &mut state, &candidates, 3, &mut rng);
        assert_eq!(index, 0);
        assert!(candidates.iter().all(|c| state.failures(&c.id) == 0));
    }

    #[test]
    fn test_weighted_prefers_instances_without_failures() {
        let candidates = instances(&["a", "b"]);
        let mut state = LoadBalancerState::default();
        state.failure_count.insert("a".into(), 3);
        let mut rng = StdRng::seed_from_u64(42);

        let mut picks_a = 0;
        for _ in 0..10_000 {
            if select(LoadBalancingStrategy::Weighted, &mut state, &candidates, 3, &mut rng) == 0 {
                picks_a += 1;
            }
        }
        // 期望 0.25/1.25 = 20%
        assert!((1_700..2_300).contains(&picks_a), "picks_a = {picks_a}");
    }

    #[test]
    fn test_least_connections_tracks_in_flight() {
        let candidates = instances(&["a", "b"]);
        let mut state = LoadBalancerState::default();
        let mut rng = StdRng::seed_from_u64(1);

        let first = select(LoadBalancingStrategy::LeastConnections, &mut state, &candidates, 3, &mut rng);
        let second = select(LoadBalancingStrategy::LeastConnections, &mut state, &candidates, 3, &mut rng);
        assert_ne!(first, second);

        state.record_success(&candidates[first].id);
        let third = select(LoadBalancingStrategy::LeastConnections, &mut state, &candidates, 3, &mut rng);
        assert_eq!(third, first);
        assert_eq!(state.connections(&candidates[first].id), 1);
        assert_eq!(state.connections(&candidates[second].id), 1);
    }

    #[test]
    fn test_failure_does_not_release_connection() {
        let mut state = LoadBalancerState::default();
        state.connections.insert("a".into(), 2);

        state.record_failure("a");
        assert_eq!(state.connections("a"), 2);
        assert_eq!(state.failures("a"), 1);

        state.record_success("a");
        assert_eq!(state.connections("a"), 1);
        assert_eq!(state.failures("a"), 0);
    }
}
