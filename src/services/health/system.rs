use std::sync::{Arc, Mutex};
use std::time::Instant;

use sysinfo::{Disks, Networks, System};

use super::types::{CpuMetrics, HostMetrics, NetworkMetrics, UsageMetrics};

/// 本机资源采样器，保存上一次的网络计数用于计算速率
#[derive(Debug, Clone, Default)]
pub struct HostSampler {
    last_network: Arc<Mutex<Option<NetworkCounter>>>,
}

#[derive(Debug, Clone, Copy)]
struct NetworkCounter {
    rx_bytes: u64,
    tx_bytes: u64,
    at: Instant,
}

impl HostSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 阻塞采样 (CPU 需要间隔两次刷新)，在 `spawn_blocking` 中调用
    pub fn sample(&self) -> HostMetrics {
        let mut system = System::new_all();
        system.refresh_cpu();
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
        system.refresh_cpu();
        system.refresh_memory();

        let cpu = CpuMetrics {
            usage: f64::from(system.global_cpu_info().cpu_usage()).round(),
        };
        let memory = UsageMetrics::new(system.used_memory(), system.total_memory());

        let disks = Disks::new_with_refreshed_list();
        let (disk_total, disk_available) = disks
            .list()
            .iter()
            .fold((0u64, 0u64), |(total, available), disk| {
                (total + disk.total_space(), available + disk.available_space())
            });
        let disk = UsageMetrics::new(disk_total.saturating_sub(disk_available), disk_total);

        let networks = Networks::new_with_refreshed_list();
        let (rx_bytes, tx_bytes) = networks
            .iter()
            .fold((0u64, 0u64), |(rx, tx), (_, data)| {
                (rx + data.total_received(), tx + data.total_transmitted())
            });
        let network = self.network_rates(rx_bytes, tx_bytes, Instant::now());

        HostMetrics {
            cpu,
            memory,
            disk,
            network,
        }
    }

    fn network_rates(&self, rx_bytes: u64, tx_bytes: u64, now: Instant) -> NetworkMetrics {
        let current = NetworkCounter {
            rx_bytes,
            tx_bytes,
            at: now,
        };
        let previous = match self.last_network.lock() {
            Ok(mut last) => last.replace(current),
            Err(poisoned) => poisoned.into_inner().replace(current),
        };

        let (rx_sec, tx_sec) = match previous {
            Some(prev) => {
                let secs = now.duration_since(prev.at).as_secs_f64();
                if secs > 0.0 {
                    (
                        rx_bytes.saturating_sub(prev.rx_bytes) as f64 / secs,
                        tx_bytes.saturating_sub(prev.tx_bytes) as f64 / secs,
                    )
                } else {
                    (0.0, 0.0)
                }
            }
            None => (0.0, 0.0),
        };

        NetworkMetrics {
            rx_bytes,
            tx_bytes,
            rx_sec,
            tx_sec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_network_rates_from_previous_sample() {
        let sampler = HostSampler::new();
        let start = Instant::now();

        let first = sampler.network_rates(1_000, 500, start);
        assert_eq!(first.rx_sec, 0.0);

        let second = sampler.network_rates(3_000, 1_500, start + Duration::from_secs(2));
        assert_eq!(second.rx_sec, 1_000.0);
        assert_eq!(second.tx_sec, 500.0);
    }

    #[test]
    fn test_usage_percentage() {
        assert_eq!(UsageMetrics::new(50, 200).percentage, 25.0);
        assert_eq!(UsageMetrics::new(0, 0).percentage, 0.0);
    }
}
