use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::service::ServiceRegistry;

impl ServiceRegistry {
    /// 启动周期性的过期清理任务
    pub fn start_cleanup_task(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        let cleanup_interval = self.config().cleanup_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                tracing::debug!("Executing stale service sweep...");
                match registry.cleanup_stale_services(Utc::now()) {
                    Ok(report) if !report.marked_unhealthy.is_empty() || !report.purged.is_empty() => {
                        tracing::info!(
                            marked_unhealthy = report.marked_unhealthy.len(),
                            purged = report.purged.len(),
                            "Stale service sweep completed"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "Stale service sweep failed"),
                }
            }
            tracing::debug!("Stale service sweep stopped");
        })
    }
}
