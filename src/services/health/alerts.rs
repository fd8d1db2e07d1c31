use super::types::{DependencyStatus, SystemHealthMetrics};
use crate::services::event::{AlertPayload, AlertSeverity};

fn alert(severity: AlertSeverity, title: impl Into<String>, message: impl Into<String>) -> AlertPayload {
    AlertPayload {
        severity,
        title: Some(title.into()),
        message: message.into(),
        service_id: None,
    }
}

/// 根据一次系统快照计算需要发出的告警
pub fn evaluate_alerts(metrics: &SystemHealthMetrics) -> Vec<AlertPayload> {
    let mut alerts = Vec::new();

    let cpu = metrics.cpu.usage;
    if cpu > 90.0 {
        alerts.push(alert(AlertSeverity::Critical, "High CPU Usage", format!("CPU usage is at {cpu}%")));
    } else if cpu > 75.0 {
        alerts.push(alert(AlertSeverity::High, "Elevated CPU Usage", format!("CPU usage is at {cpu}%")));
    }

    let memory = metrics.memory.percentage;
    if memory > 90.0 {
        alerts.push(alert(AlertSeverity::Critical, "High Memory Usage", format!("Memory usage is at {memory}%")));
    } else if memory > 80.0 {
        alerts.push(alert(AlertSeverity::High, "Elevated Memory Usage", format!("Memory usage is at {memory}%")));
    }

    let disk = metrics.disk.percentage;
    if disk > 95.0 {
        alerts.push(alert(AlertSeverity::Critical, "Disk Space Critical", format!("Disk usage is at {disk}%")));
    } else if disk > 85.0 {
        alerts.push(alert(AlertSeverity::High, "Low Disk Space", format!("Disk usage is at {disk}%")));
    }

    if metrics.services.critical > 0 {
        alerts.push(alert(
            AlertSeverity::Critical,
            "Critical Services Down",
            format!("{} services are in critical state", metrics.services.critical),
        ));
    }
    if metrics.services.unhealthy > 0 {
        alerts.push(alert(
            AlertSeverity::High,
            "Unhealthy Services",
            format!("{} services are unhealthy", metrics.services.unhealthy),
        ));
    }

    let dependencies = metrics.database.iter().chain(metrics.external.iter());
    for (name, health) in dependencies {
        if health.status == DependencyStatus::Unhealthy {
            alerts.push(alert(
                AlertSeverity::Critical,
                format!("Dependency {} Down", name.to_uppercase()),
                format!(
                    "{name} is unhealthy: {}",
                    health.error.as_deref().unwrap_or("unknown error")
                ),
            ));
        }
    }

    alerts
}
