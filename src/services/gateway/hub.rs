use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::channels::Channel;
use super::messages::{ClientMessage, GatewayError, ServerMessage, SystemDashboard, SystemStatus};
use crate::services::event::{
    AlertPayload, AlertSeverity, EventType, HealthChangedPayload, MetricsUpdatedPayload,
    SystemEvent,
};
use crate::services::registry::{ServiceRegistry, ServiceStatus};

#[derive(Debug)]
struct ConnectedClient {
    channels: HashSet<Channel>,
    sender: mpsc::UnboundedSender<ServerMessage>,
}

/// 实时网关: 客户端与频道成员关系，以及事件到频道的转发
#[derive(Debug, Clone)]
pub struct RealtimeHub {
    clients: Arc<DashMap<String, ConnectedClient>>,
    registry: ServiceRegistry,
}

impl RealtimeHub {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self {
            clients: Arc::new(DashMap::new()),
            registry,
        }
    }

    /// 新连接: 返回客户端 ID 与推送队列，并立即发送连接确认和系统状态
    pub fn connect(&self) -> (String, mpsc::UnboundedReceiver<ServerMessage>) {
        let client_id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();

        let _ = sender.send(ServerMessage::ConnectionEstablished {
            client_id: client_id.clone(),
            message: "Connected to service registry realtime gateway".to_string(),
            timestamp: Utc::now(),
        });
        let _ = sender.send(ServerMessage::SystemStatus(self.system_status()));

        self.clients.insert(
            client_id.clone(),
            ConnectedClient {
                channels: HashSet::new(),
                sender,
            },
        );
        tracing::debug!(client_id = %client_id, "Realtime client connected");
        (client_id, receiver)
    }

    pub fn disconnect(&self, client_id: &str) {
        if self.clients.remove(client_id).is_some() {
            tracing::debug!(client_id = %client_id, "Realtime client disconnected");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// 处理一条原始文本消息；解析失败时给客户端推送 `error`
    pub fn handle_text(&self, client_id: &str, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => {
                if let Err(e) = self.handle_message(client_id, message) {
                    tracing::debug!(client_id = %client_id, error = %e, "Client message rejected");
                }
            }
            Err(e) => {
                let error = GatewayError::from(e);
                tracing::debug!(client_id = %client_id, error = %error, "Malformed client message");
                self.send_to(
                    client_id,
                    ServerMessage::error("Invalid message", Some(error.to_string())),
                );
            }
        }
    }

    pub fn handle_message(&self, client_id: &str, message: ClientMessage) -> Result<(), GatewayError> {
        let reply = match message {
            ClientMessage::Subscribe { channels } => {
                self.update_channels(client_id, |set| set.extend(channels.iter().copied()))?;
                tracing::debug!(client_id = %client_id, channels = ?channels, "Client subscribed");
                ServerMessage::SubscriptionConfirmed {
                    channels,
                    timestamp: Utc::now(),
                }
            }
            ClientMessage::Unsubscribe { channels } => {
                self.update_channels(client_id, |set| {
                    for channel in &channels {
                        set.remove(channel);
                    }
                })?;
                tracing::debug!(client_id = %client_id, channels = ?channels, "Client unsubscribed");
                ServerMessage::UnsubscriptionConfirmed {
                    channels,
                    timestamp: Utc::now(),
                }
            }
            ClientMessage::GetServiceStatus { service_id } => self.service_status(service_id),
            ClientMessage::GetSystemDashboard => ServerMessage::SystemDashboard(self.dashboard()),
        };

        self.send_to(client_id, reply);
        Ok(())
    }

    fn update_channels(
        &self,
        client_id: &str,
        f: impl FnOnce(&mut HashSet<Channel>),
    ) -> Result<(), GatewayError> {
        let mut client = self
            .clients
            .get_mut(client_id)
            .ok_or_else(|| GatewayError::UnknownClient {
                client_id: client_id.to_string(),
            })?;
        f(&mut client.channels);
        Ok(())
    }

    fn send_to(&self, client_id: &str, message: ServerMessage) {
        let closed = match self.clients.get(client_id) {
            Some(client) => client.sender.send(message).is_err(),
            None => false,
        };
        if closed {
            self.disconnect(client_id);
        }
    }

    /// 推送给频道内所有成员，返回送达数量
    pub fn broadcast(&self, channel: Channel, message: &ServerMessage) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        for client in self.clients.iter() {
            if !client.channels.contains(&channel) {
                continue;
            }
            if client.sender.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(client.key().clone());
            }
        }
        for client_id in closed {
            self.disconnect(&client_id);
        }

        tracing::trace!(channel = %channel, kind = message.kind(), delivered = delivered, "Broadcast to channel");
        delivered
    }

    /// 把总线事件转发到对应频道，并推送派生消息
    pub fn relay_event(&self, event: &SystemEvent) {
        let channel = Channel::for_event(event.event_type);
        self.broadcast(
            channel,
            &ServerMessage::SystemEvent {
                event: event.clone(),
                timestamp: Utc::now(),
            },
        );

        match event.event_type {
            EventType::ServiceHealthChanged => self.on_health_changed(event),
            EventType::SystemAlert => {
                let alert = event.payload::<AlertPayload>();
                self.broadcast(
                    Channel::Alerts,
                    &ServerMessage::Alert {
                        severity: alert.as_ref().map_or(AlertSeverity::Medium, |a| a.severity),
                        title: "System Alert".to_string(),
                        message: alert
                            .as_ref()
                            .map(|a| a.message.clone())
                            .unwrap_or_default(),
                        service: alert.and_then(|a| a.service_id),
                        data: event.data.clone(),
                        timestamp: Utc::now(),
                    },
                );
            }
            EventType::ServiceMetricsUpdated => {
                if let Some(update) = event.payload::<MetricsUpdatedPayload>() {
                    self.broadcast(
                        Channel::Metrics,
                        &ServerMessage::MetricsUpdate {
                            service_id: update.service_id,
                            metrics: update.metrics,
                            timestamp: Utc::now(),
                        },
                    );
                }
            }
            _ => {}
        }
    }

    fn on_health_changed(&self, event: &SystemEvent) {
        let Some(change) = event.payload::<HealthChangedPayload>() else {
            tracing::warn!(event_id = %event.id, "Malformed health change payload");
            return;
        };

        if matches!(
            change.new_status,
            ServiceStatus::Unhealthy | ServiceStatus::Critical
        ) {
            let severity = if change.new_status == ServiceStatus::Critical {
                AlertSeverity::Critical
            } else {
                AlertSeverity::High
            };
            self.broadcast(
                Channel::Alerts,
                &ServerMessage::Alert {
                    severity,
                    title: "Service Health Alert".to_string(),
                    message: format!(
                        "Service {} status changed from {} to {}",
                        change.service_id, change.old_status, change.new_status
                    ),
                    service: Some(change.service_id.clone()),
                    data: event.data.clone(),
                    timestamp: Utc::now(),
                },
            );
        }

        if let Some(service) = self.registry.get_service(&change.service_id) {
            self.broadcast(
                Channel::ServiceUpdates,
                &ServerMessage::ServiceUpdate {
                    service,
                    timestamp: Utc::now(),
                },
            );
        }
    }

    /// 从总线接收事件并转发，直到取消
    pub fn start_relay(
        &self,
        mut receiver: broadcast::Receiver<SystemEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(event) => hub.relay_event(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped = skipped, "Realtime relay lagged behind event bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            tracing::debug!("Realtime relay stopped");
        })
    }

    pub fn system_status(&self) -> SystemStatus {
        let summary = self.registry.summary();
        SystemStatus {
            total_services: summary.total,
            healthy_services: summary.healthy,
            unhealthy_services: summary.unhealthy,
            critical_services: summary.critical,
            timestamp: Utc::now(),
        }
    }

    pub fn dashboard(&self) -> SystemDashboard {
        let services = self.registry.list_services();
        let count = |status| services.iter().filter(|s| s.status == status).count();
        SystemDashboard {
            total_services: services.len(),
            healthy_services: count(ServiceStatus::Healthy),
            unhealthy_services: count(ServiceStatus::Unhealthy),
            services,
            timestamp: Utc::now(),
        }
    }

    fn service_status(&self, service_id: Option<String>) -> ServerMessage {
        match service_id {
            Some(id) => ServerMessage::ServiceStatus {
                service: self.registry.get_service(&id),
                health: self.registry.get_service_health(&id),
                metrics: self.registry.get_service_metrics(&id),
                timestamp: Utc::now(),
            },
            None => ServerMessage::AllServicesStatus {
                services: self.registry.list_services(),
                timestamp: Utc::now(),
            },
        }
    }
}
