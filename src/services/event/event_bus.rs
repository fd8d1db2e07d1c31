use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::dispatch::{HandlerTable, RegisteredHandler};
use super::types::{
    AlertPayload, AlertSeverity, BusStatus, EventBusHealth, EventError, EventFilter,
    EventHandlerFn, EventPriority, EventSelector, EventStats, EventType, HandlerId,
    HealthChangedPayload, InventoryLowPayload, PublishEvent, SystemEvent,
};
use crate::config::EventsConfig;
use crate::services::cache::CacheStore;
use crate::services::registry::ServiceStatus;

pub const EVENTS_KEY: &str = "events:history";
const ERROR_WINDOW: chrono::Duration = chrono::Duration::hours(1);
const DEGRADED_ERROR_THRESHOLD: usize = 5;
const UNHEALTHY_ERROR_THRESHOLD: usize = 10;

/// 基于 Tokio broadcast 的事件总线
///
/// 发布顺序: 写入历史 -> 广播到共享通道 -> (HIGH/CRITICAL) 快速通道。
/// 进程内处理器由分发任务从广播通道消费后执行。
#[derive(Debug, Clone)]
pub struct EventBus {
    cache: CacheStore,
    sender: broadcast::Sender<SystemEvent>,
    handlers: Arc<RwLock<HandlerTable>>,
    next_handler_id: Arc<AtomicU64>,
    /// 最近一小时内处理器失败的时间点
    handler_failures: Arc<Mutex<VecDeque<DateTime<Utc>>>>,
    stats: Arc<Mutex<EventStats>>,
    config: EventsConfig,
}

impl EventBus {
    pub fn new(cache: CacheStore, config: EventsConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            cache,
            sender,
            handlers: Arc::new(RwLock::new(HandlerTable::default())),
            next_handler_id: Arc::new(AtomicU64::new(1)),
            handler_failures: Arc::new(Mutex::new(VecDeque::new())),
            stats: Arc::new(Mutex::new(EventStats::default())),
            config,
        }
    }

    /// 发布事件，返回事件 ID
    pub fn publish(&self, draft: PublishEvent) -> Result<String, EventError> {
        self.publish_at_depth(draft, 0)
    }

    fn publish_at_depth(&self, draft: PublishEvent, depth: u8) -> Result<String, EventError> {
        if draft.source.trim().is_empty() {
            return Err(EventError::Invalid("event source must not be empty".into()));
        }

        let event = SystemEvent {
            id: Uuid::new_v4().to_string(),
            event_type: draft.event_type,
            data: draft.data,
            source: draft.source,
            priority: draft.priority.unwrap_or_default(),
            tags: draft.tags,
            targets: draft.targets,
            correlation_id: draft.correlation_id,
            timestamp: Utc::now(),
            ttl: draft.ttl.unwrap_or(self.config.default_event_ttl_secs),
            retry_count: 0,
            processed: false,
        };

        // 历史写入失败不阻止广播
        if let Err(e) = self.store_event(&event) {
            tracing::error!(event_id = %event.id, error = %e, "Failed to store event in history");
        }

        match self.sender.send(event.clone()) {
            Ok(receiver_count) => {
                tracing::debug!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    receiver_count = receiver_count,
                    "Published event"
                );
            }
            Err(_) => {
                tracing::debug!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    "Published event with no active receivers"
                );
            }
        }

        if let Ok(mut stats) = self.stats.lock() {
            stats.events_published += 1;
        }

        if event.priority.is_urgent() {
            self.handle_urgent_event(&event, depth);
        }

        Ok(event.id)
    }

    // 快速通道: 与发布同步执行
    fn handle_urgent_event(&self, event: &SystemEvent, depth: u8) {
        match event.event_type {
            EventType::ServiceHealthChanged => {
                let Some(payload) = event.payload::<HealthChangedPayload>() else {
                    tracing::warn!(event_id = %event.id, "Malformed health change payload");
                    return;
                };
                if !matches!(
                    payload.new_status,
                    ServiceStatus::Unhealthy | ServiceStatus::Critical
                ) {
                    return;
                }
                if depth >= self.config.max_fast_path_depth {
                    tracing::warn!(
                        event_id = %event.id,
                        depth = depth,
                        "Fast path depth limit reached, not raising follow-up alert"
                    );
                    return;
                }

                let alert = AlertPayload {
                    severity: AlertSeverity::High,
                    title: Some("Service Health Alert".to_string()),
                    message: format!("Service {} is {}", payload.service_id, payload.new_status),
                    service_id: Some(payload.service_id.clone()),
                };
                let draft = PublishEvent::new(
                    EventType::SystemAlert,
                    "service-registry",
                    serde_json::to_value(&alert).unwrap_or_default(),
                )
                .with_priority(EventPriority::High)
                .with_tags(["alert", "service-health"])
                .with_correlation_id(event.id.clone());

                if let Err(e) = self.publish_at_depth(draft, depth + 1) {
                    tracing::error!(error = %e, "Failed to raise service health alert");
                }
            }
            EventType::SystemAlert => {
                let message = event
                    .payload::<AlertPayload>()
                    .map(|alert| alert.message)
                    .unwrap_or_else(|| event.data.to_string());
                tracing::warn!(event_id = %event.id, "SYSTEM ALERT: {message}");
            }
            EventType::InventoryLow => match event.payload::<InventoryLowPayload>() {
                Some(p) => tracing::warn!(
                    product = %p.product,
                    current_level = p.current_level,
                    "INVENTORY ALERT: product is low"
                ),
                None => tracing::warn!(event_id = %event.id, "INVENTORY ALERT: {}", event.data),
            },
            other => {
                tracing::debug!(event_type = %other, "High priority event received");
            }
        }
    }

    // 追加到历史缓冲区，超过容量时从最旧的开始淘汰
    fn store_event(&self, event: &SystemEvent) -> Result<(), EventError> {
        let capacity = self.config.history_capacity;
        let ttl = Duration::from_secs(self.config.history_ttl_secs);
        self.cache
            .update(EVENTS_KEY, Some(ttl), |history: &mut VecDeque<SystemEvent>| {
                history.push_back(event.clone());
                while history.len() > capacity {
                    history.pop_front();
                }
            })?;
        Ok(())
    }

    /// 订阅共享通道 (网络订阅者、实时网关)
    pub fn receiver(&self) -> broadcast::Receiver<SystemEvent> {
        self.sender.subscribe()
    }

    pub fn stream(&self) -> BroadcastStream<SystemEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    /// 注册进程内处理器，`EventSelector::Any` 接收所有类型
    pub fn subscribe(&self, selector: impl Into<EventSelector>, handler: EventHandlerFn) -> HandlerId {
        self.subscribe_with_priority(selector, "anonymous", 0, handler)
    }

    pub fn subscribe_with_priority(
        &self,
        selector: impl Into<EventSelector>,
        name: impl Into<String>,
        priority: i32,
        handler: EventHandlerFn,
    ) -> HandlerId {
        let selector = selector.into();
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        let registered = RegisteredHandler {
            id,
            name: name.into(),
            priority,
            handler,
        };

        match self.handlers.write() {
            Ok(mut table) => table.insert(selector, registered),
            Err(poisoned) => poisoned.into_inner().insert(selector, registered),
        }

        tracing::debug!(selector = ?selector, handler_id = id.0, "Subscribed event handler");
        id
    }

    pub fn unsubscribe(&self, id: HandlerId) -> bool {
        let removed = match self.handlers.write() {
            Ok(mut table) => table.remove(id),
            Err(poisoned) => poisoned.into_inner().remove(id),
        };
        if removed {
            tracing::debug!(handler_id = id.0, "Unsubscribed event handler");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().map(|table| table.len()).unwrap_or(0)
    }

    /// 启动分发任务: 从共享通道消费并执行进程内处理器
    pub fn start_dispatcher(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut receiver = self.sender.subscribe();
        let bus = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(event) => {
                            bus.dispatch(event).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped = skipped, "Event dispatcher lagged behind channel");
                            bus.settle_skipped(skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            tracing::debug!("Event dispatcher stopped");
        })
    }

    /// 执行所有匹配的处理器，返回失败数量
    ///
    /// 每个处理器单独 spawn，单个失败或 panic 不影响其他处理器，事件最终都会标记为已处理。
    pub async fn dispatch(&self, event: SystemEvent) -> usize {
        let handlers = self
            .handlers
            .read()
            .map(|table| table.handlers_for(event.event_type))
            .unwrap_or_default();

        let tasks = handlers.into_iter().map(|registered| {
            let event = event.clone();
            let name = registered.name.clone();
            let task = tokio::spawn(async move { (registered.handler)(event).await });
            async move { (name, task.await) }
        });

        let mut failures = 0;
        let mut delivered = 0;
        for (name, outcome) in join_all(tasks).await {
            delivered += 1;
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(join_error) => format!("handler panicked: {join_error}"),
            };
            failures += 1;
            tracing::error!(
                handler = %name,
                event_type = %event.event_type,
                event_id = %event.id,
                error = %error,
                "Event handler error"
            );
        }

        if failures > 0 {
            self.record_handler_failures(failures);
        }
        if let Ok(mut stats) = self.stats.lock() {
            stats.events_delivered += delivered as u64;
            stats.delivery_failures += failures as u64;
        }

        self.mark_processed(&event.id);
        failures
    }

    fn record_handler_failures(&self, count: usize) {
        let now = Utc::now();
        if let Ok(mut failures) = self.handler_failures.lock() {
            failures.extend(std::iter::repeat_n(now, count));
            while failures.front().is_some_and(|t| now - *t > ERROR_WINDOW) {
                failures.pop_front();
            }
        }
    }

    // 通道溢出时被跳过的事件不会再被分发，按最旧的未处理事件结清
    fn settle_skipped(&self, skipped: u64) {
        let result = self.cache.update(
            EVENTS_KEY,
            Some(Duration::from_secs(self.config.history_ttl_secs)),
            |history: &mut VecDeque<SystemEvent>| {
                history
                    .iter_mut()
                    .filter(|e| !e.processed)
                    .take(usize::try_from(skipped).unwrap_or(usize::MAX))
                    .for_each(|e| e.processed = true);
            },
        );
        if let Err(e) = result {
            tracing::error!(skipped = skipped, error = %e, "Failed to settle skipped events");
        }
        if let Ok(mut stats) = self.stats.lock() {
            stats.events_skipped += skipped;
        }
    }

    fn mark_processed(&self, event_id: &str) {
        let result = self.cache.update(
            EVENTS_KEY,
            Some(Duration::from_secs(self.config.history_ttl_secs)),
            |history: &mut VecDeque<SystemEvent>| {
                // 刚处理的事件通常在尾部
                if let Some(event) = history.iter_mut().rev().find(|e| e.id == event_id) {
                    event.processed = true;
                }
            },
        );
        if let Err(e) = result {
            tracing::error!(event_id = %event_id, error = %e, "Failed to mark event as processed");
        }
    }

    // 读取历史，缓存不可用时返回空
    fn with_history<R: Default>(&self, f: impl FnOnce(&VecDeque<SystemEvent>) -> R) -> R {
        match self.cache.read(EVENTS_KEY, f) {
            Ok(Some(result)) => result,
            Ok(None) => R::default(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to read event history");
                R::default()
            }
        }
    }

    /// 过滤 -> 按时间倒序 -> 分页
    pub fn history(&self, limit: usize, offset: usize, filter: &EventFilter) -> Vec<SystemEvent> {
        let mut events: Vec<SystemEvent> = self.with_history(|history| {
            history
                .iter()
                .rev()
                .filter(|event| filter.matches(event))
                .cloned()
                .collect()
        });
        // 稳定排序，时间相同的保留后写入者在前
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.into_iter().skip(offset).take(limit).collect()
    }

    pub fn get_event(&self, event_id: &str) -> Option<SystemEvent> {
        self.with_history(|history| history.iter().find(|e| e.id == event_id).cloned())
    }

    /// 以历史事件为模板重新发布，新事件带 `originalEventId` / `replayedAt`
    pub fn replay(&self, event_id: &str) -> Result<String, EventError> {
        let original = self.get_event(event_id).ok_or_else(|| EventError::NotFound {
            event_id: event_id.to_string(),
        })?;

        let replayed_at = Utc::now();
        let data = match original.data {
            serde_json::Value::Object(mut fields) => {
                fields.insert("originalEventId".into(), original.id.clone().into());
                fields.insert("replayedAt".into(), replayed_at.to_rfc3339().into());
                serde_json::Value::Object(fields)
            }
            other => serde_json::json!({
                "payload": other,
                "originalEventId": original.id,
                "replayedAt": replayed_at.to_rfc3339(),
            }),
        };

        let mut tags = original.tags;
        if !tags.iter().any(|t| t == "replayed") {
            tags.push("replayed".to_string());
        }

        let draft = PublishEvent {
            event_type: original.event_type,
            data,
            source: original.source,
            priority: Some(original.priority),
            tags,
            targets: original.targets,
            correlation_id: Some(original.correlation_id.unwrap_or(original.id)),
            ttl: Some(original.ttl),
        };
        let new_id = self.publish(draft)?;
        tracing::info!(original_event_id = %event_id, event_id = %new_id, "Replayed event");
        Ok(new_id)
    }

    pub fn count(&self, filter: &EventFilter) -> usize {
        self.with_history(|history| history.iter().filter(|e| filter.matches(e)).count())
    }

    /// 每种事件类型的数量 (包括 0)
    pub fn count_by_type(&self) -> BTreeMap<EventType, usize> {
        let mut counts: BTreeMap<EventType, usize> =
            EventType::ALL.into_iter().map(|t| (t, 0)).collect();
        self.with_history(|history| {
            for event in history {
                *counts.entry(event.event_type).or_default() += 1;
            }
        });
        counts
    }

    pub fn count_by_priority(&self) -> BTreeMap<EventPriority, usize> {
        let mut counts: BTreeMap<EventPriority, usize> =
            EventPriority::ALL.into_iter().map(|p| (p, 0)).collect();
        self.with_history(|history| {
            for event in history {
                *counts.entry(event.priority).or_default() += 1;
            }
        });
        counts
    }

    pub fn count_by_source(&self) -> HashMap<String, usize> {
        self.with_history(|history| {
            let mut counts = HashMap::new();
            for event in history {
                *counts.entry(event.source.clone()).or_default() += 1;
            }
            counts
        })
    }

    /// 清空历史；给定 `older_than` 时只删除严格早于该时间的事件
    pub fn clear_history(&self, older_than: Option<DateTime<Utc>>) -> Result<usize, EventError> {
        let ttl = Duration::from_secs(self.config.history_ttl_secs);
        let removed = self
            .cache
            .update(EVENTS_KEY, Some(ttl), |history: &mut VecDeque<SystemEvent>| {
                let before = history.len();
                match older_than {
                    Some(cutoff) => history.retain(|e| e.timestamp >= cutoff),
                    None => history.clear(),
                }
                before - history.len()
            })?;

        tracing::info!(removed = removed, older_than = ?older_than, "Cleared event history");
        Ok(removed)
    }

    pub fn health(&self) -> EventBusHealth {
        let now = Utc::now();
        let since = now - ERROR_WINDOW;

        let (system_errors, queue_size, last_event_processed) = self.with_history(|history| {
            let errors = history
                .iter()
                .filter(|e| e.event_type == EventType::SystemError && e.timestamp > since)
                .count();
            let pending = history.iter().filter(|e| !e.processed).count();
            let last = history
                .iter()
                .filter(|e| e.processed)
                .map(|e| e.timestamp)
                .max();
            (errors, pending, last)
        });

        let handler_errors = self
            .handler_failures
            .lock()
            .map(|failures| failures.iter().filter(|t| **t > since).count())
            .unwrap_or(0);
        let processing_errors = system_errors + handler_errors;

        let status = if processing_errors > UNHEALTHY_ERROR_THRESHOLD {
            BusStatus::Unhealthy
        } else if processing_errors > DEGRADED_ERROR_THRESHOLD {
            BusStatus::Degraded
        } else {
            BusStatus::Healthy
        };

        EventBusHealth {
            status,
            queue_size,
            processing_errors,
            last_event_processed,
            subscribers: self.subscriber_count(),
        }
    }

    /// 获取事件统计信息
    pub fn get_stats(&self) -> EventStats {
        let base_stats = self
            .stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default();

        EventStats {
            channel_receivers: self.sender.receiver_count(),
            ..base_stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event::types::{HandlerError, handler_fn};
    use std::sync::atomic::AtomicUsize;

    fn bus() -> EventBus {
        EventBus::new(CacheStore::new(), EventsConfig::default())
    }

    fn draft(event_type: EventType, source: &str) -> PublishEvent {
        PublishEvent::new(event_type, source, serde_json::json!({}))
    }

    #[tokio::test]
    async fn test_publish_assigns_defaults() {
        let bus = bus();
        let id = bus
            .publish(draft(EventType::PriceUpdated, "pricing"))
            .unwrap();

        let event = bus.get_event(&id).unwrap();
        assert_eq!(event.priority, EventPriority::Normal);
        assert_eq!(event.ttl, 3600);
        assert_eq!(event.retry_count, 0);
        assert!(!event.processed);
    }

    #[tokio::test]
    async fn test_empty_source_rejected() {
        let bus = bus();
        assert!(matches!(
            bus.publish(draft(EventType::PriceUpdated, " ")),
            Err(EventError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_history_capacity_evicts_oldest() {
        let config = EventsConfig {
            history_capacity: 3,
            ..Default::default()
        };
        let bus = EventBus::new(CacheStore::new(), config);
        let ids: Vec<String> = (0..5)
            .map(|_| bus.publish(draft(EventType::PriceUpdated, "p")).unwrap())
            .collect();

        let kept: Vec<String> = bus
            .history(usize::MAX, 0, &EventFilter::default())
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(kept.len(), 3);
        assert!(!kept.contains(&ids[0]));
        assert!(!kept.contains(&ids[1]));
        assert_eq!(kept[0], ids[4]);
    }

    #[tokio::test]
    async fn test_urgent_health_change_raises_alert() {
        let bus = bus();
        let payload = HealthChangedPayload {
            service_id: "svc-1".into(),
            service_name: "svc".into(),
            old_status: ServiceStatus::Healthy,
            new_status: ServiceStatus::Unhealthy,
            response_time: 12,
            error: None,
        };
        bus.publish(
            PublishEvent::new(
                EventType::ServiceHealthChanged,
                "health-check-service",
                serde_json::to_value(&payload).unwrap(),
            )
            .with_priority(EventPriority::High),
        )
        .unwrap();

        let alerts = bus.history(
            10,
            0,
            &EventFilter {
                event_type: Some(EventType::SystemAlert),
                ..Default::default()
            },
        );
        assert_eq!(alerts.len(), 1);
        let alert: AlertPayload = alerts[0].payload().unwrap();
        assert_eq!(alert.service_id.as_deref(), Some("svc-1"));
    }

    #[tokio::test]
    async fn test_fast_path_depth_guard() {
        let config = EventsConfig {
            max_fast_path_depth: 0,
            ..Default::default()
        };
        let bus = EventBus::new(CacheStore::new(), config);
        let payload = serde_json::json!({
            "serviceId": "svc-1",
            "serviceName": "svc",
            "oldStatus": "healthy",
            "newStatus": "critical",
            "responseTime": 1
        });
        bus.publish(
            PublishEvent::new(EventType::ServiceHealthChanged, "t", payload)
                .with_priority(EventPriority::Critical),
        )
        .unwrap();

        assert_eq!(bus.count(&EventFilter::default()), 1);
    }

    #[tokio::test]
    async fn test_dispatch_isolates_failing_handlers() {
        let bus = bus();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        bus.subscribe(
            EventType::PriceUpdated,
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        bus.subscribe(
            EventType::PriceUpdated,
            handler_fn(|_| async { Err(HandlerError::new("boom")) }),
        );
        bus.subscribe(
            EventSelector::Any,
            handler_fn(|event: SystemEvent| async move {
                assert!(event.id.is_empty(), "handler panic");
                Ok(())
            }),
        );
        let counter = calls.clone();
        bus.subscribe(
            EventSelector::Any,
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let id = bus.publish(draft(EventType::PriceUpdated, "p")).unwrap();
        let event = bus.get_event(&id).unwrap();
        let failures = bus.dispatch(event).await;

        assert_eq!(failures, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(bus.get_event(&id).unwrap().processed);
        assert_eq!(bus.health().processing_errors, 2);
        assert_eq!(bus.health().queue_size, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = bus();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = bus.subscribe(
            EventSelector::Any,
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );
        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.unsubscribe(id));

        let event_id = bus.publish(draft(EventType::PriceUpdated, "p")).unwrap();
        bus.dispatch(bus.get_event(&event_id).unwrap()).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_health_thresholds() {
        let bus = bus();
        assert_eq!(bus.health().status, BusStatus::Healthy);

        for _ in 0..6 {
            bus.publish(draft(EventType::SystemError, "worker")).unwrap();
        }
        assert_eq!(bus.health().status, BusStatus::Degraded);

        for _ in 0..5 {
            bus.publish(draft(EventType::SystemError, "worker")).unwrap();
        }
        let health = bus.health();
        assert_eq!(health.status, BusStatus::Unhealthy);
        assert_eq!(health.processing_errors, 11);
        assert_eq!(health.queue_size, 11);
    }

    #[tokio::test]
    async fn test_lagged_dispatcher_settles_skipped_events() {
        let config = EventsConfig {
            channel_capacity: 4,
            ..EventsConfig::default()
        };
        let bus = EventBus::new(CacheStore::new(), config);
        let cancel = CancellationToken::new();
        let dispatcher = bus.start_dispatcher(cancel.clone());

        // 分发任务尚未运行，通道溢出
        for _ in 0..10 {
            bus.publish(draft(EventType::PriceUpdated, "pricing")).unwrap();
        }
        assert_eq!(bus.health().queue_size, 10);

        tokio::time::timeout(Duration::from_secs(2), async {
            while bus.health().queue_size > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Skipped events were never settled");
        assert_eq!(bus.get_stats().events_skipped, 6);

        cancel.cancel();
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_history_with_cutoff() {
        let bus = bus();
        bus.publish(draft(EventType::PriceUpdated, "p")).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let cutoff = Utc::now();
        let kept = bus.publish(draft(EventType::PriceUpdated, "p")).unwrap();

        assert_eq!(bus.clear_history(Some(cutoff)).unwrap(), 1);
        let remaining = bus.history(usize::MAX, 0, &EventFilter::default());
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, kept);

        bus.clear_history(None).unwrap();
        assert_eq!(bus.count(&EventFilter::default()), 0);
    }

    #[tokio::test]
    async fn test_replay_links_original() {
        let bus = bus();
        let original = bus
            .publish(
                PublishEvent::new(
                    EventType::PriceUpdated,
                    "pricing",
                    serde_json::json!({ "product": "diesel" }),
                )
                .with_tags(["price"]),
            )
            .unwrap();

        let replayed = bus.replay(&original).unwrap();
        assert_ne!(replayed, original);

        let event = bus.get_event(&replayed).unwrap();
        assert_eq!(event.data["originalEventId"], original.as_str());
        assert_eq!(event.data["product"], "diesel");
        assert!(event.data.get("replayedAt").is_some());
        assert_eq!(event.tags, vec!["price", "replayed"]);
        assert_eq!(event.correlation_id.as_deref(), Some(original.as_str()));

        assert!(matches!(
            bus.replay("missing"),
            Err(EventError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_count_views() {
        let bus = bus();
        bus.publish(draft(EventType::PriceUpdated, "pricing")).unwrap();
        bus.publish(draft(EventType::PriceUpdated, "pricing")).unwrap();
        bus.publish(draft(EventType::TransactionCreated, "ledger").with_priority(EventPriority::Low))
            .unwrap();

        let by_type = bus.count_by_type();
        assert_eq!(by_type.len(), EventType::ALL.len());
        assert_eq!(by_type[&EventType::PriceUpdated], 2);
        assert_eq!(by_type[&EventType::SystemAlert], 0);

        let by_priority = bus.count_by_priority();
        assert_eq!(by_priority[&EventPriority::Normal], 2);
        assert_eq!(by_priority[&EventPriority::Low], 1);

        let by_source = bus.count_by_source();
        assert_eq!(by_source["pricing"], 2);
        assert_eq!(by_source["ledger"], 1);
    }
}
