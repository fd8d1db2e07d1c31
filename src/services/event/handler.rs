use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use uuid::Uuid;

use super::dispatch::{HandlerTable, RegisteredHandler};
use super::event_bus::EventBus;
use super::types::{
    AlertPayload, EventHandlerFn, EventSelector, EventType, HandlerId, HandlerResult,
    HealthChangedPayload, SystemEvent, handler_fn,
};

const LATENCY_WINDOW: usize = 1000;

/// 订阅过滤谓词
pub type EventPredicate = Arc<dyn Fn(&SystemEvent) -> bool + Send + Sync>;

// 临时订阅
#[derive(Clone)]
struct Subscription {
    event_types: Vec<EventType>,
    filter: Option<EventPredicate>,
    handler: EventHandlerFn,
    created_at: DateTime<Utc>,
}

impl Subscription {
    fn accepts(&self, event: &SystemEvent) -> bool {
        (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
            && self.filter.as_ref().is_none_or(|filter| filter(event))
    }
}

#[derive(Debug, Default)]
struct ProcessingState {
    total_processed: u64,
    successful: u64,
    failed: u64,
    by_type: HashMap<EventType, u64>,
    recent_latencies: VecDeque<Duration>,
    last_processed_at: Option<DateTime<Utc>>,
}

/// 累计处理统计
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    pub total_processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub by_type: HashMap<EventType, u64>,
    /// 最近 1000 个事件的平均处理耗时
    pub average_processing_ms: f64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub handlers: usize,
    pub subscriptions: usize,
}

/// 总线之上的事件处理层
///
/// 持有按优先级排序的内置处理器，以及带可选谓词的临时订阅。
#[derive(Clone)]
pub struct EventProcessor {
    handlers: Arc<RwLock<HandlerTable>>,
    subscriptions: Arc<DashMap<String, Subscription>>,
    next_handler_id: Arc<AtomicU64>,
    state: Arc<Mutex<ProcessingState>>,
}

impl Default for EventProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl EventProcessor {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HandlerTable::default())),
            subscriptions: Arc::new(DashMap::new()),
            next_handler_id: Arc::new(AtomicU64::new(1)),
            state: Arc::new(Mutex::new(ProcessingState::default())),
        }
    }

    /// 以通配处理器的方式挂到总线上
    pub fn attach(&self, bus: &EventBus) -> HandlerId {
        let processor = self.clone();
        bus.subscribe_with_priority(
            EventSelector::Any,
            "event-processor",
            0,
            handler_fn(move |event| {
                let processor = processor.clone();
                async move { processor.process(event).await }
            }),
        )
    }

    pub fn register_handler(
        &self,
        selector: impl Into<EventSelector>,
        name: impl Into<String>,
        priority: i32,
        handler: EventHandlerFn,
    ) -> HandlerId {
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::Relaxed));
        let registered = RegisteredHandler {
            id,
            name: name.into(),
            priority,
            handler,
        };
        let selector = selector.into();
        match self.handlers.write() {
            Ok(mut table) => table.insert(selector, registered),
            Err(poisoned) => poisoned.into_inner().insert(selector, registered),
        }
        id
    }

    /// 订阅若干事件类型 (为空表示全部)，返回订阅 ID
    pub fn subscribe(
        &self,
        event_types: Vec<EventType>,
        filter: Option<EventPredicate>,
        handler: EventHandlerFn,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        tracing::debug!(subscription_id = %id, event_types = ?event_types, "Created event subscription");
        self.subscriptions.insert(
            id.clone(),
            Subscription {
                event_types,
                filter,
                handler,
                created_at: Utc::now(),
            },
        );
        id
    }

    pub fn unsubscribe(&self, subscription_id: &str) -> bool {
        self.subscriptions.remove(subscription_id).is_some()
    }

    /// 按优先级顺序执行内置处理器，再并发执行匹配的订阅
    pub async fn process(&self, event: SystemEvent) -> HandlerResult {
        let started = Instant::now();

        let handlers = self
            .handlers
            .read()
            .map(|table| table.handlers_for(event.event_type))
            .unwrap_or_default();

        let mut errors = Vec::new();
        for registered in handlers {
            if let Err(e) = (registered.handler)(event.clone()).await {
                tracing::warn!(handler = %registered.name, error = %e, "Built-in event handler failed");
                errors.push(e);
            }
        }

        let matching: Vec<(String, Subscription)> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.value().accepts(&event))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        let outcomes = join_all(matching.into_iter().map(|(id, subscription)| {
            let event = event.clone();
            async move { (id, (subscription.handler)(event).await) }
        }))
        .await;

        for (id, outcome) in outcomes {
            if let Err(e) = outcome {
                tracing::warn!(subscription_id = %id, error = %e, "Event subscription handler failed");
                errors.push(e);
            }
        }

        self.record(&event, started.elapsed(), errors.is_empty());

        match errors.into_iter().next() {
            Some(first) => Err(first),
            None => Ok(()),
        }
    }

    fn record(&self, event: &SystemEvent, elapsed: Duration, success: bool) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.total_processed += 1;
        if success {
            state.successful += 1;
        } else {
            state.failed += 1;
        }
        *state.by_type.entry(event.event_type).or_default() += 1;
        state.recent_latencies.push_back(elapsed);
        if state.recent_latencies.len() > LATENCY_WINDOW {
            state.recent_latencies.pop_front();
        }
        state.last_processed_at = Some(Utc::now());
    }

    pub fn stats(&self) -> ProcessingStats {
        let handlers = self.handlers.read().map(|t| t.len()).unwrap_or(0);
        let subscriptions = self.subscriptions.len();
        let Ok(state) = self.state.lock() else {
            return ProcessingStats {
                total_processed: 0,
                successful: 0,
                failed: 0,
                by_type: HashMap::new(),
                average_processing_ms: 0.0,
                last_processed_at: None,
                handlers,
                subscriptions,
            };
        };

        let average_processing_ms = if state.recent_latencies.is_empty() {
            0.0
        } else {
            let total: Duration = state.recent_latencies.iter().sum();
            total.as_secs_f64() * 1000.0 / state.recent_latencies.len() as f64
        };

        ProcessingStats {
            total_processed: state.total_processed,
            successful: state.successful,
            failed: state.failed,
            by_type: state.by_type.clone(),
            average_processing_ms,
            last_processed_at: state.last_processed_at,
            handlers,
            subscriptions,
        }
    }

    /// 返回最老订阅的创建时间，用于诊断泄漏
    pub fn oldest_subscription(&self) -> Option<DateTime<Utc>> {
        self.subscriptions
            .iter()
            .map(|entry| entry.value().created_at)
            .min()
    }

    /// 内置的日志类处理器
    pub fn register_builtin_handlers(&self) {
        self.register_handler(
            EventType::ServiceRegistered,
            "log-service-registered",
            10,
            handler_fn(|event| async move {
                tracing::info!(data = %event.data, "Service registered");
                Ok(())
            }),
        );
        self.register_handler(
            EventType::ServiceDeregistered,
            "log-service-deregistered",
            10,
            handler_fn(|event| async move {
                tracing::info!(data = %event.data, "Service deregistered");
                Ok(())
            }),
        );
        self.register_handler(
            EventType::ServiceHealthChanged,
            "log-health-change",
            100,
            handler_fn(|event| async move {
                if let Some(change) = event.payload::<HealthChangedPayload>() {
                    tracing::info!(
                        service_id = %change.service_id,
                        service_name = %change.service_name,
                        old_status = %change.old_status,
                        new_status = %change.new_status,
                        response_time_ms = change.response_time,
                        "Service health changed"
                    );
                }
                Ok(())
            }),
        );
        self.register_handler(
            EventType::SystemAlert,
            "log-system-alert",
            100,
            handler_fn(|event| async move {
                if let Some(alert) = event.payload::<AlertPayload>() {
                    tracing::warn!(severity = ?alert.severity, "Alert: {}", alert.message);
                }
                Ok(())
            }),
        );
        self.register_handler(
            EventType::SystemError,
            "log-system-error",
            100,
            handler_fn(|event| async move {
                tracing::error!(source = %event.source, data = %event.data, "System error reported");
                Ok(())
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event::types::{EventPriority, HandlerError};

    fn event(event_type: EventType, source: &str) -> SystemEvent {
        SystemEvent {
            id: Uuid::new_v4().to_string(),
            event_type,
            data: serde_json::json!({}),
            source: source.to_string(),
            priority: EventPriority::Normal,
            tags: vec![],
            targets: vec![],
            correlation_id: None,
            timestamp: Utc::now(),
            ttl: 3600,
            retry_count: 0,
            processed: false,
        }
    }

    #[tokio::test]
    async fn test_handlers_run_in_priority_order() {
        let processor = EventProcessor::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, priority) in [("low", 1), ("high", 50), ("mid", 10)] {
            let order = order.clone();
            processor.register_handler(
                EventType::PriceUpdated,
                name,
                priority,
                handler_fn(move |_| {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(name);
                        Ok(())
                    }
                }),
            );
        }

        processor
            .process(event(EventType::PriceUpdated, "pricing"))
            .await
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn test_subscription_predicate_filters_events() {
        let processor = EventProcessor::new();
        let seen = Arc::new(AtomicU64::new(0));
        let counter = seen.clone();

        let id = processor.subscribe(
            vec![EventType::TransactionCreated],
            Some(Arc::new(|e: &SystemEvent| e.source == "ledger")),
            handler_fn(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        processor
            .process(event(EventType::TransactionCreated, "ledger"))
            .await
            .unwrap();
        processor
            .process(event(EventType::TransactionCreated, "other"))
            .await
            .unwrap();
        processor
            .process(event(EventType::PriceUpdated, "ledger"))
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        assert!(processor.unsubscribe(&id));
        assert!(processor.oldest_subscription().is_none());
    }

    #[tokio::test]
    async fn test_stats_track_failures() {
        let processor = EventProcessor::new();
        processor.register_handler(
            EventType::SystemError,
            "failing",
            0,
            handler_fn(|_| async { Err(HandlerError::new("nope")) }),
        );

        assert!(
            processor
                .process(event(EventType::SystemError, "w"))
                .await
                .is_err()
        );
        processor
            .process(event(EventType::PriceUpdated, "p"))
            .await
            .unwrap();

        let stats = processor.stats();
        assert_eq!(stats.total_processed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.by_type[&EventType::SystemError], 1);
        assert!(stats.last_processed_at.is_some());
    }
}
