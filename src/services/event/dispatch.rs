use std::collections::HashMap;

use super::types::{EventHandlerFn, EventSelector, EventType, HandlerId};

#[derive(Clone)]
pub struct RegisteredHandler {
    pub id: HandlerId,
    pub name: String,
    pub priority: i32,
    pub handler: EventHandlerFn,
}

impl std::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish()
    }
}

/// 事件分发表: 按具体类型分桶，外加一个总会被查询的通配桶
///
/// 每个桶在注册时按优先级降序插入，分发时不再排序。
#[derive(Debug, Default)]
pub struct HandlerTable {
    by_type: HashMap<EventType, Vec<RegisteredHandler>>,
    wildcard: Vec<RegisteredHandler>,
}

impl HandlerTable {
    pub fn insert(&mut self, selector: EventSelector, handler: RegisteredHandler) {
        let bucket = match selector {
            EventSelector::Type(event_type) => self.by_type.entry(event_type).or_default(),
            EventSelector::Any => &mut self.wildcard,
        };
        // 同优先级保持注册顺序
        let pos = bucket.partition_point(|h| h.priority >= handler.priority);
        bucket.insert(pos, handler);
    }

    pub fn remove(&mut self, id: HandlerId) -> bool {
        let mut removed = false;
        for bucket in self
            .by_type
            .values_mut()
            .chain(std::iter::once(&mut self.wildcard))
        {
            let before = bucket.len();
            bucket.retain(|h| h.id != id);
            removed |= bucket.len() != before;
        }
        self.by_type.retain(|_, bucket| !bucket.is_empty());
        removed
    }

    /// 类型桶在前，通配桶在后
    pub fn handlers_for(&self, event_type: EventType) -> Vec<RegisteredHandler> {
        self.by_type
            .get(&event_type)
            .into_iter()
            .flatten()
            .chain(self.wildcard.iter())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_type.values().map(Vec::len).sum::<usize>() + self.wildcard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event::types::handler_fn;

    fn noop(id: u64, priority: i32) -> RegisteredHandler {
        RegisteredHandler {
            id: HandlerId(id),
            name: format!("h{id}"),
            priority,
            handler: handler_fn(|_| async { Ok(()) }),
        }
    }

    #[test]
    fn test_bucket_sorted_by_descending_priority() {
        let mut table = HandlerTable::default();
        let selector = EventSelector::Type(EventType::SystemAlert);
        table.insert(selector, noop(1, 0));
        table.insert(selector, noop(2, 10));
        table.insert(selector, noop(3, 5));
        table.insert(selector, noop(4, 10));

        let ids: Vec<u64> = table
            .handlers_for(EventType::SystemAlert)
            .iter()
            .map(|h| h.id.0)
            .collect();
        assert_eq!(ids, vec![2, 4, 3, 1]);
    }

    #[test]
    fn test_wildcard_always_consulted() {
        let mut table = HandlerTable::default();
        table.insert(EventSelector::Type(EventType::SystemAlert), noop(1, 0));
        table.insert(EventSelector::Any, noop(2, 100));

        let alert: Vec<u64> = table
            .handlers_for(EventType::SystemAlert)
            .iter()
            .map(|h| h.id.0)
            .collect();
        assert_eq!(alert, vec![1, 2]);
        assert_eq!(table.handlers_for(EventType::PriceUpdated).len(), 1);
    }

    #[test]
    fn test_remove_by_id() {
        let mut table = HandlerTable::default();
        table.insert(EventSelector::Type(EventType::SystemAlert), noop(1, 0));
        table.insert(EventSelector::Any, noop(2, 0));

        assert!(table.remove(HandlerId(1)));
        assert!(!table.remove(HandlerId(1)));
        assert_eq!(table.len(), 1);
        assert!(table.remove(HandlerId(2)));
        assert!(table.is_empty());
    }
}
