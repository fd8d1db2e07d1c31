use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use super::types::{CacheEntry, CacheError};

const PING_KEY: &str = "health_check";

/// 基于 DashMap 的 TTL 缓存
///
/// 值以具体类型存放，读取时克隆。`update` 在持有该键分片锁的情况下执行闭包，
/// 因此同一个键上的 "读取-修改-写回" 是原子的。闭包内不可再访问缓存本身。
#[derive(Debug, Clone, Default)]
pub struct CacheStore {
    entries: Arc<DashMap<String, CacheEntry>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 写入一个值，`ttl` 为 `None` 时永不过期
    pub fn set<T>(&self, key: &str, value: T, ttl: Option<Duration>)
    where
        T: Any + Send + Sync,
    {
        let entry = CacheEntry {
            value: Box::new(value),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries.insert(key.to_string(), entry);
    }

    /// 读取一个值的克隆，过期条目视为不存在并顺便删除
    pub fn get<T>(&self, key: &str) -> Result<Option<T>, CacheError>
    where
        T: Any + Clone,
    {
        self.read(key, |value: &T| value.clone())
    }

    /// 在不克隆的情况下读取值
    pub fn read<T, R, F>(&self, key: &str, f: F) -> Result<Option<R>, CacheError>
    where
        T: Any,
        F: FnOnce(&T) -> R,
    {
        let now = Instant::now();
        match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired(now) => {
                let value = entry
                    .value
                    .downcast_ref::<T>()
                    .ok_or_else(|| CacheError::TypeMismatch {
                        key: key.to_string(),
                    })?;
                return Ok(Some(f(value)));
            }
            Some(_) => {}
        }

        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(None)
    }

    /// 原子的读改写，键不存在或已过期时从 `T::default()` 开始
    ///
    /// 每次写回都会按 `ttl` 刷新过期时间。
    pub fn update<T, R, F>(&self, key: &str, ttl: Option<Duration>, f: F) -> Result<R, CacheError>
    where
        T: Any + Default + Send + Sync,
        F: FnOnce(&mut T) -> R,
    {
        let now = Instant::now();
        let mut slot = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry {
                value: Box::new(T::default()),
                expires_at: None,
            });

        if slot.is_expired(now) {
            slot.value = Box::new(T::default());
        }

        let value = slot
            .value
            .downcast_mut::<T>()
            .ok_or_else(|| CacheError::TypeMismatch {
                key: key.to_string(),
            })?;
        let output = f(value);
        slot.expires_at = ttl.map(|ttl| now + ttl);

        Ok(output)
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// 清理所有过期条目，返回删除数量
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());

        if removed > 0 {
            tracing::debug!(removed = removed, "Purged expired cache entries");
        }

        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 写入再读回一个探针值，用于依赖健康检查
    pub fn ping(&self) -> Result<(), CacheError> {
        self.set(PING_KEY, String::from("ping"), Some(Duration::from_secs(1)));
        match self.get::<String>(PING_KEY)? {
            Some(value) if value == "ping" => Ok(()),
            _ => Err(CacheError::TypeMismatch {
                key: PING_KEY.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = CacheStore::new();
        cache.set("k", 42u32, Some(Duration::from_secs(5)));
        assert_eq!(cache.get::<u32>("k").unwrap(), Some(42));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get::<u32>("k").unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_update_is_read_modify_write() {
        let cache = CacheStore::new();
        for _ in 0..3 {
            cache
                .update("counter", None, |n: &mut u64| *n += 1)
                .unwrap();
        }
        assert_eq!(cache.get::<u64>("counter").unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_concurrent_updates_do_not_lose_writes() {
        let cache = CacheStore::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..250u32 {
                    cache
                        .update("list", None, |list: &mut Vec<u32>| list.push(i))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let len = cache.read("list", |list: &Vec<u32>| list.len()).unwrap();
        assert_eq!(len, Some(2000));
    }

    #[tokio::test]
    async fn test_type_mismatch_is_reported() {
        let cache = CacheStore::new();
        cache.set("k", String::from("text"), None);
        assert!(matches!(
            cache.get::<u32>("k"),
            Err(CacheError::TypeMismatch { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = CacheStore::new();
        cache.set("short", 1u8, Some(Duration::from_secs(1)));
        cache.set("long", 2u8, None);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.contains("long"));
        assert!(cache.ping().is_ok());
    }
}
