use std::any::Any;
use thiserror::Error;
use tokio::time::Instant;

/// 缓存错误类型
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cached value under key '{key}' has an unexpected type")]
    TypeMismatch { key: String },
}

// 缓存条目
pub(crate) struct CacheEntry {
    pub value: Box<dyn Any + Send + Sync>,
    pub expires_at: Option<Instant>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}
