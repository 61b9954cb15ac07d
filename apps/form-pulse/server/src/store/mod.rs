//! Durable store contract behind the metrics aggregator.
//!
//! Backends only provide primitives; key layout and retry behavior live in
//! [`crate::aggregator`].

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod redis_backend;

pub use self::memory::MemoryStore;
pub use self::redis_backend::RedisStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("store unavailable")]
    Unavailable,
    #[error("value at `{key}` is not {expected}")]
    WrongType { key: String, expected: &'static str },
}

impl StoreError {
    /// Whether another attempt could plausibly succeed. Server replies such as
    /// `WRONGTYPE` are deterministic and never retried.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Redis(err) => {
                err.is_io_error()
                    || err.is_connection_dropped()
                    || err.is_connection_refusal()
                    || err.is_timeout()
                    || matches!(
                        err.kind(),
                        ::redis::ErrorKind::BusyLoadingError | ::redis::ErrorKind::TryAgain
                    )
            }
            StoreError::Unavailable => true,
            StoreError::WrongType { .. } => false,
        }
    }
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Atomically add `delta` to the integer at `key`, returning the new value.
    async fn incr(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// Atomically add `delta` to `field` of the hash at `key`.
    async fn hincr(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;

    /// Prepend `value` and trim the list to its newest `cap` entries.
    async fn push_capped(&self, key: &str, value: String, cap: usize) -> StoreResult<()>;

    /// Prepend `value` without trimming.
    async fn push(&self, key: &str, value: String) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: String) -> StoreResult<()>;

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, i64>>;

    /// Up to `limit` entries from the head (newest end) of the list.
    async fn lrange(&self, key: &str, limit: usize) -> StoreResult<Vec<String>>;

    async fn ping(&self) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::redis::{ErrorKind, RedisError};

    #[test]
    fn only_connection_level_redis_errors_are_transient() {
        let reset = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert!(StoreError::Redis(reset).is_transient());

        let loading = RedisError::from((ErrorKind::BusyLoadingError, "loading dataset"));
        assert!(StoreError::Redis(loading).is_transient());

        let wrong_type = RedisError::from((
            ErrorKind::ResponseError,
            "WRONGTYPE Operation against a key holding the wrong kind of value",
        ));
        assert!(!StoreError::Redis(wrong_type).is_transient());

        let type_error = RedisError::from((ErrorKind::TypeError, "not an integer"));
        assert!(!StoreError::Redis(type_error).is_transient());

        assert!(StoreError::Unavailable.is_transient());
    }
}
