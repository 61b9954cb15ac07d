use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{MetricsStore, StoreError, StoreResult};

/// In-process store used for development runs and tests.
///
/// Supports simple fault injection: the whole store can be taken offline, or
/// the next `n` write calls can be made to fail.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    offline: AtomicBool,
    failing_writes: AtomicU32,
}

#[derive(Default)]
struct MemoryInner {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, i64>>,
    lists: HashMap<String, VecDeque<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    /// Fail the next `count` write calls, then recover.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn check_read(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }

    fn check_write(&self) -> StoreResult<()> {
        self.check_read()?;
        let consumed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if consumed {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsStore for MemoryStore {
    async fn incr(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.check_write()?;
        let mut guard = self.inner.lock();
        let current = match guard.strings.get(key) {
            Some(raw) => raw.parse::<i64>().map_err(|_| StoreError::WrongType {
                key: key.to_string(),
                expected: "an integer",
            })?,
            None => 0,
        };
        let next = current + delta;
        guard.strings.insert(key.to_string(), next.to_string());
        Ok(next)
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        self.check_write()?;
        let mut guard = self.inner.lock();
        let slot = guard
            .hashes
            .entry(key.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert(0);
        *slot += delta;
        Ok(*slot)
    }

    async fn push_capped(&self, key: &str, value: String, cap: usize) -> StoreResult<()> {
        self.check_write()?;
        let mut guard = self.inner.lock();
        let list = guard.lists.entry(key.to_string()).or_default();
        list.push_front(value);
        list.truncate(cap);
        Ok(())
    }

    async fn push(&self, key: &str, value: String) -> StoreResult<()> {
        self.check_write()?;
        let mut guard = self.inner.lock();
        guard
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value);
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_read()?;
        Ok(self.inner.lock().strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        self.check_write()?;
        self.inner.lock().strings.insert(key.to_string(), value);
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, i64>> {
        self.check_read()?;
        Ok(self
            .inner
            .lock()
            .hashes
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn lrange(&self, key: &str, limit: usize) -> StoreResult<Vec<String>> {
        self.check_read()?;
        Ok(self
            .inner
            .lock()
            .lists
            .get(key)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capped_push_keeps_newest_first() {
        let store = MemoryStore::new();
        for i in 0..15 {
            store.push_capped("list", i.to_string(), 10).await.unwrap();
        }
        let values = store.lrange("list", 100).await.unwrap();
        assert_eq!(values.len(), 10);
        assert_eq!(values.first().map(String::as_str), Some("14"));
        assert_eq!(values.last().map(String::as_str), Some("5"));
    }

    #[tokio::test]
    async fn incr_rejects_non_integer_values() {
        let store = MemoryStore::new();
        store.set("k", "abc".into()).await.unwrap();
        let err = store.incr("k", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::WrongType { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn offline_store_fails_reads_and_writes() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable)
        ));
        assert!(matches!(
            store.incr("k", 1).await,
            Err(StoreError::Unavailable)
        ));
        store.set_available(true);
        assert_eq!(store.incr("k", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn injected_write_failures_are_consumed() {
        let store = MemoryStore::new();
        store.fail_next_writes(2);
        assert!(store.incr("k", 1).await.is_err());
        assert!(store.hincr("h", "f", 1).await.is_err());
        assert_eq!(store.incr("k", 1).await.unwrap(), 1);
        // reads are never affected by write injection
        store.fail_next_writes(1);
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("1"));
    }
}
