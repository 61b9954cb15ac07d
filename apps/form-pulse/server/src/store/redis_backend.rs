use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};

use super::{MetricsStore, StoreResult};

/// Redis-backed store. Every call clones the multiplexed connection manager,
/// so the store is cheap to share across connection tasks.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }
}

#[async_trait]
impl MetricsStore for RedisStore {
    async fn incr(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.redis.clone();
        let value: i64 = conn.incr(key, delta).await?;
        Ok(value)
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.redis.clone();
        let value: i64 = conn.hincr(key, field, delta).await?;
        Ok(value)
    }

    async fn push_capped(&self, key: &str, value: String, cap: usize) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        let last = cap.saturating_sub(1) as isize;
        redis::pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(key)
            .arg(&value)
            .ignore()
            .cmd("LTRIM")
            .arg(key)
            .arg(0)
            .arg(last)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn push(&self, key: &str, value: String) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, i64>> {
        let mut conn = self.redis.clone();
        let values: HashMap<String, i64> = conn.hgetall(key).await?;
        Ok(values)
    }

    async fn lrange(&self, key: &str, limit: usize) -> StoreResult<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let values: Vec<String> = conn.lrange(key, 0, limit as isize - 1).await?;
        Ok(values)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.redis.clone();
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }
}
