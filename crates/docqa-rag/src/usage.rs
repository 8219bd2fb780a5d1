//! 用量台账
//!
//! 按属主、按 UTC 自然日统计生成次数。计数键形如
//! `usage:{owner}:{YYYYMMDD}`,首次递增时设置到下个 UTC 零点的 TTL,
//! 计数随之自然归零。并发安全依赖 Redis `INCR` 的原子性。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redis::{AsyncCommands, Client as RedisClient};
use tokio::sync::RwLock;
use tracing::instrument;
use uuid::Uuid;

use docqa_core::UsageReport;
use docqa_error::{DocqaError, Result};

pub const DEFAULT_DAILY_LIMIT: u32 = 50;

#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// 当前属主当日的用量快照
    async fn usage(&self, owner_id: Uuid) -> Result<UsageReport>;

    /// 记一次生成。只在生成成功后调用。
    async fn record(&self, owner_id: Uuid) -> Result<()>;
}

pub(crate) fn day_key(owner_id: Uuid, now: DateTime<Utc>) -> String {
    format!("usage:{}:{}", owner_id, now.format("%Y%m%d"))
}

pub(crate) fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + ChronoDuration::days(1);
    DateTime::from_naive_utc_and_offset(tomorrow.and_hms_opt(0, 0, 0).unwrap(), Utc)
}

fn report(used: u32, limit: u32, now: DateTime<Utc>) -> UsageReport {
    UsageReport {
        used,
        limit,
        remaining: limit.saturating_sub(used),
        resets_at: next_utc_midnight(now),
    }
}

pub struct RedisUsageLedger {
    redis_client: RedisClient,
    daily_limit: u32,
}

impl RedisUsageLedger {
    pub fn new(redis_url: &str, daily_limit: u32) -> Result<Self> {
        let redis_client = RedisClient::open(redis_url).map_err(|e| DocqaError::Configuration {
            key: "redis_url".to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            redis_client,
            daily_limit,
        })
    }

    async fn connection(&self) -> Result<redis::aio::Connection> {
        self.redis_client
            .get_async_connection()
            .await
            .map_err(|e| DocqaError::Network {
                operation: "redis_connection".to_string(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl UsageLedger for RedisUsageLedger {
    #[instrument(skip(self))]
    async fn usage(&self, owner_id: Uuid) -> Result<UsageReport> {
        let now = Utc::now();
        let mut conn = self.connection().await?;
        let used: Option<u32> = conn
            .get(day_key(owner_id, now))
            .await
            .map_err(|e| DocqaError::Network {
                operation: "redis_get".to_string(),
                message: e.to_string(),
            })?;
        Ok(report(used.unwrap_or(0), self.daily_limit, now))
    }

    #[instrument(skip(self))]
    async fn record(&self, owner_id: Uuid) -> Result<()> {
        let now = Utc::now();
        let key = day_key(owner_id, now);
        let mut conn = self.connection().await?;
        let value: u32 = conn.incr(&key, 1u32).await.map_err(|e| DocqaError::Network {
            operation: "redis_incr".to_string(),
            message: e.to_string(),
        })?;
        if value == 1 {
            // 当日首次计数,过期时间对齐下个 UTC 零点
            let ttl = (next_utc_midnight(now) - now).num_seconds().max(1) as usize;
            conn.expire::<_, ()>(&key, ttl)
                .await
                .map_err(|e| DocqaError::Network {
                    operation: "redis_expire".to_string(),
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }
}

/// 进程内台账,用于测试和无 Redis 的单机部署
pub struct MemoryUsageLedger {
    counts: RwLock<HashMap<String, u32>>,
    daily_limit: u32,
}

impl MemoryUsageLedger {
    pub fn new(daily_limit: u32) -> Self {
        Self {
            counts: RwLock::new(HashMap::new()),
            daily_limit,
        }
    }
}

#[async_trait]
impl UsageLedger for MemoryUsageLedger {
    async fn usage(&self, owner_id: Uuid) -> Result<UsageReport> {
        let now = Utc::now();
        let used = *self
            .counts
            .read()
            .await
            .get(&day_key(owner_id, now))
            .unwrap_or(&0);
        Ok(report(used, self.daily_limit, now))
    }

    async fn record(&self, owner_id: Uuid) -> Result<()> {
        let now = Utc::now();
        let mut counts = self.counts.write().await;
        *counts.entry(day_key(owner_id, now)).or_insert(0) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn day_key_embeds_owner_and_date() {
        let owner = Uuid::nil();
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 23, 59, 59).unwrap();
        assert_eq!(
            day_key(owner, at),
            "usage:00000000-0000-0000-0000-000000000000:20260309"
        );
    }

    #[test]
    fn reset_is_next_utc_midnight() {
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 15, 30, 0).unwrap();
        let reset = next_utc_midnight(at);
        assert_eq!(reset, Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap());
        assert!(reset > at);
    }

    #[tokio::test]
    async fn memory_ledger_counts_and_caps() {
        let ledger = MemoryUsageLedger::new(3);
        let owner = Uuid::new_v4();
        let fresh = ledger.usage(owner).await.unwrap();
        assert_eq!((fresh.used, fresh.remaining), (0, 3));

        for _ in 0..3 {
            ledger.record(owner).await.unwrap();
        }
        let spent = ledger.usage(owner).await.unwrap();
        assert_eq!((spent.used, spent.remaining), (3, 0));

        // 超过上限后 remaining 饱和在 0
        ledger.record(owner).await.unwrap();
        assert_eq!(ledger.usage(owner).await.unwrap().remaining, 0);
    }

    #[tokio::test]
    async fn owners_are_isolated() {
        let ledger = MemoryUsageLedger::new(3);
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        ledger.record(alice).await.unwrap();
        assert_eq!(ledger.usage(alice).await.unwrap().used, 1);
        assert_eq!(ledger.usage(bob).await.unwrap().used, 0);
    }
}
