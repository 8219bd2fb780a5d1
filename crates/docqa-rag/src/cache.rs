//! 语义缓存
//!
//! 以查询向量为键做相似度匹配:命中阈值即复用已缓存的答案与引用,
//! 跳过检索与生成。条目按属主隔离,TTL 由 Redis 负责;没有配置
//! Redis 时退回进程内存储。候选集按属主线性扫描,规模受 TTL 约束。
//! 缓存任何一步失败都只降级,不影响查询主流程。

use chrono::Utc;
use redis::{AsyncCommands, Client as RedisClient};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use docqa_core::CacheEntry;
use docqa_error::{DocqaError, Result};

use crate::vector::cosine_similarity;

#[derive(Debug, Clone)]
pub struct SemanticCacheConfig {
    /// 命中所需的最小余弦相似度
    pub similarity_threshold: f32,
    pub ttl_secs: u64,
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.95,
            ttl_secs: 3600,
        }
    }
}

struct MemEntry {
    owner_id: Uuid,
    entry: CacheEntry,
}

pub struct SemanticCache {
    redis_client: Option<RedisClient>,
    // 无 Redis 时的进程内回退,过期条目在写入时顺带清理
    mem: RwLock<Vec<MemEntry>>,
    cfg: SemanticCacheConfig,
}

impl SemanticCache {
    pub fn new(redis_url: Option<String>, cfg: SemanticCacheConfig) -> Result<Self> {
        let redis_client = if let Some(url) = redis_url {
            Some(RedisClient::open(url).map_err(|e| DocqaError::Configuration {
                key: "redis_url".to_string(),
                reason: e.to_string(),
            })?)
        } else {
            None
        };
        Ok(Self {
            redis_client,
            mem: RwLock::new(Vec::new()),
            cfg,
        })
    }

    /// 在属主的候选条目中找第一个相似度达到阈值的。
    /// 任何存储层错误都记日志并当作未命中。
    #[instrument(skip(self, query_vector))]
    pub async fn lookup(&self, owner_id: Uuid, query_vector: &[f32]) -> Option<CacheEntry> {
        let result = if self.redis_client.is_some() {
            self.lookup_redis(owner_id, query_vector).await
        } else {
            Ok(self.lookup_memory(owner_id, query_vector).await)
        };
        match result {
            Ok(hit) => {
                if hit.is_some() {
                    debug!(%owner_id, "semantic cache hit");
                }
                hit
            }
            Err(e) => {
                warn!(%owner_id, error = %e, "cache lookup failed, treating as miss");
                None
            }
        }
    }

    /// 写入缓存条目。失败只记日志,不向调用方冒泡。
    #[instrument(skip(self, entry))]
    pub async fn store(&self, owner_id: Uuid, entry: CacheEntry) {
        let result = if self.redis_client.is_some() {
            self.store_redis(owner_id, &entry).await
        } else {
            self.store_memory(owner_id, entry).await;
            Ok(())
        };
        if let Err(e) = result {
            warn!(%owner_id, error = %e, "cache store failed, answer not cached");
        }
    }

    fn matches(&self, entry: &CacheEntry, query_vector: &[f32]) -> bool {
        cosine_similarity(&entry.embedding, query_vector) >= self.cfg.similarity_threshold
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        let age = Utc::now().signed_duration_since(entry.created_at);
        age.num_seconds() >= self.cfg.ttl_secs as i64
    }

    async fn lookup_redis(&self, owner_id: Uuid, query_vector: &[f32]) -> Result<Option<CacheEntry>> {
        let redis_client = self.redis_client.as_ref().unwrap();
        let mut conn = redis_client
            .get_async_connection()
            .await
            .map_err(|e| DocqaError::Cache {
                operation: "redis_connection".to_string(),
                message: e.to_string(),
            })?;

        let pattern = format!("semcache:{}:*", owner_id);
        let keys: Vec<String> = conn.keys(pattern).await.map_err(|e| DocqaError::Cache {
            operation: "redis_keys".to_string(),
            message: e.to_string(),
        })?;

        for key in keys {
            if let Ok(data) = conn.get::<_, String>(&key).await {
                if let Ok(entry) = serde_json::from_str::<CacheEntry>(&data) {
                    if self.matches(&entry, query_vector) {
                        return Ok(Some(entry));
                    }
                }
            }
        }
        Ok(None)
    }

    async fn store_redis(&self, owner_id: Uuid, entry: &CacheEntry) -> Result<()> {
        let redis_client = self.redis_client.as_ref().unwrap();
        let mut conn = redis_client
            .get_async_connection()
            .await
            .map_err(|e| DocqaError::Cache {
                operation: "redis_connection".to_string(),
                message: e.to_string(),
            })?;

        let key = format!("semcache:{}:{}", owner_id, Uuid::new_v4());
        let data = serde_json::to_string(entry)?;
        conn.set_ex::<_, _, ()>(&key, data, self.cfg.ttl_secs as usize)
            .await
            .map_err(|e| DocqaError::Cache {
                operation: "redis_setex".to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn lookup_memory(&self, owner_id: Uuid, query_vector: &[f32]) -> Option<CacheEntry> {
        let mem = self.mem.read().await;
        mem.iter()
            .filter(|m| m.owner_id == owner_id && !self.is_expired(&m.entry))
            .find(|m| self.matches(&m.entry, query_vector))
            .map(|m| m.entry.clone())
    }

    async fn store_memory(&self, owner_id: Uuid, entry: CacheEntry) {
        let mut mem = self.mem.write().await;
        mem.retain(|m| !self.is_expired(&m.entry));
        mem.push(MemEntry { owner_id, entry });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docqa_core::SourceCitation;

    fn entry(query: &str, embedding: Vec<f32>) -> CacheEntry {
        CacheEntry {
            query: query.to_string(),
            answer: format!("answer to {}", query),
            sources: vec![SourceCitation {
                document_id: Uuid::new_v4().to_string(),
                chunk_id: Uuid::new_v4().to_string(),
                file_name: "notes.md".to_string(),
                snippet: "snippet".to_string(),
                score: 0.9,
            }],
            embedding,
            created_at: Utc::now(),
        }
    }

    fn cache() -> SemanticCache {
        SemanticCache::new(None, SemanticCacheConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn identical_vector_hits() {
        let cache = cache();
        let owner = Uuid::new_v4();
        cache.store(owner, entry("q1", vec![1.0, 0.0, 0.0])).await;
        let hit = cache.lookup(owner, &[1.0, 0.0, 0.0]).await;
        assert_eq!(hit.unwrap().query, "q1");
    }

    #[tokio::test]
    async fn dissimilar_vector_misses() {
        let cache = cache();
        let owner = Uuid::new_v4();
        cache.store(owner, entry("q1", vec![1.0, 0.0, 0.0])).await;
        assert!(cache.lookup(owner, &[0.0, 1.0, 0.0]).await.is_none());
    }

    #[tokio::test]
    async fn near_threshold_vector_hits() {
        let cache = cache();
        let owner = Uuid::new_v4();
        cache.store(owner, entry("q1", vec![1.0, 0.0])).await;
        // cos = 0.98,高于 0.95 阈值
        let hit = cache.lookup(owner, &[1.0, 0.2]).await;
        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn entries_are_scoped_to_owner() {
        let cache = cache();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        cache.store(alice, entry("q1", vec![1.0, 0.0])).await;
        assert!(cache.lookup(bob, &[1.0, 0.0]).await.is_none());
        assert!(cache.lookup(alice, &[1.0, 0.0]).await.is_some());
    }

    #[tokio::test]
    async fn expired_entries_are_ignored() {
        let cache = SemanticCache::new(
            None,
            SemanticCacheConfig {
                ttl_secs: 0,
                ..SemanticCacheConfig::default()
            },
        )
        .unwrap();
        let owner = Uuid::new_v4();
        cache.store(owner, entry("q1", vec![1.0, 0.0])).await;
        assert!(cache.lookup(owner, &[1.0, 0.0]).await.is_none());
    }
}
