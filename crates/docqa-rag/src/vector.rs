//! 向量索引抽象
//!
//! 上层编排器只依赖 [`VectorIndex`] trait;生产环境用 Qdrant 实现,
//! 测试与单机场景用进程内实现。所有写入以向量 id 为幂等键。

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use docqa_error::Result;

pub const DEFAULT_TOP_K: usize = 5;

/// 与向量一同存储的载荷,检索命中后用于拼引用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPayload {
    pub owner_id: Uuid,
    pub document_id: Uuid,
    pub chunk_id: Uuid,
    pub ord: i32,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: VectorPayload,
}

#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub score: f32,
    pub payload: VectorPayload,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// 按 id 幂等写入,重复写入同一 id 只保留最新值
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()>;

    /// 在指定属主范围内做相似度检索,按得分降序返回至多 `top_k` 条
    async fn search(&self, vector: &[f32], owner_id: Uuid, top_k: usize)
        -> Result<Vec<VectorMatch>>;

    async fn delete_by_document(&self, document_id: Uuid) -> Result<()>;

    async fn delete_by_owner(&self, owner_id: Uuid) -> Result<()>;

    async fn delete_all(&self) -> Result<()>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// 进程内向量索引,线性扫描打分
#[derive(Default)]
pub struct MemoryVectorIndex {
    records: RwLock<HashMap<String, VectorRecord>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        let mut map = self.records.write().await;
        for r in records {
            map.insert(r.id.clone(), r);
        }
        Ok(())
    }

    async fn search(
        &self,
        vector: &[f32],
        owner_id: Uuid,
        top_k: usize,
    ) -> Result<Vec<VectorMatch>> {
        let map = self.records.read().await;
        let mut scored: Vec<VectorMatch> = map
            .values()
            .filter(|r| r.payload.owner_id == owner_id)
            .map(|r| VectorMatch {
                score: cosine_similarity(vector, &r.vector),
                payload: r.payload.clone(),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn delete_by_document(&self, document_id: Uuid) -> Result<()> {
        self.records
            .write()
            .await
            .retain(|_, r| r.payload.document_id != document_id);
        Ok(())
    }

    async fn delete_by_owner(&self, owner_id: Uuid) -> Result<()> {
        self.records
            .write()
            .await
            .retain(|_, r| r.payload.owner_id != owner_id);
        Ok(())
    }

    async fn delete_all(&self) -> Result<()> {
        self.records.write().await.clear();
        Ok(())
    }
}
