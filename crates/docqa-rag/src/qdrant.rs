//! Qdrant 向量索引实现
//!
//! 集合不存在时按配置维度自动创建,距离度量固定为余弦。
//! 点 id 即 `VectorRecord::id`(UUID 字符串),属主与文档过滤
//! 通过 payload 关键字匹配完成。

use async_trait::async_trait;
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeleteCollectionBuilder, DeletePointsBuilder, Distance,
    Filter, PointStruct, QueryPointsBuilder, UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use docqa_error::{DocqaError, Result};

use crate::vector::{VectorIndex, VectorMatch, VectorPayload, VectorRecord};

pub struct QdrantVectorIndex {
    client: Qdrant,
    collection_name: String,
    vector_size: u64,
}

impl QdrantVectorIndex {
    pub async fn new(qdrant_url: &str, collection_name: String, vector_size: u64) -> Result<Self> {
        let client = Qdrant::from_url(qdrant_url)
            .build()
            .map_err(|e| DocqaError::VectorStore {
                operation: "connect".to_string(),
                message: format!("Failed to connect to Qdrant: {}", e),
            })?;

        let index = Self {
            client,
            collection_name,
            vector_size,
        };
        index.ensure_collection().await?;
        Ok(index)
    }

    async fn ensure_collection(&self) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection_name)
            .await
            .map_err(|e| DocqaError::VectorStore {
                operation: "collection_exists".to_string(),
                message: e.to_string(),
            })?;
        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection_name).vectors_config(
                        VectorParamsBuilder::new(self.vector_size, Distance::Cosine).build(),
                    ),
                )
                .await
                .map_err(|e| DocqaError::VectorStore {
                    operation: "create_collection".to_string(),
                    message: e.to_string(),
                })?;
            info!("Created Qdrant collection: {}", self.collection_name);
        }
        Ok(())
    }

    fn to_point(record: VectorRecord) -> PointStruct {
        let mut payload = Payload::new();
        payload.insert("owner_id", record.payload.owner_id.to_string());
        payload.insert("document_id", record.payload.document_id.to_string());
        payload.insert("chunk_id", record.payload.chunk_id.to_string());
        payload.insert("ord", record.payload.ord as i64);
        payload.insert("text", record.payload.text);
        PointStruct::new(record.id, record.vector, payload)
    }

    async fn delete_by_filter(&self, operation: &str, filter: Filter) -> Result<()> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection_name)
                    .points(filter)
                    .wait(true),
            )
            .await
            .map_err(|e| DocqaError::VectorStore {
                operation: operation.to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for QdrantVectorIndex {
    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let points: Vec<PointStruct> = records.into_iter().map(Self::to_point).collect();
        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection_name, points).wait(true))
            .await
            .map_err(|e| DocqaError::VectorStore {
                operation: "upsert".to_string(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    #[instrument(skip(self, vector))]
    async fn search(
        &self,
        vector: &[f32],
        owner_id: Uuid,
        top_k: usize,
    ) -> Result<Vec<VectorMatch>> {
        let filter = Filter::must([Condition::matches("owner_id", owner_id.to_string())]);
        let response = self
            .client
            .query(
                QueryPointsBuilder::new(&self.collection_name)
                    .query(vector.to_vec())
                    .limit(top_k as u64)
                    .filter(filter)
                    .with_payload(true),
            )
            .await
            .map_err(|e| DocqaError::VectorStore {
                operation: "search".to_string(),
                message: e.to_string(),
            })?;

        let mut matches = Vec::with_capacity(response.result.len());
        for point in response.result {
            let get_str = |key: &str| {
                point
                    .payload
                    .get(key)
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
            };
            let parse_uuid = |key: &str| get_str(key).and_then(|s| Uuid::parse_str(&s).ok());
            let (Some(owner), Some(document_id), Some(chunk_id), Some(text)) = (
                parse_uuid("owner_id"),
                parse_uuid("document_id"),
                parse_uuid("chunk_id"),
                get_str("text"),
            ) else {
                // 跳过载荷不完整的点,不让单个坏点打断整次检索
                warn!("skipping point with malformed payload");
                continue;
            };
            let ord = point
                .payload
                .get("ord")
                .and_then(|v| v.as_integer())
                .unwrap_or(0) as i32;
            matches.push(VectorMatch {
                score: point.score,
                payload: VectorPayload {
                    owner_id: owner,
                    document_id,
                    chunk_id,
                    ord,
                    text,
                },
            });
        }
        Ok(matches)
    }

    #[instrument(skip(self))]
    async fn delete_by_document(&self, document_id: Uuid) -> Result<()> {
        let filter = Filter::must([Condition::matches("document_id", document_id.to_string())]);
        self.delete_by_filter("delete_by_document", filter).await
    }

    #[instrument(skip(self))]
    async fn delete_by_owner(&self, owner_id: Uuid) -> Result<()> {
        let filter = Filter::must([Condition::matches("owner_id", owner_id.to_string())]);
        self.delete_by_filter("delete_by_owner", filter).await
    }

    /// 清空全部向量:删除整个 collection 后重建
    #[instrument(skip(self))]
    async fn delete_all(&self) -> Result<()> {
        self.client
            .delete_collection(DeleteCollectionBuilder::new(&self.collection_name).build())
            .await
            .map_err(|e| DocqaError::VectorStore {
                operation: "delete_collection".to_string(),
                message: e.to_string(),
            })?;
        info!("Deleted Qdrant collection: {}", self.collection_name);
        self.ensure_collection().await
    }
}
