//! 入库编排
//!
//! 抽取 → 分段 → 嵌入 → 写索引 → 落块元数据。任一阶段失败都把文档
//! 标记为失败并带上阶段与原因;无论成败,上传的临时文件都会被清理。
//! 上传接口先落文档记录再 `tokio::spawn` 本编排器,立即返回。

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use docqa_core::{Chunk, Document};
use docqa_error::{DocqaError, Result};

use crate::embedding::EmbeddingClient;
use crate::extract;
use crate::segmenter::{segment, SegmenterConfig};
use crate::store::DocumentStore;
use crate::vector::{VectorIndex, VectorPayload, VectorRecord};

pub struct IngestionOrchestrator {
    store: Arc<dyn DocumentStore>,
    embedder: EmbeddingClient,
    index: Arc<dyn VectorIndex>,
    segmenter: SegmenterConfig,
}

impl IngestionOrchestrator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        embedder: EmbeddingClient,
        index: Arc<dyn VectorIndex>,
        segmenter: SegmenterConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            index,
            segmenter,
        }
    }

    /// 处理一个已登记的文档。状态更新写回存储,不向调用方返回错误,
    /// 适合直接挂在 `tokio::spawn` 下跑。
    #[instrument(skip(self, doc, path), fields(document_id = %doc.id, file = %doc.file_name))]
    pub async fn ingest_file(&self, doc: &Document, path: &Path) {
        let outcome = self.run(doc, path).await;

        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "failed to remove uploaded temp file");
        }

        match outcome {
            Ok(chunk_count) => {
                if let Err(e) = self.store.mark_completed(doc.id, chunk_count as i32).await {
                    error!(error = %e, "failed to mark document completed");
                } else {
                    info!(chunk_count, "document ingested");
                }
            }
            Err(e) => {
                e.log("ingest", "ingest_file");
                if let Err(store_err) = self.store.mark_failed(doc.id, &e.to_string()).await {
                    error!(error = %store_err, "failed to mark document failed");
                }
            }
        }
    }

    async fn run(&self, doc: &Document, path: &Path) -> Result<usize> {
        let bytes = tokio::fs::read(path).await.map_err(|e| DocqaError::Ingestion {
            stage: "read".to_string(),
            message: e.to_string(),
        })?;

        // PDF 解析是纯 CPU 工作,挪出异步线程
        let media_type = doc.media_type.clone();
        let text = tokio::task::spawn_blocking(move || extract::extract_text(&bytes, &media_type))
            .await??;

        if text.trim().is_empty() {
            return Err(DocqaError::Ingestion {
                stage: "extract".to_string(),
                message: "document contains no extractable text".to_string(),
            });
        }

        let segments = segment(&text, &self.segmenter);
        if segments.is_empty() {
            return Err(DocqaError::Ingestion {
                stage: "segment".to_string(),
                message: "no chunks above minimum length".to_string(),
            });
        }

        let texts: Vec<String> = segments.iter().map(|s| s.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        if vectors.len() != segments.len() {
            return Err(DocqaError::Ingestion {
                stage: "embed".to_string(),
                message: format!(
                    "expected {} vectors, got {}",
                    segments.len(),
                    vectors.len()
                ),
            });
        }

        let mut chunks = Vec::with_capacity(segments.len());
        let mut records = Vec::with_capacity(segments.len());
        for (seg, vector) in segments.iter().zip(vectors) {
            let chunk_id = Uuid::new_v4();
            let vector_id = Uuid::new_v4().to_string();
            chunks.push(Chunk {
                id: chunk_id,
                document_id: doc.id,
                ord: seg.ord,
                text: seg.text.clone(),
                start_offset: seg.start_offset as i32,
                end_offset: seg.end_offset as i32,
                vector_id: vector_id.clone(),
                created_at: Utc::now(),
            });
            records.push(VectorRecord {
                id: vector_id,
                vector,
                payload: VectorPayload {
                    owner_id: doc.owner_id,
                    document_id: doc.id,
                    chunk_id,
                    ord: seg.ord,
                    text: seg.text.clone(),
                },
            });
        }

        self.index.upsert(records).await?;
        self.store.insert_chunks(&chunks).await?;
        Ok(chunks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingClientConfig;
    use crate::store::MemoryDocumentStore;
    use crate::vector::MemoryVectorIndex;
    use async_trait::async_trait;
    use docqa_core::DocumentStatus;
    use docqa_llm::EmbedModel;
    use std::io::Write;
    use std::time::Duration;

    struct HashEmbed;

    #[async_trait]
    impl EmbedModel for HashEmbed {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; 8];
                    for ch in t.chars() {
                        v[(ch as usize) % 8] += 1.0;
                    }
                    v
                })
                .collect())
        }
    }

    fn orchestrator(
        store: Arc<MemoryDocumentStore>,
        index: Arc<MemoryVectorIndex>,
    ) -> IngestionOrchestrator {
        IngestionOrchestrator::new(
            store,
            EmbeddingClient::new(
                Arc::new(HashEmbed),
                EmbeddingClientConfig {
                    group_size: 5,
                    pace: Duration::ZERO,
                },
            ),
            index,
            SegmenterConfig::default(),
        )
    }

    fn write_temp(content: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content).unwrap();
        f
    }

    fn prose() -> String {
        (0..60)
            .map(|i| format!("Fact number {} about the storage subsystem and its design. ", i))
            .collect()
    }

    #[tokio::test]
    async fn successful_ingest_completes_document() {
        let store = Arc::new(MemoryDocumentStore::new());
        let index = Arc::new(MemoryVectorIndex::new());
        let orch = orchestrator(store.clone(), index.clone());

        let file = write_temp(prose().as_bytes());
        let path = file.into_temp_path().keep().unwrap();
        let doc = Document::new(
            Uuid::new_v4(),
            "facts.txt".to_string(),
            0,
            "text/plain".to_string(),
        );
        store.create_document(&doc).await.unwrap();

        orch.ingest_file(&doc, &path).await;

        let loaded = store.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DocumentStatus::Completed);
        assert!(loaded.chunk_count >= 2);
        assert_eq!(index.len().await, loaded.chunk_count as usize);
        // 临时文件已清理
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn empty_document_fails_with_reason() {
        let store = Arc::new(MemoryDocumentStore::new());
        let index = Arc::new(MemoryVectorIndex::new());
        let orch = orchestrator(store.clone(), index.clone());

        let file = write_temp(b"   \n\n  ");
        let path = file.into_temp_path().keep().unwrap();
        let doc = Document::new(
            Uuid::new_v4(),
            "empty.txt".to_string(),
            0,
            "text/plain".to_string(),
        );
        store.create_document(&doc).await.unwrap();

        orch.ingest_file(&doc, &path).await;

        let loaded = store.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DocumentStatus::Failed);
        assert!(loaded.error.unwrap().contains("no extractable text"));
        assert!(index.is_empty().await);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unsupported_media_type_fails_and_cleans_up() {
        let store = Arc::new(MemoryDocumentStore::new());
        let index = Arc::new(MemoryVectorIndex::new());
        let orch = orchestrator(store.clone(), index.clone());

        let file = write_temp(b"binary blob");
        let path = file.into_temp_path().keep().unwrap();
        let doc = Document::new(
            Uuid::new_v4(),
            "blob.bin".to_string(),
            0,
            "application/octet-stream".to_string(),
        );
        store.create_document(&doc).await.unwrap();

        orch.ingest_file(&doc, &path).await;

        let loaded = store.get_document(doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, DocumentStatus::Failed);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn ingested_chunks_are_searchable_by_owner() {
        let store = Arc::new(MemoryDocumentStore::new());
        let index = Arc::new(MemoryVectorIndex::new());
        let orch = orchestrator(store.clone(), index.clone());

        let file = write_temp(prose().as_bytes());
        let path = file.into_temp_path().keep().unwrap();
        let owner = Uuid::new_v4();
        let doc = Document::new(owner, "facts.txt".to_string(), 0, "text/plain".to_string());
        store.create_document(&doc).await.unwrap();
        orch.ingest_file(&doc, &path).await;

        let query_vec = HashEmbed
            .embed(&["Fact number 3 about the storage subsystem".to_string()])
            .await
            .unwrap()
            .remove(0);
        let hits = index.search(&query_vec, owner, 5).await.unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.payload.document_id == doc.id));
    }
}
