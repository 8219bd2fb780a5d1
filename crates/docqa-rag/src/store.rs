//! 文档与会话存储
//!
//! 元数据落库走这个 trait;生产环境由 api 侧的 Postgres 实现接入,
//! 这里自带一个进程内实现供测试与单机部署使用。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use docqa_core::{Chunk, Conversation, Document, DocumentStatus, Message};
use docqa_error::{DocqaError, Result};

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_document(&self, doc: &Document) -> Result<()>;

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>>;

    async fn list_documents(&self, owner_id: Uuid) -> Result<Vec<Document>>;

    /// 入库成功,记录块数
    async fn mark_completed(&self, id: Uuid, chunk_count: i32) -> Result<()>;

    /// 入库失败,记录原因
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()>;

    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()>;

    /// 删除文档及其块
    async fn delete_document(&self, id: Uuid) -> Result<()>;

    async fn create_conversation(&self, conversation: &Conversation) -> Result<()>;

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>>;

    async fn append_messages(&self, conversation_id: Uuid, messages: &[Message]) -> Result<()>;

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>>;
}

#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<Uuid, Document>>,
    chunks: RwLock<HashMap<Uuid, Vec<Chunk>>>,
    conversations: RwLock<HashMap<Uuid, Conversation>>,
    messages: RwLock<HashMap<Uuid, Vec<Message>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn create_document(&self, doc: &Document) -> Result<()> {
        self.documents.write().await.insert(doc.id, doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        Ok(self.documents.read().await.get(&id).cloned())
    }

    async fn list_documents(&self, owner_id: Uuid) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = self
            .documents
            .read()
            .await
            .values()
            .filter(|d| d.owner_id == owner_id)
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(docs)
    }

    async fn mark_completed(&self, id: Uuid, chunk_count: i32) -> Result<()> {
        let mut docs = self.documents.write().await;
        let doc = docs.get_mut(&id).ok_or_else(|| DocqaError::NotFound {
            resource: format!("document {}", id),
        })?;
        doc.status = DocumentStatus::Completed;
        doc.chunk_count = chunk_count;
        doc.error = None;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        let mut docs = self.documents.write().await;
        let doc = docs.get_mut(&id).ok_or_else(|| DocqaError::NotFound {
            resource: format!("document {}", id),
        })?;
        doc.status = DocumentStatus::Failed;
        doc.error = Some(error.to_string());
        Ok(())
    }

    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut map = self.chunks.write().await;
        for chunk in chunks {
            map.entry(chunk.document_id).or_default().push(chunk.clone());
        }
        Ok(())
    }

    async fn delete_document(&self, id: Uuid) -> Result<()> {
        self.documents.write().await.remove(&id);
        self.chunks.write().await.remove(&id);
        Ok(())
    }

    async fn create_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.conversations
            .write()
            .await
            .insert(conversation.id, conversation.clone());
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        Ok(self.conversations.read().await.get(&id).cloned())
    }

    async fn append_messages(&self, conversation_id: Uuid, messages: &[Message]) -> Result<()> {
        let mut map = self.messages.write().await;
        map.entry(conversation_id)
            .or_default()
            .extend(messages.iter().cloned());
        Ok(())
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        Ok(self
            .messages
            .read()
            .await
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}
