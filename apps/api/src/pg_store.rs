//! Postgres 文档存储,启用 `pg` feature 时接入
//!
//! 迁移脚本在 deployments/migrations 下,启动时自动应用。
//! 块删除依赖外键级联,见 0001_init.sql。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use docqa_core::{Chunk, Conversation, Document, DocumentStatus, Message};
use docqa_error::{DocqaError, Result};
use docqa_rag::DocumentStore;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../deployments/migrations");

fn db_err(operation: &str, e: impl ToString) -> DocqaError {
    DocqaError::Database {
        operation: operation.to_string(),
        message: e.to_string(),
    }
}

pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| db_err("connect", e))?;
        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| db_err("migrate", e))?;
        Ok(Self { pool })
    }
}

fn status_from_str(s: &str) -> DocumentStatus {
    match s {
        "completed" => DocumentStatus::Completed,
        "failed" => DocumentStatus::Failed,
        _ => DocumentStatus::Processing,
    }
}

fn row_to_document(row: &sqlx::postgres::PgRow) -> Document {
    Document {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        file_name: row.get("file_name"),
        file_size: row.get("file_size"),
        media_type: row.get("media_type"),
        status: status_from_str(row.get::<&str, _>("status")),
        chunk_count: row.get("chunk_count"),
        error: row.get("error"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn create_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            "INSERT INTO documents (id, owner_id, file_name, file_size, media_type, status, chunk_count, error, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(doc.id)
        .bind(doc.owner_id)
        .bind(&doc.file_name)
        .bind(doc.file_size)
        .bind(&doc.media_type)
        .bind(doc.status.as_str())
        .bind(doc.chunk_count)
        .bind(&doc.error)
        .bind(doc.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("insert_document", e))?;
        Ok(())
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("get_document", e))?;
        Ok(row.as_ref().map(row_to_document))
    }

    async fn list_documents(&self, owner_id: Uuid) -> Result<Vec<Document>> {
        let rows =
            sqlx::query("SELECT * FROM documents WHERE owner_id = $1 ORDER BY created_at DESC")
                .bind(owner_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_err("list_documents", e))?;
        Ok(rows.iter().map(row_to_document).collect())
    }

    async fn mark_completed(&self, id: Uuid, chunk_count: i32) -> Result<()> {
        let result = sqlx::query(
            "UPDATE documents SET status = 'completed', chunk_count = $2, error = NULL WHERE id = $1",
        )
        .bind(id)
        .bind(chunk_count)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("mark_completed", e))?;
        if result.rows_affected() == 0 {
            return Err(DocqaError::NotFound {
                resource: format!("document {}", id),
            });
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE documents SET status = 'failed', error = $2 WHERE id = $1")
                .bind(id)
                .bind(error)
                .execute(&self.pool)
                .await
                .map_err(|e| db_err("mark_failed", e))?;
        if result.rows_affected() == 0 {
            return Err(DocqaError::NotFound {
                resource: format!("document {}", id),
            });
        }
        Ok(())
    }

    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("insert_chunks", e))?;
        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, ord, text, start_offset, end_offset, vector_id, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(chunk.id)
            .bind(chunk.document_id)
            .bind(chunk.ord)
            .bind(&chunk.text)
            .bind(chunk.start_offset)
            .bind(chunk.end_offset)
            .bind(&chunk.vector_id)
            .bind(chunk.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("insert_chunks", e))?;
        }
        tx.commit().await.map_err(|e| db_err("insert_chunks", e))?;
        Ok(())
    }

    async fn delete_document(&self, id: Uuid) -> Result<()> {
        // chunks 由外键级联删除
        sqlx::query("DELETE FROM documents WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("delete_document", e))?;
        Ok(())
    }

    async fn create_conversation(&self, conversation: &Conversation) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversations (id, owner_id, title, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(conversation.id)
        .bind(conversation.owner_id)
        .bind(&conversation.title)
        .bind(conversation.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("create_conversation", e))?;
        Ok(())
    }

    async fn get_conversation(&self, id: Uuid) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("get_conversation", e))?;
        Ok(row.map(|r| Conversation {
            id: r.get("id"),
            owner_id: r.get("owner_id"),
            title: r.get("title"),
            created_at: r.get("created_at"),
        }))
    }

    async fn append_messages(&self, conversation_id: Uuid, messages: &[Message]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("append_messages", e))?;
        for msg in messages {
            sqlx::query(
                "INSERT INTO messages (id, conversation_id, role, content, created_at) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(msg.id)
            .bind(conversation_id)
            .bind(&msg.role)
            .bind(&msg.content)
            .bind(msg.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("append_messages", e))?;
        }
        tx.commit().await.map_err(|e| db_err("append_messages", e))?;
        Ok(())
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = $1 ORDER BY created_at ASC, seq ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list_messages", e))?;
        Ok(rows
            .iter()
            .map(|r| Message {
                id: r.get("id"),
                conversation_id: r.get("conversation_id"),
                role: r.get("role"),
                content: r.get("content"),
                created_at: r.get("created_at"),
            })
            .collect())
    }
}
