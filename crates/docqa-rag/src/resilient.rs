//! 熔断装饰器
//!
//! 在构造期把熔断器包到提供方客户端外面,上层只见 trait 对象,
//! 不感知熔断的存在。每个外部依赖一个独立熔断器实例,互不影响。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use docqa_error::Result;
use docqa_llm::{ChatModel, EmbedModel};

use crate::breaker::CircuitBreaker;
use crate::vector::{VectorIndex, VectorMatch, VectorRecord};

pub struct ResilientEmbedModel {
    inner: Arc<dyn EmbedModel>,
    breaker: Arc<CircuitBreaker>,
}

impl ResilientEmbedModel {
    pub fn new(inner: Arc<dyn EmbedModel>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }
}

#[async_trait]
impl EmbedModel for ResilientEmbedModel {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.breaker.call(self.inner.embed(texts)).await
    }
}

pub struct ResilientChatModel {
    inner: Arc<dyn ChatModel>,
    breaker: Arc<CircuitBreaker>,
}

impl ResilientChatModel {
    pub fn new(inner: Arc<dyn ChatModel>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }
}

#[async_trait]
impl ChatModel for ResilientChatModel {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        self.breaker.call(self.inner.chat(system, user)).await
    }

    /// 熔断器只对建立流的调用计时;流建立后的中途失败
    /// 通过转发任务补记为一次失败。
    async fn chat_stream(
        &self,
        system: &str,
        user: &str,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let mut inner_rx = self
            .breaker
            .call(self.inner.chat_stream(system, user))
            .await?;
        let (tx, rx) = mpsc::channel(32);
        let breaker = self.breaker.clone();
        tokio::spawn(async move {
            while let Some(item) = inner_rx.recv().await {
                let failed = item.is_err();
                if tx.send(item).await.is_err() {
                    return;
                }
                if failed {
                    breaker.record_stream_failure().await;
                    return;
                }
            }
        });
        Ok(rx)
    }
}

pub struct ResilientVectorIndex {
    inner: Arc<dyn VectorIndex>,
    breaker: Arc<CircuitBreaker>,
}

impl ResilientVectorIndex {
    pub fn new(inner: Arc<dyn VectorIndex>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }
}

#[async_trait]
impl VectorIndex for ResilientVectorIndex {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<()> {
        self.breaker.call(self.inner.upsert(records)).await
    }

    async fn search(
        &self,
        vector: &[f32],
        owner_id: Uuid,
        top_k: usize,
    ) -> Result<Vec<VectorMatch>> {
        self.breaker
            .call(self.inner.search(vector, owner_id, top_k))
            .await
    }

    async fn delete_by_document(&self, document_id: Uuid) -> Result<()> {
        self.breaker
            .call(self.inner.delete_by_document(document_id))
            .await
    }

    async fn delete_by_owner(&self, owner_id: Uuid) -> Result<()> {
        self.breaker.call(self.inner.delete_by_owner(owner_id)).await
    }

    async fn delete_all(&self) -> Result<()> {
        self.breaker.call(self.inner.delete_all()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, BreakerState};
    use docqa_error::DocqaError;

    struct FlakyEmbed;

    #[async_trait]
    impl EmbedModel for FlakyEmbed {
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(DocqaError::EmbeddingService {
                provider: "fake".to_string(),
                message: "down".to_string(),
                retry_after: None,
            })
        }
    }

    struct StreamFailChat;

    #[async_trait]
    impl ChatModel for StreamFailChat {
        async fn chat(&self, _system: &str, _user: &str) -> Result<String> {
            Ok("ok".to_string())
        }

        async fn chat_stream(
            &self,
            _system: &str,
            _user: &str,
        ) -> Result<mpsc::Receiver<Result<String>>> {
            let (tx, rx) = mpsc::channel(4);
            tokio::spawn(async move {
                let _ = tx.send(Ok("partial".to_string())).await;
                let _ = tx
                    .send(Err(DocqaError::LlmService {
                        provider: "fake".to_string(),
                        message: "mid-stream".to_string(),
                        retry_after: None,
                    }))
                    .await;
            });
            Ok(rx)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_provider_failures_open_the_breaker() {
        let breaker = Arc::new(CircuitBreaker::new(
            "embed",
            BreakerConfig {
                volume_threshold: 3,
                ..BreakerConfig::default()
            },
        ));
        let model = ResilientEmbedModel::new(Arc::new(FlakyEmbed), breaker.clone());
        for _ in 0..3 {
            let _ = model.embed(&["x".to_string()]).await;
        }
        assert_eq!(breaker.state().await, BreakerState::Open);
        // 打开后短路,不再触达提供方
        let err = model.embed(&["x".to_string()]).await.unwrap_err();
        assert!(matches!(err, DocqaError::ServiceUnavailable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn mid_stream_failure_is_recorded() {
        let breaker = Arc::new(CircuitBreaker::new(
            "chat",
            BreakerConfig {
                volume_threshold: 2,
                ..BreakerConfig::default()
            },
        ));
        let model = ResilientChatModel::new(Arc::new(StreamFailChat), breaker.clone());
        let mut rx = model.chat_stream("sys", "user").await.unwrap();
        assert!(rx.recv().await.unwrap().is_ok());
        assert!(rx.recv().await.unwrap().is_err());
        assert!(rx.recv().await.is_none());
        // 建立成功 1 次 + 中途失败 1 次,失败率 50% 达阈值
        assert_eq!(breaker.state().await, BreakerState::Open);
    }
}
