//! 批量嵌入客户端
//!
//! 入库时把分段文本按固定大小分组,组内并发请求,组间加固定间隔
//! 避免触发提供方限流。任何一段失败则整批失败,保证向量数与
//! 分段数一一对应。

use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tracing::instrument;

use docqa_error::{DocqaError, Result};
use docqa_llm::EmbedModel;

#[derive(Debug, Clone)]
pub struct EmbeddingClientConfig {
    /// 组内并发请求数
    pub group_size: usize,
    /// 组间停顿
    pub pace: Duration,
}

impl Default for EmbeddingClientConfig {
    fn default() -> Self {
        Self {
            group_size: 5,
            pace: Duration::from_millis(300),
        }
    }
}

#[derive(Clone)]
pub struct EmbeddingClient {
    model: Arc<dyn EmbedModel>,
    cfg: EmbeddingClientConfig,
}

impl EmbeddingClient {
    pub fn new(model: Arc<dyn EmbedModel>, cfg: EmbeddingClientConfig) -> Self {
        Self { model, cfg }
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let text = text.to_string();
        let vectors = self.model.embed(std::slice::from_ref(&text)).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| DocqaError::EmbeddingService {
                provider: "embedding_client".to_string(),
                message: "provider returned no vector".to_string(),
                retry_after: None,
            })
    }

    /// 全部成功才返回,结果顺序与输入一致
    #[instrument(skip(self, texts), fields(count = texts.len()))]
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        for (group_idx, group) in texts.chunks(self.cfg.group_size.max(1)).enumerate() {
            if group_idx > 0 && !self.cfg.pace.is_zero() {
                tokio::time::sleep(self.cfg.pace).await;
            }
            let futures = group.iter().map(|text| async move {
                let vectors = self.model.embed(std::slice::from_ref(text)).await?;
                vectors
                    .into_iter()
                    .next()
                    .ok_or_else(|| DocqaError::EmbeddingService {
                        provider: "embedding_client".to_string(),
                        message: "provider returned no vector".to_string(),
                        retry_after: None,
                    })
            });
            out.extend(try_join_all(futures).await?);
        }

        // 维度必须一致,否则索引写入会悄悄损坏检索质量
        if let Some(first) = out.first() {
            let dim = first.len();
            if out.iter().any(|v| v.len() != dim) {
                return Err(DocqaError::EmbeddingService {
                    provider: "embedding_client".to_string(),
                    message: "inconsistent embedding dimensions in batch".to_string(),
                    retry_after: None,
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct CountingEmbed {
        calls: AtomicU32,
        seen: Mutex<Vec<String>>,
    }

    impl CountingEmbed {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EmbedModel for CountingEmbed {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().extend(texts.iter().cloned());
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    struct FailingEmbed;

    #[async_trait]
    impl EmbedModel for FailingEmbed {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if texts.iter().any(|t| t.contains("poison")) {
                return Err(DocqaError::EmbeddingService {
                    provider: "fake".to_string(),
                    message: "boom".to_string(),
                    retry_after: None,
                });
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn no_pace() -> EmbeddingClientConfig {
        EmbeddingClientConfig {
            group_size: 5,
            pace: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn batch_preserves_order_and_count() {
        let model = Arc::new(CountingEmbed::new());
        let client = EmbeddingClient::new(model.clone(), no_pace());
        let texts: Vec<String> = (0..12).map(|i| "x".repeat(i + 1)).collect();
        let vectors = client.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 12);
        for (i, v) in vectors.iter().enumerate() {
            assert_eq!(v[0], (i + 1) as f32);
        }
        // 每段一个请求
        assert_eq!(model.calls.load(Ordering::SeqCst), 12);
        assert_eq!(*model.seen.lock().unwrap(), texts);
    }

    #[tokio::test]
    async fn any_failure_fails_the_whole_batch() {
        let client = EmbeddingClient::new(Arc::new(FailingEmbed), no_pace());
        let texts = vec![
            "fine".to_string(),
            "poison pill".to_string(),
            "also fine".to_string(),
        ];
        let err = client.embed_batch(&texts).await.unwrap_err();
        assert!(matches!(err, DocqaError::EmbeddingService { .. }));
    }

    #[tokio::test]
    async fn empty_batch_is_a_noop() {
        let client = EmbeddingClient::new(Arc::new(CountingEmbed::new()), no_pace());
        let vectors = client.embed_batch(&[]).await.unwrap();
        assert!(vectors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn groups_are_paced() {
        let model = Arc::new(CountingEmbed::new());
        let client = EmbeddingClient::new(
            model.clone(),
            EmbeddingClientConfig {
                group_size: 5,
                pace: Duration::from_millis(300),
            },
        );
        let texts: Vec<String> = (0..7).map(|i| format!("t{}", i)).collect();
        let started = tokio::time::Instant::now();
        client.embed_batch(&texts).await.unwrap();
        // 两组之间应有一次 300ms 停顿
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn embed_one_returns_single_vector() {
        let client = EmbeddingClient::new(Arc::new(CountingEmbed::new()), no_pace());
        let v = client.embed_one("abc").await.unwrap();
        assert_eq!(v, vec![3.0, 1.0]);
    }
}
