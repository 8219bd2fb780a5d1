//! 查询编排
//!
//! 一次查询:嵌入 → 语义缓存 → 配额检查 → 向量检索 → 生成 → 记账。
//! 缓存命中直接返回且不计配额;带自备 api_key 的请求不走配额;
//! 台账读取失败放行(fail-open),生成成功后才计数。
//! 流式版把各阶段进展作为带标签的事件发到通道,调用方按序消费。

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{instrument, warn};
use uuid::Uuid;

use docqa_core::{CacheEntry, Message, QueryRequest, QueryResponse, SourceCitation};
use docqa_error::{DocqaError, Result};

use crate::cache::SemanticCache;
use crate::embedding::EmbeddingClient;
use crate::generation::GenerationClient;
use crate::store::DocumentStore;
use crate::usage::UsageLedger;
use crate::vector::{VectorIndex, VectorMatch, DEFAULT_TOP_K};

/// 检索为空时的固定回答,同样会进缓存
pub const NO_CONTEXT_ANSWER: &str =
    "I could not find relevant information in your documents to answer this question.";

const SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct QueryConfig {
    pub top_k: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self { top_k: DEFAULT_TOP_K }
    }
}

/// 流式查询的事件流。`Complete` 与 `Error` 互斥且各自至多出现一次,
/// 出现后通道随即关闭。
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryEvent {
    Status { stage: String },
    Sources { sources: Vec<SourceCitation> },
    Chunk { text: String },
    Complete { response: QueryResponse },
    Error { code: String, message: String },
}

pub struct QueryOrchestrator {
    embedder: EmbeddingClient,
    index: Arc<dyn VectorIndex>,
    cache: Arc<SemanticCache>,
    generation: Arc<GenerationClient>,
    ledger: Arc<dyn UsageLedger>,
    store: Arc<dyn DocumentStore>,
    cfg: QueryConfig,
}

impl QueryOrchestrator {
    pub fn new(
        embedder: EmbeddingClient,
        index: Arc<dyn VectorIndex>,
        cache: Arc<SemanticCache>,
        generation: Arc<GenerationClient>,
        ledger: Arc<dyn UsageLedger>,
        store: Arc<dyn DocumentStore>,
        cfg: QueryConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            cache,
            generation,
            ledger,
            store,
            cfg,
        }
    }

    /// 非流式查询
    #[instrument(skip(self, req), fields(owner_id = %owner_id))]
    pub async fn query(&self, owner_id: Uuid, req: &QueryRequest) -> Result<QueryResponse> {
        let started = std::time::Instant::now();
        let query_vector = self.embedder.embed_one(&req.query).await?;

        if let Some(hit) = self.cache.lookup(owner_id, &query_vector).await {
            return Ok(QueryResponse {
                answer: hit.answer,
                sources: hit.sources,
                cached: true,
                latency_ms: started.elapsed().as_millis() as i64,
            });
        }

        self.check_quota(owner_id, req).await?;

        let matches = self.search(owner_id, req, &query_vector).await?;
        if matches.is_empty() {
            let response = QueryResponse {
                answer: NO_CONTEXT_ANSWER.to_string(),
                sources: Vec::new(),
                cached: false,
                latency_ms: started.elapsed().as_millis() as i64,
            };
            self.finish(owner_id, req, &query_vector, &response, false)
                .await;
            return Ok(response);
        }

        let sources = self.citations(&matches).await;
        let passages: Vec<String> = matches.iter().map(|m| m.payload.text.clone()).collect();
        let answer = self.generation.generate(&req.query, &passages).await?;

        let response = QueryResponse {
            answer,
            sources,
            cached: false,
            latency_ms: started.elapsed().as_millis() as i64,
        };
        self.finish(owner_id, req, &query_vector, &response, true)
            .await;
        Ok(response)
    }

    /// 流式查询。事件顺序:`Status` → (`Sources` → `Chunk`*)? →
    /// `Complete` | `Error`。
    pub async fn query_stream(
        self: Arc<Self>,
        owner_id: Uuid,
        req: QueryRequest,
    ) -> mpsc::Receiver<QueryEvent> {
        let (tx, rx) = mpsc::channel(32);
        let orch = self;
        tokio::spawn(async move {
            orch.run_stream(owner_id, req, tx).await;
        });
        rx
    }

    async fn run_stream(&self, owner_id: Uuid, req: QueryRequest, tx: mpsc::Sender<QueryEvent>) {
        let started = std::time::Instant::now();
        let send = |ev: QueryEvent| {
            let tx = tx.clone();
            async move { tx.send(ev).await.is_ok() }
        };

        if !send(QueryEvent::Status {
            stage: "searching".to_string(),
        })
        .await
        {
            return;
        }

        let query_vector = match self.embedder.embed_one(&req.query).await {
            Ok(v) => v,
            Err(e) => {
                send(error_event(&e)).await;
                return;
            }
        };

        if let Some(hit) = self.cache.lookup(owner_id, &query_vector).await {
            let response = QueryResponse {
                answer: hit.answer.clone(),
                sources: hit.sources.clone(),
                cached: true,
                latency_ms: started.elapsed().as_millis() as i64,
            };
            if send(QueryEvent::Sources {
                sources: hit.sources,
            })
            .await
                && send(QueryEvent::Chunk { text: hit.answer }).await
            {
                send(QueryEvent::Complete { response }).await;
            }
            return;
        }

        if let Err(e) = self.check_quota(owner_id, &req).await {
            send(error_event(&e)).await;
            return;
        }

        let matches = match self.search(owner_id, &req, &query_vector).await {
            Ok(m) => m,
            Err(e) => {
                send(error_event(&e)).await;
                return;
            }
        };

        if matches.is_empty() {
            let response = QueryResponse {
                answer: NO_CONTEXT_ANSWER.to_string(),
                sources: Vec::new(),
                cached: false,
                latency_ms: started.elapsed().as_millis() as i64,
            };
            self.finish(owner_id, &req, &query_vector, &response, false)
                .await;
            if send(QueryEvent::Sources {
                sources: Vec::new(),
            })
            .await
                && send(QueryEvent::Chunk {
                    text: NO_CONTEXT_ANSWER.to_string(),
                })
                .await
            {
                send(QueryEvent::Complete { response }).await;
            }
            return;
        }

        let sources = self.citations(&matches).await;
        if !send(QueryEvent::Sources {
            sources: sources.clone(),
        })
        .await
        {
            return;
        }
        if !send(QueryEvent::Status {
            stage: "generating".to_string(),
        })
        .await
        {
            return;
        }

        let passages: Vec<String> = matches.iter().map(|m| m.payload.text.clone()).collect();
        let mut fragments = match self.generation.generate_streaming(&req.query, &passages).await {
            Ok(rx) => rx,
            Err(e) => {
                send(error_event(&e)).await;
                return;
            }
        };

        let mut answer = String::new();
        while let Some(item) = fragments.recv().await {
            match item {
                Ok(text) => {
                    answer.push_str(&text);
                    if !send(QueryEvent::Chunk { text }).await {
                        return;
                    }
                }
                Err(e) => {
                    // 失败的生成不进缓存也不计账
                    send(error_event(&e)).await;
                    return;
                }
            }
        }

        let response = QueryResponse {
            answer,
            sources,
            cached: false,
            latency_ms: started.elapsed().as_millis() as i64,
        };
        self.finish(owner_id, &req, &query_vector, &response, true)
            .await;
        send(QueryEvent::Complete { response }).await;
    }

    /// 缓存命中之后、检索之前做配额检查。台账不可用时放行。
    async fn check_quota(&self, owner_id: Uuid, req: &QueryRequest) -> Result<()> {
        if req.api_key.is_some() {
            // 自备凭证,不计平台配额
            return Ok(());
        }
        match self.ledger.usage(owner_id).await {
            Ok(report) if report.remaining == 0 => Err(DocqaError::QuotaExceeded {
                limit: report.limit,
                resets_at: report.resets_at,
            }),
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(%owner_id, error = %e, "usage ledger unavailable, failing open");
                Ok(())
            }
        }
    }

    async fn search(
        &self,
        owner_id: Uuid,
        req: &QueryRequest,
        query_vector: &[f32],
    ) -> Result<Vec<VectorMatch>> {
        let top_k = req.top_k.map(|k| k as usize).unwrap_or(self.cfg.top_k);
        self.index.search(query_vector, owner_id, top_k).await
    }

    /// 引用要带文件名,查不到就留空,不因元数据缺失毁掉整个回答
    async fn file_name(&self, document_id: Uuid) -> String {
        match self.store.get_document(document_id).await {
            Ok(Some(doc)) => doc.file_name,
            _ => String::new(),
        }
    }

    async fn citations(&self, matches: &[VectorMatch]) -> Vec<SourceCitation> {
        let mut sources = Vec::with_capacity(matches.len());
        for m in matches {
            sources.push(SourceCitation {
                document_id: m.payload.document_id.to_string(),
                chunk_id: m.payload.chunk_id.to_string(),
                file_name: self.file_name(m.payload.document_id).await,
                snippet: snippet(&m.payload.text),
                score: m.score,
            });
        }
        sources
    }

    /// 成功路径的收尾:写缓存、计账、落会话。都不影响已产出的回答。
    async fn finish(
        &self,
        owner_id: Uuid,
        req: &QueryRequest,
        query_vector: &[f32],
        response: &QueryResponse,
        metered: bool,
    ) {
        self.cache
            .store(
                owner_id,
                CacheEntry {
                    query: req.query.clone(),
                    answer: response.answer.clone(),
                    sources: response.sources.clone(),
                    embedding: query_vector.to_vec(),
                    created_at: chrono::Utc::now(),
                },
            )
            .await;

        if metered && req.api_key.is_none() {
            if let Err(e) = self.ledger.record(owner_id).await {
                warn!(%owner_id, error = %e, "failed to record usage");
            }
        }

        if let Some(conversation_id) = req.conversation_id {
            // 会话归属校验:别人的会话只记日志,不落消息
            match self.store.get_conversation(conversation_id).await {
                Ok(Some(conv)) if conv.owner_id == owner_id => {}
                Ok(_) => {
                    warn!(%owner_id, %conversation_id, "conversation missing or owned by another user, dropping turn");
                    return;
                }
                Err(e) => {
                    warn!(%conversation_id, error = %e, "failed to load conversation, dropping turn");
                    return;
                }
            }
            let now = chrono::Utc::now();
            let messages = [
                Message {
                    id: Uuid::new_v4(),
                    conversation_id,
                    role: "user".to_string(),
                    content: req.query.clone(),
                    created_at: now,
                },
                Message {
                    id: Uuid::new_v4(),
                    conversation_id,
                    role: "assistant".to_string(),
                    content: response.answer.clone(),
                    created_at: now,
                },
            ];
            if let Err(e) = self.store.append_messages(conversation_id, &messages).await {
                warn!(%conversation_id, error = %e, "failed to persist conversation turn");
            }
        }
    }
}

fn snippet(text: &str) -> String {
    if text.chars().count() <= SNIPPET_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(SNIPPET_CHARS).collect();
    out.push('…');
    out
}

fn error_event(e: &DocqaError) -> QueryEvent {
    let code = match e {
        DocqaError::QuotaExceeded { .. } => "limit_reached",
        DocqaError::ServiceUnavailable { .. } => "service_unavailable",
        DocqaError::Timeout { .. } => "timeout",
        _ => "internal",
    };
    QueryEvent::Error {
        code: code.to_string(),
        message: e.user_message(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SemanticCacheConfig;
    use crate::embedding::EmbeddingClientConfig;
    use crate::store::MemoryDocumentStore;
    use crate::usage::MemoryUsageLedger;
    use crate::vector::{MemoryVectorIndex, VectorPayload, VectorRecord};
    use async_trait::async_trait;
    use docqa_llm::{ChatModel, EmbedModel};
    use std::time::Duration;

    /// 字符桶计数向量:相同文本得到相同向量,字符集不相交的文本正交
    struct HashEmbed;

    #[async_trait]
    impl EmbedModel for HashEmbed {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; 16];
                    for ch in t.chars() {
                        v[(ch as usize) % 16] += 1.0;
                    }
                    v
                })
                .collect())
        }
    }

    struct FixedChat;

    #[async_trait]
    impl ChatModel for FixedChat {
        async fn chat(&self, _system: &str, _user: &str) -> Result<String> {
            Ok("generated answer".to_string())
        }

        async fn chat_stream(
            &self,
            _system: &str,
            _user: &str,
        ) -> Result<mpsc::Receiver<Result<String>>> {
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                for part in ["generated ", "answer"] {
                    if tx.send(Ok(part.to_string())).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }

    struct Fixture {
        orch: Arc<QueryOrchestrator>,
        index: Arc<MemoryVectorIndex>,
        store: Arc<MemoryDocumentStore>,
        ledger: Arc<MemoryUsageLedger>,
        owner: Uuid,
    }

    fn fixture(daily_limit: u32) -> Fixture {
        let index = Arc::new(MemoryVectorIndex::new());
        let store = Arc::new(MemoryDocumentStore::new());
        let ledger = Arc::new(MemoryUsageLedger::new(daily_limit));
        let cache = Arc::new(
            SemanticCache::new(None, SemanticCacheConfig::default()).unwrap(),
        );
        let embedder = EmbeddingClient::new(
            Arc::new(HashEmbed),
            EmbeddingClientConfig {
                group_size: 5,
                pace: Duration::ZERO,
            },
        );
        let orch = Arc::new(QueryOrchestrator::new(
            embedder,
            index.clone(),
            cache,
            Arc::new(GenerationClient::new(Arc::new(FixedChat))),
            ledger.clone(),
            store.clone(),
            QueryConfig::default(),
        ));
        Fixture {
            orch,
            index,
            store,
            ledger,
            owner: Uuid::new_v4(),
        }
    }

    async fn seed_document(fx: &Fixture, text: &str) -> Uuid {
        let doc = docqa_core::Document::new(
            fx.owner,
            "seed.txt".to_string(),
            0,
            "text/plain".to_string(),
        );
        fx.store.create_document(&doc).await.unwrap();
        let vector = HashEmbed.embed(&[text.to_string()]).await.unwrap().remove(0);
        fx.index
            .upsert(vec![VectorRecord {
                id: Uuid::new_v4().to_string(),
                vector,
                payload: VectorPayload {
                    owner_id: fx.owner,
                    document_id: doc.id,
                    chunk_id: Uuid::new_v4(),
                    ord: 0,
                    text: text.to_string(),
                },
            }])
            .await
            .unwrap();
        doc.id
    }

    fn request(query: &str) -> QueryRequest {
        QueryRequest {
            query: query.to_string(),
            top_k: None,
            conversation_id: None,
            api_key: None,
        }
    }

    #[tokio::test]
    async fn query_returns_answer_with_citations() {
        let fx = fixture(10);
        let doc_id = seed_document(&fx, "the capital of France is Paris").await;

        let resp = fx
            .orch
            .query(fx.owner, &request("the capital of France"))
            .await
            .unwrap();
        assert_eq!(resp.answer, "generated answer");
        assert!(!resp.cached);
        assert!(!resp.sources.is_empty());
        assert_eq!(resp.sources[0].document_id, doc_id.to_string());
        assert_eq!(resp.sources[0].file_name, "seed.txt");
    }

    #[tokio::test]
    async fn repeated_query_hits_cache_and_skips_quota() {
        let fx = fixture(10);
        seed_document(&fx, "the capital of France is Paris").await;

        let first = fx
            .orch
            .query(fx.owner, &request("the capital of France"))
            .await
            .unwrap();
        assert!(!first.cached);
        assert_eq!(fx.ledger.usage(fx.owner).await.unwrap().used, 1);

        let second = fx
            .orch
            .query(fx.owner, &request("the capital of France"))
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(second.answer, first.answer);
        // 命中缓存不计配额
        assert_eq!(fx.ledger.usage(fx.owner).await.unwrap().used, 1);
    }

    #[tokio::test]
    async fn empty_index_gives_canned_answer() {
        let fx = fixture(10);
        let resp = fx.orch.query(fx.owner, &request("anything")).await.unwrap();
        assert_eq!(resp.answer, NO_CONTEXT_ANSWER);
        assert!(resp.sources.is_empty());
        assert!(!resp.cached);
        // 固定回答不经过生成,不计配额
        assert_eq!(fx.ledger.usage(fx.owner).await.unwrap().used, 0);

        // 但会进缓存,重复提问直接命中
        let again = fx.orch.query(fx.owner, &request("anything")).await.unwrap();
        assert!(again.cached);
    }

    #[tokio::test]
    async fn quota_exhaustion_rejects_new_queries() {
        let fx = fixture(1);
        seed_document(&fx, "abcd efgh").await;

        fx.orch.query(fx.owner, &request("abcd")).await.unwrap();
        // 字符集不相交,既不命中缓存也不受检索影响
        let err = fx
            .orch
            .query(fx.owner, &request("wxyz"))
            .await
            .unwrap_err();
        assert!(matches!(err, DocqaError::QuotaExceeded { .. }));
    }

    #[tokio::test]
    async fn byo_credentials_bypass_quota() {
        let fx = fixture(1);
        seed_document(&fx, "abcd efgh").await;
        fx.orch.query(fx.owner, &request("abcd")).await.unwrap();

        let mut req = request("wxyz");
        req.api_key = Some("sk-user-key".to_string());
        let resp = fx.orch.query(fx.owner, &req).await.unwrap();
        assert_eq!(resp.answer, "generated answer");
        // 自备凭证的调用不计入台账
        assert_eq!(fx.ledger.usage(fx.owner).await.unwrap().used, 1);
    }

    #[tokio::test]
    async fn conversation_turn_is_persisted() {
        let fx = fixture(10);
        seed_document(&fx, "the capital of France is Paris").await;
        let conv = docqa_core::Conversation {
            id: Uuid::new_v4(),
            owner_id: fx.owner,
            title: None,
            created_at: chrono::Utc::now(),
        };
        fx.store.create_conversation(&conv).await.unwrap();

        let mut req = request("the capital of France");
        req.conversation_id = Some(conv.id);
        fx.orch.query(fx.owner, &req).await.unwrap();

        let messages = fx.store.list_messages(conv.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content, "generated answer");
    }

    #[tokio::test]
    async fn foreign_conversation_is_not_written_to() {
        let fx = fixture(10);
        seed_document(&fx, "the capital of France is Paris").await;
        let stranger = docqa_core::Conversation {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            title: None,
            created_at: chrono::Utc::now(),
        };
        fx.store.create_conversation(&stranger).await.unwrap();

        let mut req = request("the capital of France");
        req.conversation_id = Some(stranger.id);
        let resp = fx.orch.query(fx.owner, &req).await.unwrap();
        assert_eq!(resp.answer, "generated answer");

        // 回答照常,但别人的会话里不能多出消息
        let messages = fx.store.list_messages(stranger.id).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn snippets_are_truncated_with_ellipsis() {
        let fx = fixture(10);
        let long_text = format!("abc {}", "x".repeat(400));
        seed_document(&fx, &long_text).await;

        let resp = fx.orch.query(fx.owner, &request("abc x")).await.unwrap();
        let snippet = &resp.sources[0].snippet;
        assert_eq!(snippet.chars().count(), SNIPPET_CHARS + 1);
        assert!(snippet.ends_with('…'));
    }

    #[tokio::test]
    async fn stream_events_arrive_in_order() {
        let fx = fixture(10);
        seed_document(&fx, "the capital of France is Paris").await;

        let mut rx = fx
            .orch
            .clone()
            .query_stream(fx.owner, request("the capital of France"))
            .await;
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }

        assert!(matches!(events[0], QueryEvent::Status { .. }));
        let sources_pos = events
            .iter()
            .position(|e| matches!(e, QueryEvent::Sources { .. }))
            .unwrap();
        let first_chunk = events
            .iter()
            .position(|e| matches!(e, QueryEvent::Chunk { .. }))
            .unwrap();
        assert!(sources_pos < first_chunk);

        let completes = events
            .iter()
            .filter(|e| matches!(e, QueryEvent::Complete { .. }))
            .count();
        assert_eq!(completes, 1);
        assert!(matches!(events.last().unwrap(), QueryEvent::Complete { .. }));

        let answer: String = events
            .iter()
            .filter_map(|e| match e {
                QueryEvent::Chunk { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(answer, "generated answer");
        if let QueryEvent::Complete { response } = events.last().unwrap() {
            assert_eq!(response.answer, answer);
        }
    }

    #[tokio::test]
    async fn stream_reports_quota_error_exactly_once() {
        let fx = fixture(0);
        seed_document(&fx, "abcd efgh").await;

        let mut rx = fx.orch.clone().query_stream(fx.owner, request("abcd")).await;
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        let errors: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                QueryEvent::Error { code, .. } => Some(code.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec!["limit_reached".to_string()]);
        assert!(!events.iter().any(|e| matches!(e, QueryEvent::Complete { .. })));
    }
}
