use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Multipart, Path, State},
    http::HeaderMap,
    response::sse::{Event, Sse},
    routing::{delete, get, post},
    Json, Router,
};
use dotenv::dotenv;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use docqa_core::{Conversation, Document, Message, QueryRequest, QueryResponse, UsageReport};
use docqa_error::DocqaError;
use docqa_llm::{make_providers, ChatModel, ChatProviderConfig, EmbedModel, EmbedProviderConfig};
use docqa_rag::{
    extract, BreakerConfig, CircuitBreaker, DocumentStore, EmbeddingClient, EmbeddingClientConfig,
    GenerationClient, IngestionOrchestrator, MemoryDocumentStore, MemoryUsageLedger,
    MemoryVectorIndex, QdrantVectorIndex, QueryConfig, QueryEvent, QueryOrchestrator,
    RedisUsageLedger, ResilientChatModel, ResilientEmbedModel, ResilientVectorIndex,
    SegmenterConfig, SemanticCache, SemanticCacheConfig, UsageLedger, VectorIndex,
};

#[cfg(feature = "pg")]
mod pg_store;

// ===============
// 配置
// ===============

#[derive(Debug, Clone, Deserialize)]
struct ServerConfig {
    host: String,
    port: u16,
}

#[derive(Debug, Clone, Deserialize)]
struct ProviderConfig {
    kind: String,
    base_url: Option<String>,
    api_key_env: Option<String>,
    model: String,
    dim: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct VectorStoreConfig {
    kind: String, // qdrant | memory
    url: Option<String>,
    collection: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CacheConfig {
    similarity_threshold: Option<f32>,
    ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct LimitsConfig {
    daily_generations: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct AppConfig {
    server: ServerConfig,
    chat_provider: ProviderConfig,
    embedding_provider: ProviderConfig,
    vector_store: VectorStoreConfig,
    cache: Option<CacheConfig>,
    segmenter: Option<SegmenterConfig>,
    limits: Option<LimitsConfig>,
    uploads_dir: Option<String>,
}

fn load_config() -> anyhow::Result<AppConfig> {
    let s = std::fs::read_to_string("configs/default.yaml")?;
    let cfg: AppConfig = serde_yaml::from_str(&s)?;
    info!("load_config: {:?}", cfg);
    Ok(cfg)
}

fn read_env(key: &str) -> anyhow::Result<String> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("missing env {}", key))
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};
    let fmt_layer = fmt::layer().with_target(false);
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,tower_http=info"))
        .unwrap();
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

// ===============
// 应用状态
// ===============

#[derive(Clone)]
struct AppState {
    store: Arc<dyn DocumentStore>,
    index: Arc<dyn VectorIndex>,
    ledger: Arc<dyn UsageLedger>,
    ingest: Arc<IngestionOrchestrator>,
    query: Arc<QueryOrchestrator>,
    uploads_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenv().ok();

    let cfg = load_config()?;

    // Providers
    let chat_cfg = match cfg.chat_provider.kind.as_str() {
        "openai_compat" => ChatProviderConfig::OpenAiCompat {
            base_url: cfg
                .chat_provider
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".into()),
            api_key: read_env(
                cfg.chat_provider
                    .api_key_env
                    .as_deref()
                    .unwrap_or("OPENAI_API_KEY"),
            )?,
            model: cfg.chat_provider.model.clone(),
        },
        "deepseek" => ChatProviderConfig::DeepSeek {
            base_url: cfg.chat_provider.base_url.clone(),
            api_key: read_env(
                cfg.chat_provider
                    .api_key_env
                    .as_deref()
                    .unwrap_or("DEEPSEEK_API_KEY"),
            )?,
            model: cfg.chat_provider.model.clone(),
        },
        other => anyhow::bail!("unsupported chat provider kind={}", other),
    };

    let embed_cfg = match cfg.embedding_provider.kind.as_str() {
        "openai_compat" => EmbedProviderConfig::OpenAiCompat {
            base_url: cfg
                .embedding_provider
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".into()),
            api_key: read_env(
                cfg.embedding_provider
                    .api_key_env
                    .as_deref()
                    .unwrap_or("OPENAI_API_KEY"),
            )?,
            model: cfg.embedding_provider.model.clone(),
        },
        other => anyhow::bail!("unsupported embedding provider kind={}", other),
    };

    let providers = make_providers(chat_cfg, embed_cfg)?;

    // 每个外部依赖一个独立熔断器
    let embed_breaker = Arc::new(CircuitBreaker::new(
        "embedding",
        BreakerConfig {
            call_timeout: Duration::from_secs(5),
            ..BreakerConfig::default()
        },
    ));
    let chat_breaker = Arc::new(CircuitBreaker::new(
        "generation",
        BreakerConfig {
            call_timeout: Duration::from_secs(30),
            volume_threshold: 5,
            ..BreakerConfig::default()
        },
    ));
    let vector_breaker = Arc::new(CircuitBreaker::new(
        "vector_index",
        BreakerConfig {
            call_timeout: Duration::from_secs(3),
            ..BreakerConfig::default()
        },
    ));

    let embed: Arc<dyn EmbedModel> = Arc::new(ResilientEmbedModel::new(
        Arc::from(providers.embed),
        embed_breaker,
    ));
    let chat: Arc<dyn ChatModel> = Arc::new(ResilientChatModel::new(
        Arc::from(providers.chat),
        chat_breaker,
    ));

    // 向量索引
    let raw_index: Arc<dyn VectorIndex> = match cfg.vector_store.kind.as_str() {
        "qdrant" => {
            let url = cfg
                .vector_store
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:6334".into());
            let collection = cfg
                .vector_store
                .collection
                .clone()
                .unwrap_or_else(|| "docqa_chunks".into());
            let dim = cfg.embedding_provider.dim.unwrap_or(1536);
            Arc::new(QdrantVectorIndex::new(&url, collection, dim).await?)
        }
        _ => {
            info!("vector_store.kind != qdrant, using in-process index");
            Arc::new(MemoryVectorIndex::new())
        }
    };
    let index: Arc<dyn VectorIndex> =
        Arc::new(ResilientVectorIndex::new(raw_index, vector_breaker));

    // 缓存与台账
    let redis_url = std::env::var("REDIS_URL").ok();
    let cache_cfg = cfg.cache.clone().unwrap_or(CacheConfig {
        similarity_threshold: None,
        ttl_secs: None,
    });
    let mut semantic_cfg = SemanticCacheConfig::default();
    if let Some(t) = cache_cfg.similarity_threshold {
        semantic_cfg.similarity_threshold = t;
    }
    if let Some(t) = cache_cfg.ttl_secs {
        semantic_cfg.ttl_secs = t;
    }
    let cache = Arc::new(SemanticCache::new(redis_url.clone(), semantic_cfg)?);

    let daily_limit = cfg
        .limits
        .as_ref()
        .and_then(|l| l.daily_generations)
        .unwrap_or(docqa_rag::usage::DEFAULT_DAILY_LIMIT);
    let ledger: Arc<dyn UsageLedger> = match &redis_url {
        Some(url) => Arc::new(RedisUsageLedger::new(url, daily_limit)?),
        None => {
            info!("REDIS_URL not set, usage ledger is in-process");
            Arc::new(MemoryUsageLedger::new(daily_limit))
        }
    };

    let store = build_store().await?;

    // 编排器
    let embedder = EmbeddingClient::new(embed, EmbeddingClientConfig::default());
    let ingest = Arc::new(IngestionOrchestrator::new(
        store.clone(),
        embedder.clone(),
        index.clone(),
        cfg.segmenter.clone().unwrap_or_default(),
    ));
    let query = Arc::new(QueryOrchestrator::new(
        embedder,
        index.clone(),
        cache,
        Arc::new(GenerationClient::new(chat)),
        ledger.clone(),
        store.clone(),
        QueryConfig::default(),
    ));

    let uploads_dir = PathBuf::from(cfg.uploads_dir.clone().unwrap_or_else(|| "uploads".into()));
    tokio::fs::create_dir_all(&uploads_dir).await?;

    let state = AppState {
        store,
        index,
        ledger,
        ingest,
        query,
        uploads_dir,
    };

    let app = Router::new()
        .route("/api/v1/documents", post(upload_document).get(list_documents))
        .route(
            "/api/v1/documents/:id",
            get(get_document).delete(delete_document),
        )
        .route("/api/v1/query", post(query_once))
        .route("/api/v1/query/stream", post(query_stream))
        .route("/api/v1/conversations", post(create_conversation))
        .route(
            "/api/v1/conversations/:id/messages",
            get(list_conversation_messages),
        )
        .route("/api/v1/usage", get(usage))
        .route("/api/v1/vectors", delete(delete_owner_vectors))
        .route("/api/v1/health", get(health))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port).parse()?;
    info!(%addr, "docqa-api listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(feature = "pg")]
async fn build_store() -> anyhow::Result<Arc<dyn DocumentStore>> {
    match std::env::var("DATABASE_URL") {
        Ok(url) => Ok(Arc::new(pg_store::PgDocumentStore::connect(&url).await?)),
        Err(_) => {
            info!("DATABASE_URL not set, document store is in-process");
            Ok(Arc::new(MemoryDocumentStore::new()))
        }
    }
}

#[cfg(not(feature = "pg"))]
async fn build_store() -> anyhow::Result<Arc<dyn DocumentStore>> {
    Ok(Arc::new(MemoryDocumentStore::new()))
}

// ===============
// 请求辅助
// ===============

/// 属主从 X-User-Id 头取,网关层负责认证
fn owner_id(headers: &HeaderMap) -> Result<Uuid, DocqaError> {
    let raw = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| DocqaError::InvalidRequest {
            reason: "missing X-User-Id header".to_string(),
        })?;
    Uuid::parse_str(raw).map_err(|_| DocqaError::InvalidRequest {
        reason: "X-User-Id is not a valid UUID".to_string(),
    })
}

// ===============
// 文档接口
// ===============

async fn upload_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<Document>, DocqaError> {
    let owner = owner_id(&headers)?;

    while let Some(field) =
        multipart
            .next_field()
            .await
            .map_err(|e| DocqaError::InvalidRequest {
                reason: e.to_string(),
            })?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "upload".to_string());
        let declared = field.content_type().map(|s| s.to_string());
        let bytes = field.bytes().await.map_err(|e| DocqaError::InvalidRequest {
            reason: e.to_string(),
        })?;
        if bytes.is_empty() {
            return Err(DocqaError::InvalidRequest {
                reason: "uploaded file is empty".to_string(),
            });
        }

        // content-type 可信就用,否则按扩展名推断
        let media_type = declared
            .clone()
            .filter(|ct| extract::is_supported(ct))
            .or_else(|| extract::media_type_for(&file_name).map(|s| s.to_string()))
            .ok_or_else(|| DocqaError::Extraction {
                media_type: declared.unwrap_or_else(|| "unknown".to_string()),
                message: "unsupported file type".to_string(),
            })?;

        let doc = Document::new(owner, file_name, bytes.len() as i64, media_type);
        // 临时文件名只用文档 id,避免路径注入
        let path = state.uploads_dir.join(doc.id.to_string());
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| DocqaError::Ingestion {
                stage: "upload".to_string(),
                message: e.to_string(),
            })?;
        if let Err(e) = state.store.create_document(&doc).await {
            // 落库失败时不能留下孤儿临时文件
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e);
        }

        let ingest = state.ingest.clone();
        let spawned_doc = doc.clone();
        tokio::spawn(async move {
            ingest.ingest_file(&spawned_doc, &path).await;
        });

        return Ok(Json(doc));
    }

    Err(DocqaError::InvalidRequest {
        reason: "missing multipart field 'file'".to_string(),
    })
}

async fn list_documents(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Document>>, DocqaError> {
    let owner = owner_id(&headers)?;
    Ok(Json(state.store.list_documents(owner).await?))
}

async fn get_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Document>, DocqaError> {
    let owner = owner_id(&headers)?;
    match state.store.get_document(id).await? {
        Some(doc) if doc.owner_id == owner => Ok(Json(doc)),
        _ => Err(DocqaError::NotFound {
            resource: format!("document {}", id),
        }),
    }
}

async fn delete_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, DocqaError> {
    let owner = owner_id(&headers)?;
    match state.store.get_document(id).await? {
        Some(doc) if doc.owner_id == owner => {
            state.index.delete_by_document(id).await?;
            state.store.delete_document(id).await?;
            Ok(Json(serde_json::json!({ "status": "deleted" })))
        }
        _ => Err(DocqaError::NotFound {
            resource: format!("document {}", id),
        }),
    }
}

// ===============
// 查询接口
// ===============

async fn query_once(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, DocqaError> {
    let owner = owner_id(&headers)?;
    let resp = state.query.query(owner, &req).await?;
    Ok(Json(resp))
}

async fn query_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<QueryRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, DocqaError> {
    let owner = owner_id(&headers)?;
    let rx = state.query.clone().query_stream(owner, req).await;
    let stream = ReceiverStream::new(rx).map(|ev| Ok(to_sse_event(ev)));
    Ok(Sse::new(stream))
}

fn to_sse_event(ev: QueryEvent) -> Event {
    let name = match &ev {
        QueryEvent::Status { .. } => "status",
        QueryEvent::Sources { .. } => "sources",
        QueryEvent::Chunk { .. } => "chunk",
        QueryEvent::Complete { .. } => "complete",
        QueryEvent::Error { .. } => "error",
    };
    Event::default()
        .event(name)
        .data(serde_json::to_string(&ev).unwrap_or_default())
}

// ===============
// 会话接口
// ===============

#[derive(Deserialize)]
struct CreateConversationReq {
    title: Option<String>,
}

async fn create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateConversationReq>,
) -> Result<Json<Conversation>, DocqaError> {
    let owner = owner_id(&headers)?;
    let conversation = Conversation {
        id: Uuid::new_v4(),
        owner_id: owner,
        title: req.title,
        created_at: chrono::Utc::now(),
    };
    state.store.create_conversation(&conversation).await?;
    Ok(Json(conversation))
}

async fn list_conversation_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Message>>, DocqaError> {
    let owner = owner_id(&headers)?;
    match state.store.get_conversation(id).await? {
        Some(conv) if conv.owner_id == owner => Ok(Json(state.store.list_messages(id).await?)),
        _ => Err(DocqaError::NotFound {
            resource: format!("conversation {}", id),
        }),
    }
}

// ===============
// 用量与维护接口
// ===============

async fn usage(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<UsageReport>, DocqaError> {
    let owner = owner_id(&headers)?;
    Ok(Json(state.ledger.usage(owner).await?))
}

async fn delete_owner_vectors(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, DocqaError> {
    let owner = owner_id(&headers)?;
    state.index.delete_by_owner(owner).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
