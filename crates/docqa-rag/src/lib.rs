pub mod breaker;
pub mod cache;
pub mod embedding;
pub mod extract;
pub mod generation;
pub mod ingest;
pub mod qdrant;
pub mod query;
pub mod resilient;
pub mod segmenter;
pub mod store;
pub mod usage;
pub mod vector;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker, StateChange};
pub use cache::{SemanticCache, SemanticCacheConfig};
pub use embedding::{EmbeddingClient, EmbeddingClientConfig};
pub use generation::GenerationClient;
pub use ingest::IngestionOrchestrator;
pub use qdrant::QdrantVectorIndex;
pub use query::{QueryConfig, QueryEvent, QueryOrchestrator, NO_CONTEXT_ANSWER};
pub use resilient::{ResilientChatModel, ResilientEmbedModel, ResilientVectorIndex};
pub use segmenter::{segment, Segment, SegmenterConfig};
pub use store::{DocumentStore, MemoryDocumentStore};
pub use usage::{MemoryUsageLedger, RedisUsageLedger, UsageLedger};
pub use vector::{cosine_similarity, MemoryVectorIndex, VectorIndex, VectorMatch, VectorPayload, VectorRecord};

// 重新导出核心类型
pub use docqa_core::{
    CacheEntry, Chunk, Conversation, Document, DocumentStatus, Message, QueryRequest,
    QueryResponse, SourceCitation, UsageReport,
};
pub use docqa_error::{DocqaError, Result};
