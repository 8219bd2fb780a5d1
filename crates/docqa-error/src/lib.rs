use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

#[cfg(feature = "axum")]
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};

/// 系统统一错误类型
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum DocqaError {
    // === 业务错误 ===
    #[error("资源未找到: {resource}")]
    NotFound { resource: String },

    #[error("请求无效: {reason}")]
    InvalidRequest { reason: String },

    #[error("配额超限: 每日 {limit} 次已用完")]
    QuotaExceeded {
        limit: u32,
        resets_at: chrono::DateTime<chrono::Utc>,
    },

    // === 文档摄取错误 ===
    #[error("文本抽取失败 ({media_type})")]
    Extraction { media_type: String, message: String },

    #[error("摄取失败于 {stage}")]
    Ingestion { stage: String, message: String },

    // === 技术错误 ===
    #[error("数据库错误: {operation}")]
    Database { operation: String, message: String },

    #[error("向量存储错误: {operation} 失败")]
    VectorStore { operation: String, message: String },

    #[error("缓存错误: {operation}")]
    Cache { operation: String, message: String },

    #[error("LLM 服务错误 ({provider})")]
    LlmService {
        provider: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    #[error("嵌入服务错误 ({provider})")]
    EmbeddingService {
        provider: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    #[error("外部服务不可用: {service}")]
    ServiceUnavailable {
        service: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    // === 系统错误 ===
    #[error("内部系统错误: {message}")]
    Internal {
        message: String,
        details: Option<String>,
    },

    #[error("配置错误: {key} - {reason}")]
    Configuration { key: String, reason: String },

    #[error("序列化错误: {format}")]
    Serialization { format: String, message: String },

    #[error("网络错误: {operation}")]
    Network { operation: String, message: String },

    #[error("超时错误: {operation} 超过 {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("并发错误: {operation}")]
    Concurrency { operation: String, message: String },
}

/// 错误严重级别
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,      // 可预期的业务错误
    Medium,   // 技术错误但不影响核心功能
    High,     // 影响核心功能的错误
    Critical, // 系统级严重错误
}

impl DocqaError {
    /// 获取错误的严重级别
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DocqaError::NotFound { .. }
            | DocqaError::InvalidRequest { .. }
            | DocqaError::QuotaExceeded { .. } => ErrorSeverity::Low,
            DocqaError::Extraction { .. } | DocqaError::Ingestion { .. } => ErrorSeverity::Medium,
            DocqaError::LlmService { .. }
            | DocqaError::EmbeddingService { .. }
            | DocqaError::ServiceUnavailable { .. }
            | DocqaError::Network { .. }
            | DocqaError::Timeout { .. }
            | DocqaError::Cache { .. } => ErrorSeverity::Medium,
            DocqaError::Database { .. }
            | DocqaError::VectorStore { .. }
            | DocqaError::Serialization { .. }
            | DocqaError::Concurrency { .. } => ErrorSeverity::High,
            DocqaError::Internal { .. } | DocqaError::Configuration { .. } => {
                ErrorSeverity::Critical
            }
        }
    }

    /// 是否为可重试错误
    pub fn is_retryable(&self) -> bool {
        match self {
            DocqaError::ServiceUnavailable { retry_after, .. } => retry_after.is_some(),
            DocqaError::Network { .. } | DocqaError::Timeout { .. } => true,
            DocqaError::LlmService { retry_after, .. }
            | DocqaError::EmbeddingService { retry_after, .. } => retry_after.is_some(),
            DocqaError::Concurrency { .. } => true,
            _ => false,
        }
    }

    /// 获取重试延迟时间
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            DocqaError::ServiceUnavailable { retry_after, .. }
            | DocqaError::LlmService { retry_after, .. }
            | DocqaError::EmbeddingService { retry_after, .. } => *retry_after,
            DocqaError::Network { .. } => Some(std::time::Duration::from_millis(500)),
            DocqaError::Timeout { .. } => Some(std::time::Duration::from_millis(1000)),
            DocqaError::Concurrency { .. } => Some(std::time::Duration::from_millis(100)),
            _ => None,
        }
    }

    /// 记录错误日志
    pub fn log(&self, component: &str, operation: &str) {
        match self.severity() {
            ErrorSeverity::Low => {
                warn!(component, operation, error = %self, "业务错误");
            }
            ErrorSeverity::Medium => {
                warn!(component, operation, error = %self, "技术错误");
            }
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!(component, operation, error = %self, severity = ?self.severity(), "严重错误");
            }
        }
    }

    /// 转换为 HTTP 状态码
    pub fn to_http_status(&self) -> u16 {
        match self {
            DocqaError::NotFound { .. } => 404,
            DocqaError::InvalidRequest { .. } => 400,
            DocqaError::Extraction { .. } => 415,
            DocqaError::QuotaExceeded { .. } => 429,
            DocqaError::ServiceUnavailable { .. } => 503,
            DocqaError::Timeout { .. } => 408,
            _ => 500,
        }
    }

    /// 获取用户友好的错误消息
    pub fn user_message(&self) -> String {
        match self {
            DocqaError::NotFound { .. } => "请求的资源不存在".to_string(),
            DocqaError::InvalidRequest { .. } => "请求参数有误，请检查后重试".to_string(),
            DocqaError::QuotaExceeded { resets_at, .. } => {
                format!("今日问答次数已用完，{} 后重置", resets_at.to_rfc3339())
            }
            DocqaError::Extraction { media_type, .. } => {
                format!("不支持的文件类型或内容无法解析: {}", media_type)
            }
            DocqaError::ServiceUnavailable { .. } => "服务暂时不可用，请稍后重试".to_string(),
            DocqaError::Timeout { .. } => "请求超时，请重试".to_string(),
            _ => "系统内部错误，请联系管理员".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DocqaError>;

// === 转换实现 ===

impl From<serde_json::Error> for DocqaError {
    fn from(err: serde_json::Error) -> Self {
        DocqaError::Serialization {
            format: "json".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for DocqaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DocqaError::Timeout {
                operation: "http_request".to_string(),
                timeout_ms: 30000, // 默认超时时间
            }
        } else if err.is_connect() {
            DocqaError::Network {
                operation: "connect".to_string(),
                message: err.to_string(),
            }
        } else {
            DocqaError::Network {
                operation: "http_request".to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl From<uuid::Error> for DocqaError {
    fn from(err: uuid::Error) -> Self {
        DocqaError::Serialization {
            format: "uuid".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for DocqaError {
    fn from(err: tokio::task::JoinError) -> Self {
        DocqaError::Concurrency {
            operation: "task_join".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<qdrant_client::QdrantError> for DocqaError {
    fn from(err: qdrant_client::QdrantError) -> Self {
        DocqaError::VectorStore {
            operation: "qdrant_client".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for DocqaError {
    fn from(err: redis::RedisError) -> Self {
        DocqaError::Cache {
            operation: "redis".to_string(),
            message: err.to_string(),
        }
    }
}

// Axum integration
#[cfg(feature = "axum")]
impl IntoResponse for DocqaError {
    fn into_response(self) -> axum::response::Response {
        let status_code = match self {
            DocqaError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            DocqaError::NotFound { .. } => StatusCode::NOT_FOUND,
            DocqaError::Extraction { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            DocqaError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            DocqaError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DocqaError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "message": self.user_message()
        });

        (status_code, Json(body)).into_response()
    }
}
