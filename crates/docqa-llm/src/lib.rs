use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::instrument;

pub use docqa_error::{DocqaError, Result};

#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn chat(&self, system: &str, user: &str) -> Result<String>;

    /// Token streaming variant. Fragments arrive on the returned channel in
    /// emission order; the channel closing without a trailing `Err` item is the
    /// success terminal, a single `Err` item is the error terminal. Forwarding
    /// stops as soon as the receiver is dropped.
    async fn chat_stream(&self, system: &str, user: &str) -> Result<mpsc::Receiver<Result<String>>>;
}

#[async_trait]
pub trait EmbedModel: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ========== OpenAI-compatible (covers OpenAI, DeepSeek, most local gateways) ==========

#[derive(Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: String,                // e.g. https://api.openai.com
    pub api_key: String,                 // Bearer token
    pub chat_model: String,              // e.g. gpt-4o-mini
    pub embedding_model: Option<String>, // e.g. text-embedding-3-small
}

#[derive(Clone)]
pub struct OpenAiCompatClient {
    http: Client,
    cfg: OpenAiCompatConfig,
}

impl OpenAiCompatClient {
    pub fn new(cfg: OpenAiCompatConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
        }
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        )
    }
}

#[derive(Serialize)]
struct OaiChatReqMsg {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OaiChatReq {
    model: String,
    messages: Vec<OaiChatReqMsg>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Deserialize)]
struct OaiChatRespChoiceMsg {
    content: String,
}

#[derive(Deserialize)]
struct OaiChatRespChoice {
    message: OaiChatRespChoiceMsg,
}

#[derive(Deserialize)]
struct OaiChatResp {
    choices: Vec<OaiChatRespChoice>,
}

#[derive(Deserialize)]
struct OaiStreamDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OaiStreamChoice {
    delta: OaiStreamDelta,
}

#[derive(Deserialize)]
struct OaiStreamChunk {
    choices: Vec<OaiStreamChoice>,
}

fn chat_messages(system: &str, user: &str) -> Vec<OaiChatReqMsg> {
    vec![
        OaiChatReqMsg {
            role: "system".into(),
            content: system.to_string(),
        },
        OaiChatReqMsg {
            role: "user".into(),
            content: user.to_string(),
        },
    ]
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    #[instrument(skip(self, system, user))]
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let body = OaiChatReq {
            model: self.cfg.chat_model.clone(),
            messages: chat_messages(system, user),
            temperature: Some(0.2),
            stream: None,
        };

        let resp = self
            .http
            .post(self.chat_url())
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| DocqaError::Network {
                operation: "http_request".to_string(),
                message: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(DocqaError::LlmService {
                provider: "openai_compat".to_string(),
                message: format!("status={} body={}", status, txt),
                retry_after: None,
            });
        }

        let data: OaiChatResp = resp.json().await.map_err(|e| DocqaError::Network {
            operation: "http_request".to_string(),
            message: e.to_string(),
        })?;
        let content = data
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();
        Ok(content)
    }

    #[instrument(skip(self, system, user))]
    async fn chat_stream(
        &self,
        system: &str,
        user: &str,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let body = OaiChatReq {
            model: self.cfg.chat_model.clone(),
            messages: chat_messages(system, user),
            temperature: Some(0.2),
            stream: Some(true),
        };

        let resp = self
            .http
            .post(self.chat_url())
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| DocqaError::Network {
                operation: "http_request".to_string(),
                message: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(DocqaError::LlmService {
                provider: "openai_compat".to_string(),
                message: format!("status={} body={}", status, txt),
                retry_after: None,
            });
        }

        let (tx, rx) = mpsc::channel::<Result<String>>(32);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buf = String::new();
            while let Some(part) = stream.next().await {
                let bytes = match part {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(DocqaError::Network {
                                operation: "chat_stream_read".to_string(),
                                message: e.to_string(),
                            }))
                            .await;
                        return;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim().to_string();
                    buf.drain(..=pos);
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        return; // channel close is the success terminal
                    }
                    if let Ok(chunk) = serde_json::from_str::<OaiStreamChunk>(payload) {
                        if let Some(text) = chunk.choices.first().and_then(|c| c.delta.content.clone())
                        {
                            if !text.is_empty() && tx.send(Ok(text)).await.is_err() {
                                // receiver gone, stop forwarding
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[derive(Serialize)]
struct OaiEmbedReq {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct OaiEmbedData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct OaiEmbedResp {
    data: Vec<OaiEmbedData>,
}

#[async_trait]
impl EmbedModel for OpenAiCompatClient {
    #[instrument(skip(self, texts))]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self
            .cfg
            .embedding_model
            .clone()
            .ok_or_else(|| DocqaError::Configuration {
                key: "embedding_model".to_string(),
                reason: "not configured".to_string(),
            })?;
        let url = format!("{}/v1/embeddings", self.cfg.base_url.trim_end_matches('/'));
        let body = OaiEmbedReq {
            model,
            input: texts.to_vec(),
        };

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| DocqaError::Network {
                operation: "http_request".to_string(),
                message: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let txt = resp.text().await.unwrap_or_default();
            return Err(DocqaError::EmbeddingService {
                provider: "openai_compat".to_string(),
                message: format!("status={} body={}", status, txt),
                retry_after: None,
            });
        }

        let data: OaiEmbedResp = resp.json().await.map_err(|e| DocqaError::Network {
            operation: "http_request".to_string(),
            message: e.to_string(),
        })?;
        if data.data.len() != texts.len() {
            return Err(DocqaError::EmbeddingService {
                provider: "openai_compat".to_string(),
                message: format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    data.data.len()
                ),
                retry_after: None,
            });
        }
        Ok(data.data.into_iter().map(|d| d.embedding).collect())
    }
}

// ========== DeepSeek (OpenAI-compatible) ==========

#[derive(Clone)]
pub struct DeepSeekConfig {
    pub api_key: String,
    pub base_url: String, // https://api.deepseek.com
    pub chat_model: String,
}

#[derive(Clone)]
pub struct DeepSeekClient(OpenAiCompatClient);

impl DeepSeekClient {
    pub fn new(cfg: DeepSeekConfig) -> Self {
        Self(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url: cfg.base_url,
            api_key: cfg.api_key,
            chat_model: cfg.chat_model,
            embedding_model: None,
        }))
    }
}

#[async_trait]
impl ChatModel for DeepSeekClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        self.0.chat(system, user).await
    }

    async fn chat_stream(
        &self,
        system: &str,
        user: &str,
    ) -> Result<mpsc::Receiver<Result<String>>> {
        self.0.chat_stream(system, user).await
    }
}

// ========== Provider Factory & Config ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ChatProviderConfig {
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        base_url: String,
        api_key: String,
        model: String,
    },
    #[serde(rename = "deepseek")]
    DeepSeek {
        base_url: Option<String>,
        api_key: String,
        model: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum EmbedProviderConfig {
    #[serde(rename = "openai_compat")]
    OpenAiCompat {
        base_url: String,
        api_key: String,
        model: String,
    },
}

pub struct Providers {
    pub chat: Box<dyn ChatModel>,
    pub embed: Box<dyn EmbedModel>,
}

pub fn make_providers(chat: ChatProviderConfig, embed: EmbedProviderConfig) -> Result<Providers> {
    let chat_box: Box<dyn ChatModel> = match chat {
        ChatProviderConfig::OpenAiCompat {
            base_url,
            api_key,
            model,
        } => Box::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url,
            api_key,
            chat_model: model,
            embedding_model: None,
        })),
        ChatProviderConfig::DeepSeek {
            base_url,
            api_key,
            model,
        } => Box::new(DeepSeekClient::new(DeepSeekConfig {
            base_url: base_url.unwrap_or_else(|| "https://api.deepseek.com".into()),
            api_key,
            chat_model: model,
        })),
    };

    let embed_box: Box<dyn EmbedModel> = match embed {
        EmbedProviderConfig::OpenAiCompat {
            base_url,
            api_key,
            model,
        } => Box::new(OpenAiCompatClient::new(OpenAiCompatConfig {
            base_url,
            api_key,
            chat_model: "".into(),
            embedding_model: Some(model),
        })),
    };

    Ok(Providers {
        chat: chat_box,
        embed: embed_box,
    })
}
