//! 答案生成
//!
//! 把检索到的段落拼进提示词再交给聊天模型。检索为空时明确告知模型
//! 没有可用上下文,而不是递一个空提示让它自由发挥。

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::instrument;

use docqa_error::Result;
use docqa_llm::ChatModel;

const SYSTEM_PROMPT: &str = "You are a document Q&A assistant. Answer using only the provided \
context passages. If the context does not contain the answer, say so plainly instead of guessing. \
Be concise.";

const PASSAGE_DELIMITER: &str = "\n\n---\n\n";

pub struct GenerationClient {
    chat: Arc<dyn ChatModel>,
}

impl GenerationClient {
    pub fn new(chat: Arc<dyn ChatModel>) -> Self {
        Self { chat }
    }

    #[instrument(skip(self, query, passages), fields(passages = passages.len()))]
    pub async fn generate(&self, query: &str, passages: &[String]) -> Result<String> {
        let prompt = build_prompt(query, passages);
        self.chat.chat(SYSTEM_PROMPT, &prompt).await
    }

    /// 流式生成。终止语义与 [`ChatModel::chat_stream`] 一致:
    /// 通道关闭即成功,单个 `Err` 即失败。
    #[instrument(skip(self, query, passages), fields(passages = passages.len()))]
    pub async fn generate_streaming(
        &self,
        query: &str,
        passages: &[String],
    ) -> Result<mpsc::Receiver<Result<String>>> {
        let prompt = build_prompt(query, passages);
        self.chat.chat_stream(SYSTEM_PROMPT, &prompt).await
    }
}

fn build_prompt(query: &str, passages: &[String]) -> String {
    if passages.is_empty() {
        return format!(
            "No relevant context was found in the user's documents.\n\nQuestion: {}",
            query
        );
    }
    format!(
        "Context passages:\n\n{}\n\nQuestion: {}",
        passages.join(PASSAGE_DELIMITER),
        query
    )
}
