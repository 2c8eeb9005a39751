//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock），附重试包装与嵌入端点

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod retry;
pub mod traits;

use std::sync::Arc;

pub use embedding::{create_embedder_from_config, EmbeddingProvider, OpenAiEmbedder};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use retry::{RetryConfig, RetryingLlm};
pub use traits::{LlmClient, Message, Role};

use crate::config::LlmSection;

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容端点 / Mock），并套上重试包装
pub fn create_llm_from_config(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let inner: Arc<dyn LlmClient> = if std::env::var("OPENAI_API_KEY").is_ok() {
        tracing::info!(model = %cfg.model, base_url = ?cfg.base_url, "using OpenAI-compatible LLM");
        Arc::new(OpenAiClient::new(
            cfg.base_url.as_deref(),
            &cfg.model,
            std::env::var("OPENAI_API_KEY").ok().as_deref(),
        ))
    } else {
        tracing::warn!("no OPENAI_API_KEY set, using Mock LLM");
        Arc::new(MockLlmClient::new())
    };
    Arc::new(RetryingLlm::new(
        inner,
        RetryConfig {
            max_attempts: cfg.max_attempts,
            backoff_base: std::time::Duration::from_secs(cfg.backoff_base_secs),
        },
    ))
}
