//! 带指数退避的 LLM 重试包装
//!
//! 瞬时网络/限流错误按 2s、4s、8s… 退避重试，默认最多 3 次尝试；
//! 包装任意 LlmClient，编排器拿到的始终是包好的客户端。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message};

/// 重试参数
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
        }
    }
}

/// 包装内层客户端，complete 失败时按退避曲线重试
pub struct RetryingLlm {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlm {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlm {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let mut last_err = String::new();
        for attempt in 0..self.config.max_attempts {
            match self.inner.complete(messages).await {
                Ok(text) => return Ok(text),
                Err(e) => {
                    last_err = e;
                    if attempt + 1 < self.config.max_attempts {
                        let wait = self.config.backoff_base * 2u32.pow(attempt);
                        tracing::warn!(
                            attempt = attempt + 1,
                            wait_secs = wait.as_secs(),
                            error = %last_err,
                            "LLM call failed, backing off"
                        );
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyLlm {
        failures: AtomicU32,
    }

    #[async_trait]
    impl LlmClient for FlakyLlm {
        async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
            if self.failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err("connection reset".to_string())
            } else {
                Ok("ok".to_string())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_failures() {
        let llm = RetryingLlm::new(
            Arc::new(FlakyLlm {
                failures: AtomicU32::new(2),
            }),
            RetryConfig::default(),
        );
        let out = llm.complete(&[Message::user("hi")]).await;
        assert_eq!(out.unwrap(), "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let llm = RetryingLlm::new(
            Arc::new(FlakyLlm {
                failures: AtomicU32::new(10),
            }),
            RetryConfig::default(),
        );
        let out = llm.complete(&[Message::user("hi")]).await;
        assert!(matches!(out, Err(e) if e.contains("connection reset")));
    }
}
