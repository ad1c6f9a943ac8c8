//! 超时与线性退避重试装饰器

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use super::{CompletionRequest, CompletionResponse, LlmClient, LlmError, StreamChunk};
use crate::config::config::LlmConfig;

/// 为任意客户端加上调用超时与重试
///
/// `complete` 在可重试错误上按 `backoff * attempt` 线性退避，最多 `max_retries` 次；
/// `stream` 只加超时，中途失败交给调用方处理。
pub struct ResilientClient<C> {
    inner: C,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
}

impl<C: LlmClient> ResilientClient<C> {
    pub fn new(inner: C, timeout: Duration, max_retries: u32, backoff: Duration) -> Self {
        Self {
            inner,
            timeout,
            max_retries,
            backoff,
        }
    }

    pub fn from_config(inner: C, config: &LlmConfig) -> Self {
        Self::new(
            inner,
            Duration::from_millis(config.timeout_ms),
            config.max_retries,
            Duration::from_millis(config.retry_backoff_ms),
        )
    }
}

#[async_trait]
impl<C: LlmClient> LlmClient for ResilientClient<C> {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.timeout, self.inner.complete(request.clone())).await {
                Ok(result) => result,
                Err(_) => Err(LlmError::Timeout(self.timeout)),
            };

            match result {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.backoff * attempt;
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying model call");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
    ) -> Result<CompletionResponse, LlmError> {
        match tokio::time::timeout(self.timeout, self.inner.stream(request, chunk_tx)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout(self.timeout)),
        }
    }
}
