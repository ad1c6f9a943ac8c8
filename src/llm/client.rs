//! LlmClient trait definition

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{CompletionRequest, CompletionResponse, LlmError, StreamChunk};

/// 无状态模型客户端
///
/// 每次调用相互独立，会话上下文完全由调用方放进请求。
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 单次补全，等待完整结果
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// 流式补全
    ///
    /// 增量写入 `chunk_tx`，返回最终完整响应。接收端关闭不视为错误。
    async fn stream(
        &self,
        request: CompletionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
    ) -> Result<CompletionResponse, LlmError>;
}

/// 脚本化的模型客户端，供单元测试使用
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::llm::{StopReason, ToolCall};

    /// 预设的一次调用结果
    #[derive(Debug, Clone)]
    pub enum MockReply {
        Text(String),
        /// 请求执行工具
        ToolCall { name: String, input: serde_json::Value },
        /// 配额耗尽
        Quota,
        /// 非配额的硬失败
        Fail(u16, String),
        /// 流式输出部分内容后断开；非流式调用直接报传输错误
        BrokenStream(String),
        /// 阻塞直到超时或被取消
        Hang,
    }

    impl MockReply {
        pub fn text(s: impl Into<String>) -> Self {
            MockReply::Text(s.into())
        }

        fn into_result(self) -> Result<CompletionResponse, LlmError> {
            match self {
                MockReply::Text(t) => Ok(CompletionResponse::text(t)),
                MockReply::ToolCall { name, input } => Ok(CompletionResponse {
                    content: None,
                    tool_calls: vec![ToolCall {
                        id: format!("call_{}", name),
                        name,
                        input,
                    }],
                    stop_reason: StopReason::ToolUse,
                    ..Default::default()
                }),
                MockReply::Quota => Err(LlmError::ApiError {
                    status: 429,
                    message: "You exceeded your current quota".to_string(),
                }),
                MockReply::Fail(status, message) => Err(LlmError::ApiError { status, message }),
                MockReply::BrokenStream(_) => Err(LlmError::Transport("connection reset".to_string())),
                MockReply::Hang => Err(LlmError::Timeout(Duration::from_secs(3600))),
            }
        }
    }

    pub struct MockLlmClient {
        replies: Vec<MockReply>,
        call_count: AtomicUsize,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl MockLlmClient {
        pub fn new(replies: Vec<MockReply>) -> Self {
            Self {
                replies,
                call_count: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        /// 已收到的请求（按调用顺序）
        pub fn requests(&self) -> Vec<CompletionRequest> {
            self.requests.lock().unwrap().clone()
        }

        fn next(&self, request: CompletionRequest) -> MockReply {
            self.requests.lock().unwrap().push(request);
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            self.replies
                .get(idx)
                .cloned()
                .unwrap_or_else(|| MockReply::Fail(500, "No more mock responses".to_string()))
        }
    }

    #[async_trait]
    impl LlmClient for MockLlmClient {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
            match self.next(request) {
                MockReply::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    MockReply::Hang.into_result()
                }
                reply => reply.into_result(),
            }
        }

        async fn stream(
            &self,
            request: CompletionRequest,
            chunk_tx: mpsc::Sender<StreamChunk>,
        ) -> Result<CompletionResponse, LlmError> {
            match self.next(request) {
                MockReply::Text(text) => {
                    for piece in text.split_inclusive(' ') {
                        let _ = chunk_tx.send(StreamChunk::TextDelta(piece.to_string())).await;
                    }
                    Ok(CompletionResponse::text(text))
                }
                MockReply::BrokenStream(partial) => {
                    let _ = chunk_tx.send(StreamChunk::TextDelta(partial)).await;
                    Err(LlmError::Transport("connection reset".to_string()))
                }
                MockReply::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    MockReply::Hang.into_result()
                }
                reply => reply.into_result(),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::config::config::Budget;

        fn req() -> CompletionRequest {
            CompletionRequest::new("Test", vec![], Budget::new(100, 0.0))
        }

        #[tokio::test]
        async fn test_mock_client_returns_replies_in_order() {
            let client = MockLlmClient::new(vec![MockReply::text("one"), MockReply::Quota]);

            let first = client.complete(req()).await.unwrap();
            assert_eq!(first.content.as_deref(), Some("one"));

            let second = client.complete(req()).await.unwrap_err();
            assert!(second.is_quota_exhausted());
            assert_eq!(client.call_count(), 2);
            assert_eq!(client.requests().len(), 2);
        }

        #[tokio::test]
        async fn test_mock_stream_emits_deltas() {
            let client = MockLlmClient::new(vec![MockReply::text("hello there")]);
            let (tx, mut rx) = mpsc::channel(8);
            let resp = client.stream(req(), tx).await.unwrap();
            assert_eq!(resp.text_or_empty(), "hello there");

            let mut joined = String::new();
            while let Some(StreamChunk::TextDelta(d)) = rx.recv().await {
                joined.push_str(&d);
            }
            assert_eq!(joined, "hello there");
        }

        #[tokio::test]
        async fn test_mock_client_errors_when_exhausted() {
            let client = MockLlmClient::new(vec![]);
            assert!(client.complete(req()).await.is_err());
        }
    }
}
