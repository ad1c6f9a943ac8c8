//! 模型推理服务客户端
//!
//! 单次补全、流式补全与工具调用三种调用方式，外加超时/重试装饰器。

use std::sync::Arc;

pub mod client;
mod error;
mod openai;
pub mod retry;
pub mod tools;
mod types;

pub use client::LlmClient;
pub use error::LlmError;
pub use openai::OpenAiClient;
pub use retry::ResilientClient;
pub use tools::{ToolExecutor, complete_with_tools};
pub use types::{
    CompletionRequest, CompletionResponse, ContentBlock, Message, MessageContent, Role, StopReason, StreamChunk,
    TokenUsage, ToolCall, ToolDefinition,
};

use crate::config::config::LlmConfig;

/// 按配置构建带超时与重试的文本模型客户端
pub fn create_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>, LlmError> {
    let inner = OpenAiClient::from_config(config)?;
    Ok(Arc::new(ResilientClient::from_config(inner, config)))
}
