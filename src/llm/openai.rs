//! OpenAI 兼容的 Chat Completions 客户端
//!
//! 支持单次与流式补全、单张图片输入以及 function 工具调用。
//! 重试与超时由外层的 [`ResilientClient`](super::retry::ResilientClient) 负责。

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::types::Role;
use super::{
    CompletionRequest, CompletionResponse, ContentBlock, LlmClient, LlmError, Message, MessageContent, StopReason,
    StreamChunk, TokenUsage, ToolCall,
};
use crate::config::config::LlmConfig;

pub struct OpenAiClient {
    model: String,
    api_key: String,
    base_url: String,
    http: Client,
}

impl OpenAiClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .map_err(LlmError::Network)?;

        Ok(Self {
            model: config.text_model.clone(),
            api_key: config.api_key(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url)
    }

    fn build_request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": request.system_prompt,
        })];
        messages.extend(convert_messages(&request.messages));

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });

        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(request.tools.iter().map(|t| t.to_openai_schema()).collect::<Vec<_>>());
            body["tool_choice"] = serde_json::json!("auto");
        }

        body
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response, LlmError> {
        let response = self
            .http
            .post(self.endpoint())
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(1);
            return Err(LlmError::RateLimited {
                retry_after: Duration::from_secs(retry_after),
            });
        }

        if !response.status().is_success() {
            let message = response.text().await.unwrap_or_default();
            debug!(status, body = %message, "upstream returned error status");
            return Err(LlmError::ApiError { status, message });
        }

        Ok(response)
    }
}

/// 转换为 OpenAI 消息格式
///
/// 每个工具结果单独成为一条 `tool` 消息；图片转为 data URL 内容片段。
fn convert_messages(messages: &[Message]) -> Vec<serde_json::Value> {
    let mut result = Vec::new();

    for msg in messages {
        let role = match msg.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };

        let blocks = match &msg.content {
            MessageContent::Text(text) => {
                result.push(serde_json::json!({ "role": role, "content": text }));
                continue;
            }
            MessageContent::Blocks(blocks) => blocks,
        };

        let mut parts = Vec::new();
        let mut tool_calls = Vec::new();
        let mut tool_results = Vec::new();

        for block in blocks {
            match block {
                ContentBlock::Text { text } => parts.push(serde_json::json!({ "type": "text", "text": text })),
                ContentBlock::Image { media_type, data } => parts.push(serde_json::json!({
                    "type": "image_url",
                    "image_url": { "url": format!("data:{};base64,{}", media_type, data) },
                })),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(serde_json::json!({
                    "id": id,
                    "type": "function",
                    "function": { "name": name, "arguments": input.to_string() },
                })),
                ContentBlock::ToolResult {
                    tool_use_id, content, ..
                } => tool_results.push((tool_use_id, content)),
            }
        }

        if !tool_results.is_empty() {
            for (tool_call_id, content) in tool_results {
                result.push(serde_json::json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": content,
                }));
            }
            continue;
        }

        if !tool_calls.is_empty() {
            result.push(serde_json::json!({ "role": "assistant", "tool_calls": tool_calls }));
            continue;
        }

        result.push(serde_json::json!({ "role": role, "content": parts }));
    }

    result
}

fn parse_response(api_response: OpenAiResponse) -> CompletionResponse {
    let usage = api_response.usage.map(TokenUsage::from).unwrap_or_default();
    let Some(choice) = api_response.choices.into_iter().next() else {
        return CompletionResponse {
            usage,
            ..Default::default()
        };
    };

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolCall {
            id: tc.id,
            name: tc.function.name,
            input: serde_json::from_str(&tc.function.arguments).unwrap_or(serde_json::json!({})),
        })
        .collect();

    CompletionResponse {
        content: choice.message.content,
        tool_calls,
        stop_reason: StopReason::from_finish_reason(choice.finish_reason.as_deref()),
        usage,
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        debug!(model = %self.model, max_tokens = request.max_tokens, "complete");
        let body = self.build_request_body(&request);
        let response = self.send(&body).await?;
        let api_response: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        Ok(parse_response(api_response))
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        chunk_tx: mpsc::Sender<StreamChunk>,
    ) -> Result<CompletionResponse, LlmError> {
        debug!(model = %self.model, max_tokens = request.max_tokens, "stream");
        let mut body = self.build_request_body(&request);
        body["stream"] = serde_json::json!(true);

        let response = self.send(&body).await?;
        let mut stream = response.bytes_stream();

        let mut lines = SseLines::default();
        let mut state = StreamState::default();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| LlmError::Transport(e.to_string()))?;
            for line in lines.push(&chunk) {
                state.apply(&line, &chunk_tx).await;
            }
        }
        if let Some(line) = lines.finish() {
            state.apply(&line, &chunk_tx).await;
        }

        Ok(state.finish(&chunk_tx).await)
    }
}

/// 按 `\n` 切分字节流，只对完整的行做 UTF-8 解码
///
/// 多字节字符可能被拆在两个网络分片之间，逐片解码会得到替换字符。
#[derive(Debug, Default)]
struct SseLines {
    buffer: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim().to_string());
        }
        lines
    }

    fn finish(self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.buffer).trim().to_string();
        if rest.is_empty() { None } else { Some(rest) }
    }
}

/// 流式响应的累积状态
#[derive(Debug, Default)]
struct StreamState {
    full_content: String,
    // index -> (id, name, args)
    pending_tools: BTreeMap<usize, (String, String, String)>,
    stop_reason: StopReason,
    usage: TokenUsage,
}

impl StreamState {
    async fn apply(&mut self, line: &str, chunk_tx: &mpsc::Sender<StreamChunk>) {
        let Some(data) = line.strip_prefix("data:").map(str::trim) else {
            return;
        };
        if data.is_empty() || data == "[DONE]" {
            return;
        }

        let chunk_data: OpenAiStreamChunk = match serde_json::from_str(data) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "skipping unparsable stream line");
                return;
            }
        };

        if let Some(u) = chunk_data.usage {
            self.usage = TokenUsage::from(u);
        }

        let Some(choice) = chunk_data.choices.into_iter().next() else {
            return;
        };

        if let Some(content) = choice.delta.content
            && !content.is_empty()
        {
            self.full_content.push_str(&content);
            let _ = chunk_tx.send(StreamChunk::TextDelta(content)).await;
        }

        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let entry = self.pending_tools.entry(tc.index).or_default();
            if let Some(id) = tc.id {
                entry.0 = id;
            }
            if let Some(func) = tc.function {
                if let Some(name) = func.name {
                    entry.1 = name.clone();
                    let _ = chunk_tx
                        .send(StreamChunk::ToolUseStart {
                            id: entry.0.clone(),
                            name,
                        })
                        .await;
                }
                if let Some(args) = func.arguments {
                    entry.2.push_str(&args);
                }
            }
        }

        if choice.finish_reason.is_some() {
            self.stop_reason = StopReason::from_finish_reason(choice.finish_reason.as_deref());
        }
    }

    async fn finish(self, chunk_tx: &mpsc::Sender<StreamChunk>) -> CompletionResponse {
        let tool_calls = self
            .pending_tools
            .into_values()
            .map(|(id, name, args)| ToolCall {
                id,
                name,
                input: serde_json::from_str(&args).unwrap_or(serde_json::json!({})),
            })
            .collect();

        let _ = chunk_tx
            .send(StreamChunk::MessageDone {
                stop_reason: self.stop_reason,
                usage: self.usage,
            })
            .await;

        CompletionResponse {
            content: if self.full_content.is_empty() { None } else { Some(self.full_content) },
            tool_calls,
            stop_reason: self.stop_reason,
            usage: self.usage,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    id: String,
    function: OpenAiFunction,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

impl From<OpenAiUsage> for TokenUsage {
    fn from(u: OpenAiUsage) -> Self {
        TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiStreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamToolCall {
    index: usize,
    id: Option<String>,
    function: Option<OpenAiStreamFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}
