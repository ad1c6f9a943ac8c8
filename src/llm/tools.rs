//! 工具调用循环

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{CompletionRequest, CompletionResponse, ContentBlock, LlmClient, LlmError, Message, StopReason, ToolCall};

/// 执行模型请求的工具
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// 返回工具结果文本；`Err` 作为错误结果回填给模型
    async fn execute(&self, call: &ToolCall) -> Result<String, String>;
}

/// 带工具调用的补全
///
/// 模型因工具调用停止时，执行每个调用并把结果作为 tool_result 回填，再次提交。
/// 超过 `max_rounds` 后移除工具强制模型直接作答。
pub async fn complete_with_tools(
    client: &dyn LlmClient,
    mut request: CompletionRequest,
    executor: &dyn ToolExecutor,
    max_rounds: u32,
) -> Result<CompletionResponse, LlmError> {
    let mut rounds = 0;
    loop {
        let response = client.complete(request.clone()).await?;

        if response.stop_reason != StopReason::ToolUse || response.tool_calls.is_empty() {
            return Ok(response);
        }

        if rounds >= max_rounds {
            warn!(rounds, "tool round limit reached, asking for a direct answer");
            request.tools.clear();
            return client.complete(request).await;
        }
        rounds += 1;

        let mut assistant_blocks = Vec::new();
        if let Some(text) = response.content.as_ref().filter(|t| !t.is_empty()) {
            assistant_blocks.push(ContentBlock::text(text.clone()));
        }
        let mut result_blocks = Vec::new();

        for call in &response.tool_calls {
            debug!(tool = %call.name, "executing tool call");
            assistant_blocks.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
            });
            let block = match executor.execute(call).await {
                Ok(content) => ContentBlock::tool_result(&call.id, content, false),
                Err(message) => ContentBlock::tool_result(&call.id, message, true),
            };
            result_blocks.push(block);
        }

        request.messages.push(Message::assistant_blocks(assistant_blocks));
        request.messages.push(Message::user_blocks(result_blocks));
    }
}
