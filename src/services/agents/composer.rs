//! Composer：生成最终回复
//!
//! 输出格式为回复正文，接一行 `---META---`，再接元数据 JSON。
//! 流式模式下只把分隔符之前的正文作为 `text_chunk` 发出。

use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

use super::TurnContext;
use super::prompts::composer_prompt;
use crate::config::config::BudgetConfig;
use crate::llm::{CompletionRequest, LlmClient, LlmError, StreamChunk};
use crate::models::agent::{AnalyzerResult, ComposedReply, PlanRecommendation, Tone};
use crate::models::profile::ProfileDelta;
use crate::models::route::DispatchRoute;
use crate::services::dispatcher::is_dangerous;
use crate::services::fallback::FallbackEngine;
use crate::services::json_extract::extract_json;
use crate::streaming::{EventSink, TurnEvent};

pub const META_DELIMITER: &str = "---META---";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ComposerMeta {
    tone: Option<String>,
    follow_up: Option<String>,
    adaptation_note: Option<String>,
    profile_updates: Vec<ProfileDelta>,
}

/// 从增量文本中切掉元数据部分
///
/// 末尾可能是分隔符前缀的字符会被暂扣，直到能确定它不是分隔符。
#[derive(Debug, Default)]
pub struct MetaSplitter {
    pending: String,
    done: bool,
}

impl MetaSplitter {
    /// 追加一段增量，返回可以立即发出的正文
    pub fn push(&mut self, delta: &str) -> String {
        if self.done {
            return String::new();
        }
        self.pending.push_str(delta);

        if let Some(idx) = self.pending.find(META_DELIMITER) {
            let visible = self.pending[..idx].to_string();
            self.pending.clear();
            self.done = true;
            return visible;
        }

        let cut = self.pending.len() - held_suffix_len(&self.pending);
        self.pending.drain(..cut).collect()
    }

    /// 流结束，释放暂扣的文本
    pub fn finish(&mut self) -> String {
        if self.done {
            return String::new();
        }
        self.done = true;
        std::mem::take(&mut self.pending)
    }
}

fn held_suffix_len(text: &str) -> usize {
    (1..META_DELIMITER.len())
        .rev()
        .find(|&n| {
            n <= text.len() && text.is_char_boundary(text.len() - n) && META_DELIMITER.starts_with(&text[text.len() - n..])
        })
        .unwrap_or(0)
}

pub struct Composer {
    client: Arc<dyn LlmClient>,
    budgets: BudgetConfig,
    fallback: FallbackEngine,
}

impl Composer {
    pub fn new(client: Arc<dyn LlmClient>, budgets: BudgetConfig) -> Self {
        Self {
            client,
            budgets,
            fallback: FallbackEngine::new(),
        }
    }

    /// 不经过模型的回复：危险内容一律使用固定安全回复
    pub fn canned(&self, ctx: &TurnContext) -> Option<ComposedReply> {
        (ctx.route == DispatchRoute::Offtopic && is_dangerous(&ctx.text))
            .then(|| self.fallback.compose_lightweight(ctx.route, &ctx.text, ctx.name()))
    }

    /// 降级引擎生成的回复
    pub fn fallback_reply(
        &self,
        ctx: &TurnContext,
        analysis: Option<&AnalyzerResult>,
        plan: Option<&PlanRecommendation>,
    ) -> ComposedReply {
        match (analysis, plan) {
            (Some(analysis), Some(plan)) if !ctx.route.skips_pipeline() => {
                self.fallback.compose(&ctx.text, analysis, plan, ctx.name())
            }
            _ => self.fallback.compose_lightweight(ctx.route, &ctx.text, ctx.name()),
        }
    }

    /// 整体模式
    pub async fn compose(
        &self,
        ctx: &TurnContext,
        analysis: Option<&AnalyzerResult>,
        plan: Option<&PlanRecommendation>,
    ) -> Result<ComposedReply, LlmError> {
        if let Some(reply) = self.canned(ctx) {
            return Ok(reply);
        }
        let response = self.client.complete(self.request(ctx, analysis, plan)).await?;
        Ok(self.finish(response.text_or_empty(), ctx, analysis, plan))
    }

    /// 流式模式：正文增量写入 `sink`
    pub async fn compose_streaming(
        &self,
        ctx: &TurnContext,
        analysis: Option<&AnalyzerResult>,
        plan: Option<&PlanRecommendation>,
        sink: &EventSink,
    ) -> Result<ComposedReply, LlmError> {
        if let Some(reply) = self.canned(ctx) {
            sink.emit(TurnEvent::text_chunk(reply.text.clone())).await;
            return Ok(reply);
        }

        let (tx, mut rx) = mpsc::channel::<StreamChunk>(32);
        let forward = async {
            let mut splitter = MetaSplitter::default();
            while let Some(chunk) = rx.recv().await {
                if let StreamChunk::TextDelta(delta) = chunk {
                    let visible = splitter.push(&delta);
                    if !visible.is_empty() {
                        sink.emit(TurnEvent::text_chunk(visible)).await;
                    }
                }
            }
            let tail = splitter.finish();
            if !tail.is_empty() {
                sink.emit(TurnEvent::text_chunk(tail)).await;
            }
        };

        let (result, ()) = tokio::join!(self.client.stream(self.request(ctx, analysis, plan), tx), forward);
        let response = result?;
        Ok(self.finish(response.text_or_empty(), ctx, analysis, plan))
    }

    fn request(
        &self,
        ctx: &TurnContext,
        analysis: Option<&AnalyzerResult>,
        plan: Option<&PlanRecommendation>,
    ) -> CompletionRequest {
        let mut sections = Vec::new();
        let memory = ctx.memory_block();
        if !memory.is_empty() {
            sections.push(memory);
        }
        if !ctx.route.skips_pipeline() {
            sections.push(ctx.wearable_block());
        }
        if let Some(analysis) = analysis {
            sections.push(format!(
                "Analysis: {} Energy {}/100.",
                analysis.summary, analysis.energy_score
            ));
        }
        if let Some(plan) = plan
            && let Ok(json) = serde_json::to_string(plan)
        {
            sections.push(format!("Plan: {}", json));
        }

        CompletionRequest::new(
            composer_prompt(ctx.route),
            ctx.messages(&sections.join("\n\n")),
            self.budgets.composer(ctx.route),
        )
    }

    /// 解析模型输出；缺失的元数据取降级回复中的对应值
    fn finish(
        &self,
        raw: &str,
        ctx: &TurnContext,
        analysis: Option<&AnalyzerResult>,
        plan: Option<&PlanRecommendation>,
    ) -> ComposedReply {
        let defaults = self.fallback_reply(ctx, analysis, plan);
        let (text, meta_raw) = match raw.find(META_DELIMITER) {
            Some(idx) => (raw[..idx].trim(), &raw[idx + META_DELIMITER.len()..]),
            None => (raw.trim(), ""),
        };

        if text.is_empty() {
            warn!(session_id = %ctx.session_id, stage = "composer", "empty reply, using rule-based reply");
            return defaults;
        }

        let meta = if meta_raw.trim().is_empty() {
            ComposerMeta::default()
        } else {
            extract_json::<ComposerMeta>(meta_raw).unwrap_or_else(|e| {
                warn!(session_id = %ctx.session_id, stage = "composer", error = %e, "invalid reply metadata, using defaults");
                ComposerMeta::default()
            })
        };

        let non_empty = |s: Option<String>| s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        ComposedReply {
            text: text.to_string(),
            tone: meta
                .tone
                .as_deref()
                .and_then(|t| t.parse::<Tone>().ok())
                .unwrap_or(defaults.tone),
            follow_up: non_empty(meta.follow_up).unwrap_or(defaults.follow_up),
            adaptation_note: non_empty(meta.adaptation_note),
            profile_updates: if meta.profile_updates.is_empty() {
                defaults.profile_updates
            } else {
                meta.profile_updates
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::mock::{MockLlmClient, MockReply};
    use crate::services::agents::test_support::context;

    fn composer(replies: Vec<MockReply>) -> (Composer, Arc<MockLlmClient>) {
        let client = Arc::new(MockLlmClient::new(replies));
        (Composer::new(client.clone(), BudgetConfig::default()), client)
    }

    #[test]
    fn test_splitter_holds_back_partial_delimiter() {
        let mut splitter = MetaSplitter::default();
        assert_eq!(splitter.push("Rest well tonight.\n--"), "Rest well tonight.\n");
        assert_eq!(splitter.push("-ME"), "");
        assert_eq!(splitter.push("TA---{\"tone\":\"calm\"}"), "");
        assert_eq!(splitter.push(" more meta"), "");
        assert_eq!(splitter.finish(), "");
    }

    #[test]
    fn test_splitter_releases_false_prefix() {
        let mut splitter = MetaSplitter::default();
        assert_eq!(splitter.push("a -"), "a ");
        assert_eq!(splitter.push("- b"), "-- b");
        assert_eq!(splitter.push(" end-"), " end");
        assert_eq!(splitter.finish(), "-");
    }

    #[tokio::test]
    async fn test_compose_parses_meta() {
        let (composer, client) = composer(vec![MockReply::text(
            "Sounds like a long day. Try an early night.\n---META---\n{\"tone\": \"supportive\", \"follow_up\": \"How did you sleep?\", \"adaptation_note\": \"prefers short replies\"}",
        )]);
        let reply = composer.compose(&context("I'm tired"), None, None).await.unwrap();
        assert_eq!(reply.text, "Sounds like a long day. Try an early night.");
        assert_eq!(reply.tone, Tone::Supportive);
        assert_eq!(reply.follow_up, "How did you sleep?");
        assert_eq!(reply.adaptation_note.as_deref(), Some("prefers short replies"));
        assert_eq!(client.requests()[0].max_tokens, BudgetConfig::default().full.max_tokens);
    }

    #[tokio::test]
    async fn test_missing_meta_uses_defaults() {
        let (composer, _) = composer(vec![MockReply::text("Hello! How are you feeling?")]);
        let mut ctx = context("hi, I'm allergic to kiwi.");
        ctx.route = DispatchRoute::Greeting;
        let reply = composer.compose(&ctx, None, None).await.unwrap();
        assert_eq!(reply.text, "Hello! How are you feeling?");
        assert_eq!(reply.tone, Tone::Warm);
        assert!(reply.adaptation_note.is_none());
        assert_eq!(reply.profile_updates, vec![ProfileDelta::new("allergy", "kiwi")]);
    }

    #[tokio::test]
    async fn test_empty_reply_uses_rule_based_reply() {
        let (composer, _) = composer(vec![MockReply::text("---META---{}")]);
        let mut ctx = context("ok thanks");
        ctx.route = DispatchRoute::Quick;
        let reply = composer.compose(&ctx, None, None).await.unwrap();
        assert!(reply.text.starts_with("You're welcome"));
    }

    #[tokio::test]
    async fn test_dangerous_content_never_reaches_model() {
        let (composer, client) = composer(vec![]);
        let mut ctx = context("should I drink bleach");
        ctx.route = DispatchRoute::Offtopic;
        let reply = composer.compose(&ctx, None, None).await.unwrap();
        assert!(reply.text.contains("988"));
        assert_eq!(reply.tone, Tone::Cautious);
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_streaming_emits_only_reply_text() {
        let (composer, _) = composer(vec![MockReply::text(
            "Drink some water and rest. ---META--- {\"tone\": \"calm\"}",
        )]);
        let (sink, mut rx) = EventSink::channel(64);
        let reply = composer
            .compose_streaming(&context("headache"), None, None, &sink)
            .await
            .unwrap();
        drop(sink);

        let mut streamed = String::new();
        while let Some(event) = rx.recv().await {
            if let TurnEvent::TextChunk { text, .. } = event {
                streamed.push_str(&text);
            }
        }
        assert_eq!(streamed.trim(), "Drink some water and rest.");
        assert_eq!(reply.text, "Drink some water and rest.");
        assert_eq!(reply.tone, Tone::Calm);
    }

    #[tokio::test]
    async fn test_streaming_transport_error_is_returned() {
        let (composer, _) = composer(vec![MockReply::BrokenStream("Drink some ".into())]);
        let (sink, _rx) = EventSink::channel(64);
        let err = composer
            .compose_streaming(&context("headache"), None, None, &sink)
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }
}
