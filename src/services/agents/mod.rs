//! 流水线各阶段的模型代理
//!
//! 每个代理只负责组装提示词、调用模型、解析输出；解析失败时用降级引擎的
//! 同阶段输出替代。模型调用错误原样返回，由 Coordinator 判断是配额耗尽还是硬失败。

pub mod analyzer;
pub mod composer;
pub mod planner;
pub mod prompts;
pub mod validator;

pub use analyzer::Analyzer;
pub use composer::{Composer, META_DELIMITER, MetaSplitter};
pub use planner::Planner;
pub use validator::Validator;

use crate::llm::{ContentBlock, Message};
use crate::models::profile::UserContext;
use crate::models::route::DispatchRoute;
use crate::models::session::{ImageAttachment, Role, Turn};
use crate::models::wearable::WearableSnapshot;

/// 提示词里附带的历史轮数
const PROMPT_HISTORY_TURNS: usize = 6;

/// 一轮对话中所有代理共享的只读上下文
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub session_id: String,
    pub route: DispatchRoute,
    pub text: String,
    pub image: Option<ImageAttachment>,
    /// 本轮之前的历史
    pub history: Vec<Turn>,
    pub notes: Vec<String>,
    pub facts: Vec<String>,
    pub user_context: UserContext,
    pub wearable: WearableSnapshot,
    pub feedback: Option<String>,
}

impl TurnContext {
    pub fn name(&self) -> Option<&str> {
        self.user_context.name.as_deref().map(str::trim).filter(|n| !n.is_empty())
    }

    /// 当前用户消息，图片作为独立内容块
    pub fn user_message(&self, preamble: &str) -> Message {
        let mut text = String::new();
        if !preamble.is_empty() {
            text.push_str(preamble);
            text.push_str("\n\n");
        }
        text.push_str("User message: ");
        text.push_str(if self.text.trim().is_empty() { "(empty)" } else { self.text.trim() });

        match &self.image {
            Some(image) => Message::user_blocks(vec![
                ContentBlock::image(image.media_type.clone(), image.data.clone()),
                ContentBlock::text(text),
            ]),
            None => Message::user(text),
        }
    }

    /// 最近的历史，转换成模型消息
    pub fn history_messages(&self) -> Vec<Message> {
        let skip = self.history.len().saturating_sub(PROMPT_HISTORY_TURNS);
        self.history[skip..]
            .iter()
            .map(|turn| match turn.role {
                Role::User => Message::user(turn.content.clone()),
                Role::Assistant => Message::assistant(turn.content.clone()),
            })
            .collect()
    }

    /// 记忆片段：档案、事实、适应性备注、反馈
    pub fn memory_block(&self) -> String {
        let mut lines = Vec::new();
        let profile = self.user_context.describe();
        if !profile.is_empty() {
            lines.push(format!("Profile: {}", profile));
        }
        if !self.facts.is_empty() {
            lines.push(format!("Known facts: {}", self.facts.join("; ")));
        }
        if !self.notes.is_empty() {
            lines.push(format!("Adaptation notes: {}", self.notes.join("; ")));
        }
        if let Some(feedback) = self.feedback.as_deref().filter(|f| !f.trim().is_empty()) {
            lines.push(format!("Feedback on the last reply: {}", feedback.trim()));
        }
        lines.join("\n")
    }

    pub fn wearable_block(&self) -> String {
        let w = &self.wearable;
        format!(
            "Wearable ({}): {} steps, {:.1} h sleep, {} stress, resting HR {} bpm, {} active minutes",
            format!("{:?}", w.source).to_lowercase(),
            w.steps,
            w.sleep_hours,
            w.stress,
            w.resting_heart_rate,
            w.active_minutes
        )
    }

    /// 消息列表：历史 + 当前消息
    pub fn messages(&self, preamble: &str) -> Vec<Message> {
        let mut messages = self.history_messages();
        messages.push(self.user_message(preamble));
        messages
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::context;
    use super::*;
    use crate::llm::MessageContent;

    #[test]
    fn test_history_is_trimmed_to_recent_turns() {
        let mut ctx = context("hi");
        for i in 0..10 {
            ctx.history.push(Turn::user(format!("u{}", i)));
        }
        let messages = ctx.messages("");
        assert_eq!(messages.len(), PROMPT_HISTORY_TURNS + 1);
        assert_eq!(messages[0].content.as_text(), Some("u4"));
    }

    #[test]
    fn test_image_becomes_content_block() {
        let mut ctx = context("what do you think of my lunch?");
        ctx.image = Some(ImageAttachment {
            media_type: "image/jpeg".into(),
            data: "AAAA".into(),
        });
        match ctx.user_message("").content {
            MessageContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert!(matches!(blocks[0], ContentBlock::Image { .. }));
            }
            other => panic!("expected blocks, got {:?}", other),
        }
    }

    #[test]
    fn test_memory_block_includes_feedback() {
        let mut ctx = context("hi");
        ctx.facts = vec!["allergy: peanut".into()];
        ctx.feedback = Some("shorter please".into());
        let block = ctx.memory_block();
        assert!(block.contains("Known facts: allergy: peanut"));
        assert!(block.contains("Feedback on the last reply: shorter please"));
        assert!(ctx.wearable_block().contains("4200 steps"));
    }
}
