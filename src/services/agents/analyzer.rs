//! Analyzer：估计能量分数并识别话题

use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use super::TurnContext;
use super::prompts::ANALYZER_PROMPT;
use crate::config::config::Budget;
use crate::llm::{CompletionRequest, LlmClient, LlmError};
use crate::models::agent::{AnalyzerResult, Topic};
use crate::services::fallback::{FallbackEngine, detect_topics};
use crate::services::json_extract::extract_json;

#[derive(Debug, Deserialize)]
struct AnalyzerOutput {
    #[serde(default)]
    summary: String,
    energy_score: f64,
    #[serde(default)]
    signals: Vec<String>,
    #[serde(default)]
    risk_flags: Vec<String>,
    #[serde(default)]
    topics: Vec<String>,
}

pub struct Analyzer {
    client: Arc<dyn LlmClient>,
    budget: Budget,
    fallback: FallbackEngine,
}

impl Analyzer {
    pub fn new(client: Arc<dyn LlmClient>, budget: Budget) -> Self {
        Self {
            client,
            budget,
            fallback: FallbackEngine::new(),
        }
    }

    /// 返回未经稳定化的分析结果
    pub async fn run(&self, ctx: &TurnContext) -> Result<AnalyzerResult, LlmError> {
        let preamble = [ctx.wearable_block(), ctx.memory_block()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let request = CompletionRequest::new(ANALYZER_PROMPT, ctx.messages(&preamble), self.budget);

        let response = self.client.complete(request).await?;
        match parse_analysis(response.text_or_empty(), &ctx.text) {
            Some(result) => Ok(result),
            None => {
                warn!(session_id = %ctx.session_id, stage = "analyzer", "unparsable analysis, using rule-based analysis");
                Ok(self.fallback.analyze(&ctx.text, &ctx.wearable))
            }
        }
    }
}

fn parse_analysis(raw: &str, text: &str) -> Option<AnalyzerResult> {
    let output: AnalyzerOutput = extract_json(raw).ok()?;
    if !output.energy_score.is_finite() {
        return None;
    }

    let mut topics: Vec<Topic> = output.topics.iter().filter_map(|t| t.parse().ok()).collect();
    if topics.is_empty() {
        topics = detect_topics(text);
    }
    if topics.iter().any(|t| *t != Topic::Positive) {
        topics.retain(|t| *t != Topic::Positive);
    }
    topics.sort();
    topics.dedup();

    let summary = if output.summary.trim().is_empty() {
        format!("Energy estimated at {}/100.", output.energy_score.round())
    } else {
        output.summary.trim().to_string()
    };

    Some(AnalyzerResult {
        summary,
        energy_score: output.energy_score.round().clamp(0.0, 100.0) as u8,
        signals: output.signals,
        risk_flags: output.risk_flags,
        topics,
    })
}
