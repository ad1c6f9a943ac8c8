//! Planner：把分析结果变成当天的行动计划
//!
//! 通过 `lookup_nutrition` 工具按需查询营养信息。

use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use super::TurnContext;
use super::prompts::{PLANNER_PROMPT, corrective_feedback};
use super::validator::describe_conflicts;
use crate::config::config::Budget;
use crate::llm::{CompletionRequest, LlmClient, LlmError, complete_with_tools};
use crate::models::agent::{AnalyzerResult, Conflict, PlanRecommendation};
use crate::services::fallback::FallbackEngine;
use crate::services::json_extract::extract_json;
use crate::services::nutrition::{NutritionFact, NutritionProvider, NutritionTool};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PlanOutput {
    summary: String,
    diet: Vec<String>,
    exercise: Vec<String>,
    hydration: Vec<String>,
    recovery: Vec<String>,
    context: Vec<String>,
}

impl From<PlanOutput> for PlanRecommendation {
    fn from(output: PlanOutput) -> Self {
        let clean = |items: Vec<String>| -> Vec<String> {
            items
                .into_iter()
                .map(|i| i.trim().to_string())
                .filter(|i| !i.is_empty())
                .collect()
        };
        PlanRecommendation {
            summary: output.summary.trim().to_string(),
            diet: clean(output.diet),
            exercise: clean(output.exercise),
            hydration: clean(output.hydration),
            recovery: clean(output.recovery),
            context: clean(output.context),
        }
    }
}

pub struct Planner {
    client: Arc<dyn LlmClient>,
    budget: Budget,
    tool: NutritionTool,
    max_tool_rounds: u32,
    fallback: FallbackEngine,
}

impl Planner {
    pub fn new(
        client: Arc<dyn LlmClient>,
        budget: Budget,
        nutrition: Arc<dyn NutritionProvider>,
        max_tool_rounds: u32,
    ) -> Self {
        Self {
            client,
            budget,
            tool: NutritionTool::new(nutrition),
            max_tool_rounds,
            fallback: FallbackEngine::new(),
        }
    }

    /// 生成计划；`corrections` 非空时作为上一版计划的纠正反馈
    pub async fn run(
        &self,
        ctx: &TurnContext,
        analysis: &AnalyzerResult,
        nutrition: &[NutritionFact],
        corrections: &[Conflict],
    ) -> Result<PlanRecommendation, LlmError> {
        let request = CompletionRequest::new(
            PLANNER_PROMPT,
            ctx.messages(&render_planner_input(ctx, analysis, nutrition, corrections)),
            self.budget,
        )
        .with_tools(vec![NutritionTool::definition()]);

        let response = complete_with_tools(self.client.as_ref(), request, &self.tool, self.max_tool_rounds).await?;

        match extract_json::<PlanOutput>(response.text_or_empty()).map(PlanRecommendation::from) {
            Ok(plan) if !plan.is_empty() => Ok(plan),
            Ok(_) => {
                warn!(session_id = %ctx.session_id, stage = "planner", "empty plan, using rule-based plan");
                Ok(self.fallback_plan(ctx, analysis, nutrition))
            }
            Err(e) => {
                warn!(session_id = %ctx.session_id, stage = "planner", error = %e, "unparsable plan, using rule-based plan");
                Ok(self.fallback_plan(ctx, analysis, nutrition))
            }
        }
    }

    /// 规则计划，附带营养上下文
    pub fn fallback_plan(
        &self,
        ctx: &TurnContext,
        analysis: &AnalyzerResult,
        nutrition: &[NutritionFact],
    ) -> PlanRecommendation {
        let mut plan = self.fallback.plan(&ctx.text, analysis);
        for fact in nutrition {
            let line = fact.describe();
            if !plan.context.contains(&line) {
                plan.context.push(line);
            }
        }
        plan
    }
}

fn render_planner_input(
    ctx: &TurnContext,
    analysis: &AnalyzerResult,
    nutrition: &[NutritionFact],
    corrections: &[Conflict],
) -> String {
    let mut sections = vec![
        format!(
            "Analysis: {} Energy {}/100. Topics: {}. Risk flags: {}.",
            analysis.summary,
            analysis.energy_score,
            analysis.topics.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(", "),
            if analysis.risk_flags.is_empty() {
                "none".to_string()
            } else {
                analysis.risk_flags.join(", ")
            }
        ),
        ctx.wearable_block(),
    ];

    let memory = ctx.memory_block();
    if !memory.is_empty() {
        sections.push(memory);
    }
    if !nutrition.is_empty() {
        sections.push(format!(
            "Nutrition facts for foods mentioned:\n- {}",
            nutrition.iter().map(NutritionFact::describe).collect::<Vec<_>>().join("\n- ")
        ));
    }
    if !corrections.is_empty() {
        sections.push(corrective_feedback(&describe_conflicts(corrections)));
    }
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MessageContent;
    use crate::llm::client::mock::{MockLlmClient, MockReply};
    use crate::models::agent::Topic;
    use crate::services::agents::test_support::context;
    use crate::services::nutrition::{LOOKUP_TOOL, StaticNutritionTable};

    fn planner(replies: Vec<MockReply>) -> (Planner, Arc<MockLlmClient>) {
        let client = Arc::new(MockLlmClient::new(replies));
        let planner = Planner::new(client.clone(), Budget::new(900, 0.4), Arc::new(StaticNutritionTable::new()), 2);
        (planner, client)
    }

    fn analysis() -> AnalyzerResult {
        AnalyzerResult {
            summary: "Drained after work.".into(),
            energy_score: 35,
            signals: vec![],
            risk_flags: vec![],
            topics: vec![Topic::Fatigue],
        }
    }

    fn last_user_text(client: &MockLlmClient, call: usize) -> String {
        let request = &client.requests()[call];
        match &request.messages.last().unwrap().content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(_) => String::new(),
        }
    }

    #[tokio::test]
    async fn test_plan_from_model() {
        let (planner, client) = planner(vec![MockReply::text(
            r#"{"summary": "Recharge", "diet": ["Oats with banana"], "exercise": ["Short walk"], "hydration": ["Water"], "recovery": ["Early night"]}"#,
        )]);
        let plan = planner.run(&context("tired"), &analysis(), &[], &[]).await.unwrap();
        assert_eq!(plan.diet, vec!["Oats with banana"]);
        assert!(plan.context.is_empty());
        assert_eq!(client.requests()[0].tools.len(), 1);
    }

    #[tokio::test]
    async fn test_tool_call_round_trip() {
        let (planner, client) = planner(vec![
            MockReply::ToolCall {
                name: LOOKUP_TOOL.into(),
                input: serde_json::json!({"food": "salmon"}),
            },
            MockReply::text(r#"{"summary": "Fish night", "diet": ["Baked salmon with rice"]}"#),
        ]);
        let plan = planner.run(&context("what should I eat"), &analysis(), &[], &[]).await.unwrap();
        assert_eq!(plan.diet, vec!["Baked salmon with rice"]);
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_corrections_are_injected() {
        let (planner, client) = planner(vec![MockReply::text(r#"{"diet": ["Oats"]}"#)]);
        let conflicts = vec![Conflict {
            category: "diet".into(),
            item: "Peanut butter toast".into(),
            constraint: "allergy: peanut".into(),
        }];
        planner.run(&context("tired"), &analysis(), &[], &conflicts).await.unwrap();
        let sent = last_user_text(&client, 0);
        assert!(sent.contains("conflicted with the user's constraints"));
        assert!(sent.contains("Peanut butter toast"));
    }

    #[tokio::test]
    async fn test_empty_or_invalid_plan_uses_rule_based_plan() {
        let table = StaticNutritionTable::new();
        let facts = table.find("oatmeal");
        for reply in ["{}", "no json here"] {
            let (planner, _) = planner(vec![MockReply::text(reply)]);
            let plan = planner.run(&context("so tired"), &analysis(), &facts, &[]).await.unwrap();
            assert!(!plan.is_empty());
            assert!(plan.context.iter().any(|c| c.starts_with("oats (1 cup cooked)")));
        }
    }
}
