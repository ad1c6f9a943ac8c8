//! 流水线协调器
//!
//! 每轮状态：Dispatched → Analyzed → Planned → Validated? → Composed → Persisted。
//!
//! - greeting/quick/offtopic 直接进入 Composer
//! - followup 跳过 Analyzer，沿用上一轮的能量分数
//! - full/photo 并发运行 Analyzer 与营养查询，再运行 Planner
//! - 有约束时运行 Validator，冲突则带着冲突列表重新规划一次，第二版无条件接受
//!
//! 模型配额耗尽时本轮剩余阶段切换到降级引擎；其他模型错误作为硬失败返回。
//! 客户端断开视为取消：停止发事件并丢弃进行中的模型调用，已排队的记忆写入仍会完成。

use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::config::config::{AppConfig, ScoringConfig};
use crate::llm::{LlmClient, LlmError};
use crate::models::agent::{
    AgentStage, AnalyzerResult, ComposedReply, Conflict, PlanRecommendation, Topic, TurnResult, ValidationVerdict,
};
use crate::models::profile::{ProfileDelta, UserContext};
use crate::models::route::{DecisionSource, DispatchRoute};
use crate::models::session::{ImageAttachment, SessionSnapshot, Turn};
use crate::models::wearable::{WearableInput, WearableSnapshot};
use crate::observability::AppMetrics;
use crate::services::agents::{Analyzer, Composer, Planner, TurnContext, Validator};
use crate::services::dispatcher::Dispatcher;
use crate::services::fallback::{FallbackEngine, detect_topics, energy_from_wearable};
use crate::services::memory_store::SessionMemoryStore;
use crate::services::nutrition::{NutritionFact, NutritionProvider};
use crate::services::scoring::stabilize;
use crate::streaming::{EventSink, TurnEvent};

/// 调用方提交的一轮对话
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub session_id: String,
    pub message: String,
    pub feedback: Option<String>,
    pub image: Option<ImageAttachment>,
    pub user_context: Option<UserContext>,
    pub wearable: Option<WearableInput>,
}

impl TurnRequest {
    pub fn new(session_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            message: message.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// 客户端断开
    #[error("turn cancelled by client disconnect")]
    Cancelled,

    /// 非配额类的模型错误
    #[error("model call failed at stage {stage}")]
    ModelHardFailure { stage: AgentStage },
}

impl PipelineError {
    /// 返回给调用方的脱敏消息
    pub fn public_message(&self) -> String {
        match self {
            PipelineError::Cancelled => "The request was cancelled.".to_string(),
            PipelineError::ModelHardFailure { .. } => {
                "The coaching service is temporarily unavailable. Please try again in a moment.".to_string()
            }
        }
    }
}

#[derive(Debug, Default)]
struct TurnState {
    fallback: bool,
    replanned: bool,
}

/// 本轮排队的记忆写入，轮次结束（含取消与失败）时统一落盘
#[derive(Debug, Default)]
struct PendingWrites {
    notes: Vec<String>,
    user_turn: Option<Turn>,
    assistant_turn: Option<Turn>,
    facts: Vec<String>,
    analysis: Option<(u8, Vec<Topic>)>,
    wearable: Option<WearableSnapshot>,
}

impl PendingWrites {
    fn flush(self, memory: &SessionMemoryStore, session_id: &str) {
        if let Some(turn) = self.user_turn {
            memory.append(session_id, turn);
        }
        if let Some(turn) = self.assistant_turn {
            memory.append(session_id, turn);
        }
        for note in self.notes {
            memory.add_adaptation_note(session_id, note);
        }
        for fact in self.facts {
            memory.add_user_fact(session_id, fact);
        }
        if let Some((score, topics)) = self.analysis {
            memory.record_analysis(session_id, score, topics);
        }
        if let Some(wearable) = self.wearable {
            memory.set_wearable(session_id, wearable);
        }
    }
}

fn payload<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// 在客户端断开时放弃等待
async fn guarded<T>(sink: &EventSink, fut: impl Future<Output = T>) -> Result<T, PipelineError> {
    tokio::select! {
        biased;
        _ = sink.closed() => Err(PipelineError::Cancelled),
        out = fut => Ok(out),
    }
}

async fn emit(sink: &EventSink, event: TurnEvent) -> Result<(), PipelineError> {
    if sink.emit(event).await {
        Ok(())
    } else {
        Err(PipelineError::Cancelled)
    }
}

/// 从会话事实里恢复约束（"allergy: x" / "dislike: x"）
fn merge_fact_constraints(user: &mut UserContext, facts: &[String]) {
    for fact in facts {
        let Some((key, value)) = fact.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        let list = match key.trim() {
            "allergy" => &mut user.allergies,
            "dislike" => &mut user.dislikes,
            _ => continue,
        };
        if !value.is_empty() && !list.iter().any(|v| v.eq_ignore_ascii_case(&value)) {
            list.push(value);
        }
    }
}

/// 按会话键串行化的锁表
///
/// 文本轮次与语音轮次共用同一张表，保证同一会话的历史追加不会交错。
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 等待并持有会话锁，guard 释放前其他轮次阻塞
    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(session_id.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    /// 移除无人持有且会话已不存在的锁
    fn retain_active(&self, memory: &SessionMemoryStore) {
        self.locks
            .retain(|id, lock| Arc::strong_count(lock) > 1 || memory.contains(id));
    }
}

pub struct Coordinator {
    memory: Arc<SessionMemoryStore>,
    dispatcher: Dispatcher,
    analyzer: Analyzer,
    planner: Planner,
    composer: Composer,
    nutrition: Arc<dyn NutritionProvider>,
    fallback: FallbackEngine,
    scoring: ScoringConfig,
    mock_wearable: bool,
    metrics: Arc<AppMetrics>,
    locks: Arc<SessionLocks>,
}

impl Coordinator {
    pub fn new(
        config: &AppConfig,
        client: Arc<dyn LlmClient>,
        nutrition: Arc<dyn NutritionProvider>,
        memory: Arc<SessionMemoryStore>,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(client.clone(), config.budgets.classifier),
            analyzer: Analyzer::new(client.clone(), config.budgets.analyzer),
            planner: Planner::new(
                client.clone(),
                config.budgets.planner,
                nutrition.clone(),
                config.llm.max_tool_rounds,
            ),
            composer: Composer::new(client, config.budgets.clone()),
            nutrition,
            fallback: FallbackEngine::new(),
            scoring: config.scoring.clone(),
            mock_wearable: config.wearable.mock_enabled,
            memory,
            metrics,
            locks: Arc::new(SessionLocks::new()),
        }
    }

    pub fn memory(&self) -> &Arc<SessionMemoryStore> {
        &self.memory
    }

    /// 只读会话状态；未知会话返回空状态与合成的可穿戴快照，不创建会话
    pub fn session_state(&self, session_id: &str) -> SessionSnapshot {
        let mut snapshot = self
            .memory
            .snapshot(session_id)
            .unwrap_or_else(|| SessionSnapshot::empty(session_id));
        if snapshot.wearable.is_none() {
            snapshot.wearable = Some(WearableSnapshot::resolve(session_id, None, "", self.mock_wearable, None));
        }
        snapshot
    }

    /// 清理过期会话及其空闲的会话锁
    pub fn sweep(&self) -> usize {
        let removed = self.memory.evict_expired();
        self.locks.retain_active(&self.memory);
        self.metrics.set_sessions_active(self.memory.session_count());
        removed
    }

    /// 会话锁表，语音轮次通过它与文本轮次串行
    pub fn session_locks(&self) -> Arc<SessionLocks> {
        self.locks.clone()
    }

    /// 执行一轮对话
    ///
    /// 流式调用方通过 `sink` 接收事件；成功时以 `final` + `done` 结束，
    /// 硬失败时以 `error` + `done` 结束，取消时不再发送任何事件。
    pub async fn run_turn(&self, request: TurnRequest, sink: EventSink) -> Result<TurnResult, PipelineError> {
        let _guard = self.locks.acquire(&request.session_id).await;
        self.metrics.record_turn();

        let mut pending = PendingWrites::default();
        let outcome = self.execute(&request, &sink, &mut pending).await;
        pending.flush(&self.memory, &request.session_id);
        self.metrics.set_sessions_active(self.memory.session_count());

        match &outcome {
            Ok(result) => {
                info!(
                    session_id = %request.session_id,
                    route = %result.decision.route,
                    fallback = result.fallback_used,
                    replanned = result.replanned,
                    "turn completed"
                );
                sink.emit(TurnEvent::Final {
                    result: Box::new(result.clone()),
                })
                .await;
                sink.emit(TurnEvent::Done).await;
            }
            Err(PipelineError::Cancelled) => {
                info!(session_id = %request.session_id, "client disconnected, turn cancelled");
                self.metrics.record_disconnect();
            }
            Err(e) => {
                sink.emit(TurnEvent::Error {
                    message: e.public_message(),
                })
                .await;
                sink.emit(TurnEvent::Done).await;
            }
        }
        outcome
    }

    async fn execute(
        &self,
        request: &TurnRequest,
        sink: &EventSink,
        pending: &mut PendingWrites,
    ) -> Result<TurnResult, PipelineError> {
        self.sweep();
        emit(sink, TurnEvent::status("Reading your check-in")).await?;

        let mut ctx = self.build_context(request);
        if let Some(feedback) = &ctx.feedback {
            pending.notes.push(format!("feedback: {}", feedback));
        }
        pending.user_turn = Some(Turn::user(ctx.text.clone()));
        pending.wearable = Some(ctx.wearable.clone());

        let decision = guarded(
            sink,
            self.dispatcher.classify(&ctx.text, ctx.image.is_some(), &ctx.history),
        )
        .await?;
        if decision.source == DecisionSource::Default {
            self.metrics.record_classification_failure();
        }
        info!(
            session_id = %ctx.session_id,
            stage = "dispatcher",
            route = %decision.route,
            confidence = decision.confidence,
            "turn dispatched"
        );
        ctx.route = decision.route;
        emit(
            sink,
            TurnEvent::agent_update(AgentStage::Dispatcher, format!("Route: {}", decision.route), payload(&decision)),
        )
        .await?;

        let mut state = TurnState::default();
        let (analysis, plan, validation) = if decision.route.skips_pipeline() {
            (None, None, None)
        } else {
            let (analysis, nutrition) = if decision.route.runs_analyzer() {
                self.analyze(&ctx, sink, &mut state).await?
            } else {
                (self.carry_over(&ctx), Vec::new())
            };
            pending.analysis = Some((analysis.energy_score, analysis.topics.clone()));
            emit(
                sink,
                TurnEvent::agent_update(AgentStage::Analyzer, analysis.summary.clone(), payload(&analysis)),
            )
            .await?;

            let (plan, validation) = self.plan(&ctx, &analysis, &nutrition, sink, &mut state).await?;
            (Some(analysis), Some(plan), validation)
        };

        let reply = self
            .compose(&ctx, analysis.as_ref(), plan.as_ref(), sink, &mut state)
            .await?;
        pending.assistant_turn = Some(Turn::assistant(reply.text.clone()));
        if let Some(note) = &reply.adaptation_note {
            pending.notes.push(note.clone());
        }
        pending.facts = reply.profile_updates.iter().map(ProfileDelta::as_fact).collect();
        emit(
            sink,
            TurnEvent::agent_update(
                AgentStage::Composer,
                "Reply ready",
                serde_json::json!({ "tone": reply.tone, "follow_up": reply.follow_up }),
            ),
        )
        .await?;

        Ok(TurnResult {
            session_id: ctx.session_id,
            decision,
            analysis,
            plan,
            validation,
            reply,
            fallback_used: state.fallback,
            replanned: state.replanned,
            wearable: ctx.wearable,
        })
    }

    fn build_context(&self, request: &TurnRequest) -> TurnContext {
        let session_id = request.session_id.as_str();
        let last_known = self.memory.wearable(session_id);
        let wearable = WearableSnapshot::resolve(
            session_id,
            request.wearable.as_ref(),
            &request.message,
            self.mock_wearable,
            last_known.as_ref(),
        );

        let facts = self.memory.facts(session_id);
        let mut user_context = request.user_context.clone().unwrap_or_default();
        merge_fact_constraints(&mut user_context, &facts);

        TurnContext {
            session_id: session_id.to_string(),
            route: DispatchRoute::Full,
            text: request.message.trim().to_string(),
            image: request.image.clone(),
            history: self.memory.recent_history(session_id),
            notes: self.memory.notes(session_id),
            facts,
            user_context,
            wearable,
            feedback: request
                .feedback
                .as_deref()
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(str::to_string),
        }
    }

    /// 配额耗尽时切换降级并继续；其他错误作为硬失败
    fn absorb(&self, ctx: &TurnContext, stage: AgentStage, err: LlmError, state: &mut TurnState) -> Result<(), PipelineError> {
        if err.is_quota_exhausted() {
            warn!(session_id = %ctx.session_id, stage = %stage, error = %err, "model quota exhausted, switching to fallback engine");
            if !state.fallback {
                state.fallback = true;
                self.metrics.record_fallback();
            }
            Ok(())
        } else {
            error!(session_id = %ctx.session_id, stage = %stage, "model call failed");
            debug!(session_id = %ctx.session_id, stage = %stage, error = %err, "upstream error detail");
            self.metrics.record_error();
            Err(PipelineError::ModelHardFailure { stage })
        }
    }

    async fn analyze(
        &self,
        ctx: &TurnContext,
        sink: &EventSink,
        state: &mut TurnState,
    ) -> Result<(AnalyzerResult, Vec<NutritionFact>), PipelineError> {
        emit(sink, TurnEvent::status("Analyzing your energy")).await?;

        let (result, nutrition) = guarded(sink, async {
            tokio::join!(self.analyzer.run(ctx), self.nutrition.lookup(&ctx.text))
        })
        .await?;

        let mut analysis = match result {
            Ok(analysis) => analysis,
            Err(e) => {
                self.absorb(ctx, AgentStage::Analyzer, e, state)?;
                self.fallback.analyze(&ctx.text, &ctx.wearable)
            }
        };

        let raw = analysis.energy_score;
        let prior = self.memory.last_energy_score(&ctx.session_id);
        analysis.energy_score = stabilize(raw, prior, &ctx.text, &self.scoring);
        if analysis.energy_score != raw {
            debug!(session_id = %ctx.session_id, stage = "analyzer", raw, ?prior, stabilized = analysis.energy_score, "energy score stabilized");
        }

        if !nutrition.is_empty() {
            emit(
                sink,
                TurnEvent::agent_update(
                    AgentStage::Nutrition,
                    format!("Found nutrition facts for {} food(s)", nutrition.len()),
                    payload(&nutrition),
                ),
            )
            .await?;
        }
        Ok((analysis, nutrition))
    }

    /// 追问路由的轻量分析
    fn carry_over(&self, ctx: &TurnContext) -> AnalyzerResult {
        let score = self
            .memory
            .last_energy_score(&ctx.session_id)
            .unwrap_or_else(|| energy_from_wearable(&ctx.wearable));
        let mut topics = self.memory.last_topics(&ctx.session_id);
        if topics.is_empty() {
            topics = detect_topics(&ctx.text);
        }
        AnalyzerResult::carried_over(score, topics)
    }

    async fn plan(
        &self,
        ctx: &TurnContext,
        analysis: &AnalyzerResult,
        nutrition: &[NutritionFact],
        sink: &EventSink,
        state: &mut TurnState,
    ) -> Result<(PlanRecommendation, Option<ValidationVerdict>), PipelineError> {
        emit(sink, TurnEvent::status("Building your plan")).await?;
        let plan = self.make_plan(ctx, analysis, nutrition, &[], sink, state).await?;
        emit(
            sink,
            TurnEvent::agent_update(AgentStage::Planner, plan.summary.clone(), payload(&plan)),
        )
        .await?;

        if !ctx.user_context.has_constraints() {
            return Ok((plan, None));
        }

        let verdict = Validator::validate(&plan, &ctx.user_context);
        let summary = if verdict.approved {
            "Plan fits your constraints".to_string()
        } else {
            format!("{} conflict(s) with your constraints", verdict.conflicts.len())
        };
        emit(sink, TurnEvent::agent_update(AgentStage::Validator, summary, payload(&verdict))).await?;
        if verdict.approved {
            return Ok((plan, Some(verdict)));
        }

        info!(
            session_id = %ctx.session_id,
            stage = "validator",
            conflicts = verdict.conflicts.len(),
            "plan conflicts with user constraints, re-planning once"
        );
        self.metrics.record_replan();
        state.replanned = true;
        emit(sink, TurnEvent::status("Adjusting the plan")).await?;

        let mut revised = self
            .make_plan(ctx, analysis, nutrition, &verdict.conflicts, sink, state)
            .await?;
        if state.fallback {
            revised = Validator::revise(&revised, &ctx.user_context);
        }
        let second = Validator::validate(&revised, &ctx.user_context);
        if !second.approved {
            warn!(
                session_id = %ctx.session_id,
                stage = "validator",
                conflicts = second.conflicts.len(),
                "revised plan still conflicts, accepting it"
            );
        }
        emit(
            sink,
            TurnEvent::agent_update(AgentStage::Planner, "Plan revised", payload(&revised)),
        )
        .await?;

        Ok((revised, Some(second)))
    }

    async fn make_plan(
        &self,
        ctx: &TurnContext,
        analysis: &AnalyzerResult,
        nutrition: &[NutritionFact],
        corrections: &[Conflict],
        sink: &EventSink,
        state: &mut TurnState,
    ) -> Result<PlanRecommendation, PipelineError> {
        if state.fallback {
            return Ok(self.planner.fallback_plan(ctx, analysis, nutrition));
        }
        match guarded(sink, self.planner.run(ctx, analysis, nutrition, corrections)).await? {
            Ok(plan) => Ok(plan),
            Err(e) => {
                self.absorb(ctx, AgentStage::Planner, e, state)?;
                Ok(self.planner.fallback_plan(ctx, analysis, nutrition))
            }
        }
    }

    async fn compose(
        &self,
        ctx: &TurnContext,
        analysis: Option<&AnalyzerResult>,
        plan: Option<&PlanRecommendation>,
        sink: &EventSink,
        state: &mut TurnState,
    ) -> Result<ComposedReply, PipelineError> {
        emit(sink, TurnEvent::status("Writing your reply")).await?;

        let mut interrupted = false;
        if !state.fallback {
            let first = if sink.is_streaming() {
                guarded(sink, self.composer.compose_streaming(ctx, analysis, plan, sink)).await?
            } else {
                guarded(sink, self.composer.compose(ctx, analysis, plan)).await?
            };

            let err = match first {
                Ok(reply) => return Ok(reply),
                Err(e) if sink.is_streaming() && e.is_transport() => {
                    warn!(session_id = %ctx.session_id, stage = "composer", error = %e, "stream interrupted, retrying in whole-response mode");
                    self.metrics.record_stream_fallback();
                    interrupted = true;
                    match guarded(sink, self.composer.compose(ctx, analysis, plan)).await? {
                        Ok(reply) => {
                            emit(sink, TurnEvent::replacement_text(reply.text.clone())).await?;
                            return Ok(reply);
                        }
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };
            self.absorb(ctx, AgentStage::Composer, err, state)?;
        }

        let reply = self.composer.fallback_reply(ctx, analysis, plan);
        let chunk = if interrupted {
            TurnEvent::replacement_text(reply.text.clone())
        } else {
            TurnEvent::text_chunk(reply.text.clone())
        };
        emit(sink, chunk).await?;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config::MemoryConfig;
    use crate::llm::client::mock::{MockLlmClient, MockReply};
    use crate::models::session::Role;
    use crate::models::wearable::{StressLevel, WearableSource};
    use crate::services::nutrition::StaticNutritionTable;
    use std::sync::atomic::Ordering;

    const ANALYSIS: &str = r#"{"summary": "Low energy after work", "energy_score": 38, "signals": ["short sleep"], "topics": ["fatigue"]}"#;
    const PEANUT_PLAN: &str = r#"{"summary": "Refuel", "diet": ["Peanut butter on rice cakes"], "exercise": ["Gentle walk"]}"#;
    const SAFE_PLAN: &str = r#"{"summary": "Refuel", "diet": ["Oats with banana"], "exercise": ["Gentle walk"]}"#;

    fn coordinator(replies: Vec<MockReply>) -> (Coordinator, Arc<MockLlmClient>, Arc<AppMetrics>) {
        let client = Arc::new(MockLlmClient::new(replies));
        let metrics = Arc::new(AppMetrics::default());
        let config = AppConfig::development();
        let coordinator = Coordinator::new(
            &config,
            client.clone(),
            Arc::new(StaticNutritionTable::new()),
            Arc::new(SessionMemoryStore::new(MemoryConfig::default())),
            metrics.clone(),
        );
        (coordinator, client, metrics)
    }

    fn tired_request() -> TurnRequest {
        TurnRequest {
            wearable: Some(WearableInput {
                steps: Some(4200),
                sleep_hours: Some(5.4),
                stress: Some(StressLevel::Moderate),
                ..Default::default()
            }),
            ..TurnRequest::new("s1", "I'm tired after work")
        }
    }

    async fn drain(mut rx: tokio::sync::mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_quota_mid_turn_switches_to_fallback() {
        let (coordinator, client, metrics) = coordinator(vec![MockReply::Quota]);
        let (sink, rx) = EventSink::channel(64);
        let result = coordinator.run_turn(tired_request(), sink).await.unwrap();
        let events = drain(rx).await;

        assert_eq!(result.decision.route, DispatchRoute::Full);
        assert!(result.fallback_used);
        let analysis = result.analysis.unwrap();
        assert!((20..=50).contains(&analysis.energy_score));
        assert!(analysis.topics.contains(&Topic::Fatigue));
        assert_eq!(result.wearable.source, WearableSource::Device);
        assert_eq!(client.call_count(), 1);
        assert_eq!(metrics.fallback_activations_total.load(Ordering::Relaxed), 1);

        assert!(!events.iter().any(|e| matches!(e, TurnEvent::Error { .. })));
        let n = events.len();
        assert!(matches!(events[n - 2], TurnEvent::Final { .. }));
        assert_eq!(events[n - 1], TurnEvent::Done);
        assert_eq!(coordinator.memory().size("s1"), 2);
    }

    #[tokio::test]
    async fn test_quick_route_skips_analysis_and_planning() {
        let (coordinator, client, _) = coordinator(vec![MockReply::text("You're welcome! Rest up.")]);
        let request = TurnRequest {
            feedback: Some("keep it short".into()),
            ..TurnRequest::new("s1", "ok thanks")
        };
        let result = coordinator.run_turn(request, EventSink::disabled()).await.unwrap();

        assert_eq!(result.decision.route, DispatchRoute::Quick);
        assert!(result.analysis.is_none());
        assert!(result.plan.is_none());
        assert_eq!(client.call_count(), 1);
        assert_eq!(result.reply.text, "You're welcome! Rest up.");

        let history = coordinator.memory().recent_history("s1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(coordinator.memory().notes("s1"), vec!["feedback: keep it short"]);

        let sent = format!("{:?}", client.requests()[0].messages);
        assert!(sent.contains("Feedback on the last reply: keep it short"));
    }

    #[tokio::test]
    async fn test_allergen_conflict_replans_exactly_once() {
        let (coordinator, client, metrics) = coordinator(vec![
            MockReply::text(ANALYSIS),
            MockReply::text(PEANUT_PLAN),
            MockReply::text(PEANUT_PLAN),
            MockReply::text("Here's your plan."),
        ]);
        let request = TurnRequest {
            user_context: Some(UserContext {
                allergies: vec!["peanut".into()],
                ..Default::default()
            }),
            ..TurnRequest::new("s1", "I'm exhausted, what should I eat?")
        };
        let result = coordinator.run_turn(request, EventSink::disabled()).await.unwrap();

        let verdict = result.validation.unwrap();
        assert!(!verdict.approved);
        assert_eq!(verdict.conflicts.len(), 1);
        assert!(result.replanned);
        // 第二版仍冲突也被接受
        assert_eq!(result.plan.unwrap().diet, vec!["Peanut butter on rice cakes"]);
        assert_eq!(client.call_count(), 4);
        assert_eq!(metrics.replans_total.load(Ordering::Relaxed), 1);

        let replan_request = format!("{:?}", client.requests()[2].messages);
        assert!(replan_request.contains("Peanut butter on rice cakes"));
    }

    #[tokio::test]
    async fn test_replan_reports_verdict_of_delivered_plan() {
        let (coordinator, _, _) = coordinator(vec![
            MockReply::text(ANALYSIS),
            MockReply::text(PEANUT_PLAN),
            MockReply::text(SAFE_PLAN),
            MockReply::text("Here's your plan."),
        ]);
        let request = TurnRequest {
            user_context: Some(UserContext {
                allergies: vec!["peanut".into()],
                ..Default::default()
            }),
            ..TurnRequest::new("s1", "I'm exhausted, what should I eat?")
        };
        let result = coordinator.run_turn(request, EventSink::disabled()).await.unwrap();

        assert!(result.replanned);
        assert_eq!(result.plan.unwrap().diet, vec!["Oats with banana"]);
        let verdict = result.validation.unwrap();
        assert!(verdict.approved);
        assert!(verdict.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_approved_plan_is_not_replanned() {
        let (coordinator, client, _) = coordinator(vec![
            MockReply::text(ANALYSIS),
            MockReply::text(SAFE_PLAN),
            MockReply::text("Here's your plan."),
        ]);
        let request = TurnRequest {
            user_context: Some(UserContext {
                allergies: vec!["peanut".into()],
                ..Default::default()
            }),
            ..TurnRequest::new("s1", "I'm exhausted, what should I eat?")
        };
        let result = coordinator.run_turn(request, EventSink::disabled()).await.unwrap();
        assert!(result.validation.unwrap().approved);
        assert!(!result.replanned);
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_hard_failure_emits_sanitized_error() {
        let (coordinator, _, metrics) =
            coordinator(vec![MockReply::Fail(500, "stack trace with sk-secret".into())]);
        let (sink, rx) = EventSink::channel(64);
        let err = coordinator.run_turn(tired_request(), sink).await.unwrap_err();
        let events = drain(rx).await;

        assert!(matches!(err, PipelineError::ModelHardFailure { stage: AgentStage::Analyzer }));
        let n = events.len();
        match &events[n - 2] {
            TurnEvent::Error { message } => assert!(!message.contains("secret")),
            other => panic!("expected error event, got {:?}", other),
        }
        assert_eq!(events[n - 1], TurnEvent::Done);
        assert!(!events.iter().any(|e| matches!(e, TurnEvent::Final { .. })));
        assert_eq!(metrics.errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_stream_failure_retries_whole_response() {
        let (coordinator, _, metrics) = coordinator(vec![
            MockReply::text(ANALYSIS),
            MockReply::text(SAFE_PLAN),
            MockReply::BrokenStream("Take it ".into()),
            MockReply::text("Take it easy tonight."),
        ]);
        let (sink, rx) = EventSink::channel(64);
        let result = coordinator.run_turn(tired_request(), sink).await.unwrap();
        let events = drain(rx).await;

        assert_eq!(result.reply.text, "Take it easy tonight.");
        let chunks: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, TurnEvent::TextChunk { .. }))
            .collect();
        assert_eq!(chunks.first(), Some(&&TurnEvent::text_chunk("Take it ")));
        // 重试得到的完整正文替换掉中断的部分
        assert_eq!(chunks.last(), Some(&&TurnEvent::replacement_text("Take it easy tonight.")));
        assert_eq!(metrics.stream_fallbacks_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_streaming_event_order() {
        let (coordinator, _, _) = coordinator(vec![
            MockReply::text(ANALYSIS),
            MockReply::text(SAFE_PLAN),
            MockReply::text("Rest well.\n---META---\n{\"tone\": \"calm\"}"),
        ]);
        let (sink, rx) = EventSink::channel(64);
        coordinator.run_turn(tired_request(), sink).await.unwrap();
        let types: Vec<_> = drain(rx).await.iter().map(|e| e.event_type()).collect();

        assert_eq!(types.first(), Some(&"status"));
        let first_chunk = types.iter().position(|t| *t == "text_chunk").unwrap();
        let final_at = types.iter().position(|t| *t == "final").unwrap();
        assert!(first_chunk < final_at);
        assert_eq!(&types[types.len() - 2..], &["final", "done"]);
        assert_eq!(types.iter().filter(|t| **t == "final").count(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_but_keeps_queued_writes() {
        let (coordinator, _, metrics) = coordinator(vec![
            MockReply::text(ANALYSIS),
            MockReply::text(SAFE_PLAN),
            MockReply::Hang,
        ]);
        let (sink, mut rx) = EventSink::channel(64);
        let consumer = async move {
            while let Some(event) = rx.recv().await {
                if matches!(&event, TurnEvent::Status { message } if message.starts_with("Writing")) {
                    break;
                }
            }
        };
        let (outcome, ()) = tokio::join!(coordinator.run_turn(tired_request(), sink), consumer);

        assert!(matches!(outcome, Err(PipelineError::Cancelled)));
        assert_eq!(metrics.stream_disconnects_total.load(Ordering::Relaxed), 1);
        let memory = coordinator.memory();
        assert_eq!(memory.size("s1"), 1);
        assert_eq!(memory.last_energy_score("s1"), Some(38));
        assert!(memory.wearable("s1").is_some());
    }

    #[tokio::test]
    async fn test_followup_carries_score_forward() {
        let (coordinator, client, _) = coordinator(vec![
            MockReply::Quota,
            MockReply::text(SAFE_PLAN),
            MockReply::text("Tomorrow, start with breakfast."),
        ]);
        let first = coordinator.run_turn(tired_request(), EventSink::disabled()).await.unwrap();
        let first_score = first.analysis.unwrap().energy_score;

        let second = coordinator
            .run_turn(TurnRequest::new("s1", "what about tomorrow?"), EventSink::disabled())
            .await
            .unwrap();
        assert_eq!(second.decision.route, DispatchRoute::Followup);
        let analysis = second.analysis.unwrap();
        assert_eq!(analysis.energy_score, first_score);
        assert!(analysis.topics.contains(&Topic::Fatigue));
        assert!(!second.fallback_used);
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_turns_are_serialized_per_session() {
        let (coordinator, _, _) = coordinator(vec![MockReply::text("Anytime!"), MockReply::text("Sure thing!")]);
        let (a, b) = tokio::join!(
            coordinator.run_turn(TurnRequest::new("s1", "ok thanks"), EventSink::disabled()),
            coordinator.run_turn(TurnRequest::new("s1", "thank you"), EventSink::disabled()),
        );
        assert!(a.is_ok() && b.is_ok());

        let roles: Vec<_> = coordinator.memory().recent_history("s1").iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_profile_updates_become_constraints() {
        let (coordinator, _, _) = coordinator(vec![MockReply::Quota]);
        coordinator
            .run_turn(
                TurnRequest::new("s1", "I'm tired after work and I'm allergic to shellfish."),
                EventSink::disabled(),
            )
            .await
            .unwrap();
        assert_eq!(coordinator.memory().facts("s1"), vec!["allergy: shellfish"]);

        let ctx = coordinator.build_context(&TurnRequest::new("s1", "what should I eat?"));
        assert_eq!(ctx.user_context.allergies, vec!["shellfish"]);
    }

    #[test]
    fn test_session_state_for_unknown_session() {
        let (coordinator, _, _) = coordinator(vec![]);
        let state = coordinator.session_state("nobody");
        assert_eq!(state.memory_size, 0);
        assert_eq!(state.wearable.unwrap().source, WearableSource::Mock);
        assert!(!coordinator.memory().contains("nobody"));
    }
}
