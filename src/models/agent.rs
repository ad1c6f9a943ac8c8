//! 流水线各阶段的输出类型

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::models::profile::ProfileDelta;
use crate::models::route::DispatchDecision;
use crate::models::wearable::WearableSnapshot;

/// 流水线阶段
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStage {
    Dispatcher,
    Analyzer,
    Nutrition,
    Planner,
    Validator,
    Composer,
}

impl AgentStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStage::Dispatcher => "dispatcher",
            AgentStage::Analyzer => "analyzer",
            AgentStage::Nutrition => "nutrition",
            AgentStage::Planner => "planner",
            AgentStage::Validator => "validator",
            AgentStage::Composer => "composer",
        }
    }
}

impl fmt::Display for AgentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 话题
///
/// 声明顺序即优先级：靠前的话题在多重匹配时成为主话题。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Fatigue,
    Stress,
    Pain,
    Headache,
    Sleep,
    Nutrition,
    Exercise,
    Motivation,
    Positive,
    General,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Fatigue => "fatigue",
            Topic::Stress => "stress",
            Topic::Pain => "pain",
            Topic::Headache => "headache",
            Topic::Sleep => "sleep",
            Topic::Nutrition => "nutrition",
            Topic::Exercise => "exercise",
            Topic::Motivation => "motivation",
            Topic::Positive => "positive",
            Topic::General => "general",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fatigue" | "tired" | "energy" => Ok(Topic::Fatigue),
            "stress" | "anxiety" => Ok(Topic::Stress),
            "pain" => Ok(Topic::Pain),
            "headache" | "migraine" => Ok(Topic::Headache),
            "sleep" => Ok(Topic::Sleep),
            "nutrition" | "diet" | "food" => Ok(Topic::Nutrition),
            "exercise" | "activity" => Ok(Topic::Exercise),
            "motivation" => Ok(Topic::Motivation),
            "positive" => Ok(Topic::Positive),
            "general" => Ok(Topic::General),
            other => Err(format!("unknown topic: {}", other)),
        }
    }
}

/// 回复语气
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Warm,
    Encouraging,
    Calm,
    Supportive,
    Celebratory,
    Cautious,
}

impl FromStr for Tone {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warm" | "friendly" => Ok(Tone::Warm),
            "encouraging" | "motivating" => Ok(Tone::Encouraging),
            "calm" | "soothing" => Ok(Tone::Calm),
            "supportive" | "empathetic" => Ok(Tone::Supportive),
            "celebratory" | "upbeat" => Ok(Tone::Celebratory),
            "cautious" | "concerned" => Ok(Tone::Cautious),
            other => Err(format!("unknown tone: {}", other)),
        }
    }
}

/// Analyzer 输出
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalyzerResult {
    pub summary: String,
    /// 能量分数 [0, 100]，已稳定化
    pub energy_score: u8,
    pub signals: Vec<String>,
    pub risk_flags: Vec<String>,
    #[serde(default)]
    pub topics: Vec<Topic>,
}

impl AnalyzerResult {
    /// 追问路由使用的轻量分析：沿用上一轮的分数
    pub fn carried_over(energy_score: u8, topics: Vec<Topic>) -> Self {
        Self {
            summary: format!("Continuing from the previous check-in (energy {}).", energy_score),
            energy_score,
            signals: vec!["carried over from previous turn".to_string()],
            risk_flags: Vec::new(),
            topics,
        }
    }
}

/// Planner 输出
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PlanRecommendation {
    pub summary: String,
    pub diet: Vec<String>,
    pub exercise: Vec<String>,
    pub hydration: Vec<String>,
    pub recovery: Vec<String>,
    pub context: Vec<String>,
}

impl PlanRecommendation {
    /// 按类别遍历所有建议项
    pub fn items(&self) -> impl Iterator<Item = (&'static str, &String)> {
        self.diet
            .iter()
            .map(|i| ("diet", i))
            .chain(self.exercise.iter().map(|i| ("exercise", i)))
            .chain(self.hydration.iter().map(|i| ("hydration", i)))
            .chain(self.recovery.iter().map(|i| ("recovery", i)))
    }

    pub fn is_empty(&self) -> bool {
        self.items().next().is_none()
    }
}

/// 计划与用户约束的冲突
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conflict {
    pub category: String,
    pub item: String,
    /// 触发冲突的用户约束，如 "allergy: peanut"
    pub constraint: String,
}

/// Validator 输出
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationVerdict {
    pub approved: bool,
    pub conflicts: Vec<Conflict>,
    pub substitutions: Vec<String>,
}

impl ValidationVerdict {
    pub fn approved() -> Self {
        Self {
            approved: true,
            conflicts: Vec::new(),
            substitutions: Vec::new(),
        }
    }
}

/// Composer 输出
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComposedReply {
    pub text: String,
    pub tone: Tone,
    pub follow_up: String,
    pub adaptation_note: Option<String>,
    #[serde(default)]
    pub profile_updates: Vec<ProfileDelta>,
}

/// 一轮对话的完整结构化结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnResult {
    pub session_id: String,
    pub decision: DispatchDecision,
    pub analysis: Option<AnalyzerResult>,
    pub plan: Option<PlanRecommendation>,
    pub validation: Option<ValidationVerdict>,
    pub reply: ComposedReply,
    /// 本轮是否有阶段由降级引擎完成
    pub fallback_used: bool,
    pub replanned: bool,
    pub wearable: WearableSnapshot,
}
