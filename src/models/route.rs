use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 调度路由
///
/// 决定一轮对话需要走多少条流水线。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DispatchRoute {
    /// 问候
    Greeting,
    /// 简短确认
    Quick,
    /// 追问
    Followup,
    /// 带图片
    Photo,
    /// 完整分析
    Full,
    /// 危险或与健康无关
    Offtopic,
}

impl DispatchRoute {
    pub const ALL: [DispatchRoute; 6] = [
        DispatchRoute::Greeting,
        DispatchRoute::Quick,
        DispatchRoute::Followup,
        DispatchRoute::Photo,
        DispatchRoute::Full,
        DispatchRoute::Offtopic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchRoute::Greeting => "greeting",
            DispatchRoute::Quick => "quick",
            DispatchRoute::Followup => "followup",
            DispatchRoute::Photo => "photo",
            DispatchRoute::Full => "full",
            DispatchRoute::Offtopic => "offtopic",
        }
    }

    /// 是否直接进入 Composer（跳过分析与规划）
    pub fn skips_pipeline(&self) -> bool {
        matches!(
            self,
            DispatchRoute::Greeting | DispatchRoute::Quick | DispatchRoute::Offtopic
        )
    }

    /// 是否需要运行 Analyzer
    pub fn runs_analyzer(&self) -> bool {
        matches!(self, DispatchRoute::Full | DispatchRoute::Photo)
    }
}

impl fmt::Display for DispatchRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchRoute {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "greeting" => Ok(DispatchRoute::Greeting),
            "quick" => Ok(DispatchRoute::Quick),
            "followup" | "follow_up" | "follow-up" => Ok(DispatchRoute::Followup),
            "photo" => Ok(DispatchRoute::Photo),
            "full" => Ok(DispatchRoute::Full),
            "offtopic" | "off_topic" | "off-topic" => Ok(DispatchRoute::Offtopic),
            other => Err(format!("unknown route label: {}", other)),
        }
    }
}

/// 调度结果来源
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// 规则预过滤
    PreFilter,
    /// 模型分类
    Model,
    /// 分类失败后的默认路由
    Default,
}

/// 调度决策
///
/// 每轮重新生成，只用于日志，不持久化。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchDecision {
    pub route: DispatchRoute,
    /// 置信度 [0, 1]
    pub confidence: f32,
    pub reasoning: String,
    pub source: DecisionSource,
}

impl DispatchDecision {
    pub fn new(
        route: DispatchRoute,
        confidence: f32,
        reasoning: impl Into<String>,
        source: DecisionSource,
    ) -> Self {
        Self {
            route,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.into(),
            source,
        }
    }

    /// 分类失败时的兜底：最宽的 `full` 路由
    pub fn safest_default(reasoning: impl Into<String>) -> Self {
        Self::new(DispatchRoute::Full, 0.5, reasoning, DecisionSource::Default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_parse_roundtrip_labels() {
        for route in DispatchRoute::ALL {
            assert_eq!(route.as_str().parse::<DispatchRoute>().unwrap(), route);
        }
        assert_eq!("Off-Topic".parse::<DispatchRoute>().unwrap(), DispatchRoute::Offtopic);
        assert!("weather".parse::<DispatchRoute>().is_err());
    }

    #[test]
    fn test_confidence_is_clamped() {
        let d = DispatchDecision::new(DispatchRoute::Quick, 1.7, "x", DecisionSource::Model);
        assert_eq!(d.confidence, 1.0);
    }

    #[test]
    fn test_lightweight_routes() {
        assert!(DispatchRoute::Greeting.skips_pipeline());
        assert!(DispatchRoute::Offtopic.skips_pipeline());
        assert!(!DispatchRoute::Followup.skips_pipeline());
        assert!(!DispatchRoute::Followup.runs_analyzer());
        assert!(DispatchRoute::Photo.runs_analyzer());
    }
}
