//! 降级引擎
//!
//! 模型服务配额耗尽或不可用时，用规则和模板确定性地生成与各阶段等价的输出。
//! 所有方法都是纯函数：相同输入得到逐字节相同的输出，不访问网络。

pub mod templates;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::agent::{AnalyzerResult, ComposedReply, PlanRecommendation, Tone, Topic};
use crate::models::profile::ProfileDelta;
use crate::models::route::DispatchRoute;
use crate::models::wearable::{StressLevel, WearableSnapshot};
use crate::services::scoring::Trend;
use templates::{keywords, template};

const DETECTABLE_TOPICS: [Topic; 9] = [
    Topic::Fatigue,
    Topic::Stress,
    Topic::Pain,
    Topic::Headache,
    Topic::Sleep,
    Topic::Nutrition,
    Topic::Exercise,
    Topic::Motivation,
    Topic::Positive,
];

static TOPIC_PATTERNS: Lazy<Vec<(Topic, Regex)>> = Lazy::new(|| {
    DETECTABLE_TOPICS
        .iter()
        .map(|t| (*t, Regex::new(keywords(*t)).expect("valid topic regex")))
        .collect()
});

static ALLERGY_STATEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:i'?m|i am)\s+allergic\s+to\s+([a-z][a-z -]{0,30}?)\s*(?:[.,!;?]|\band\b|$)")
        .expect("valid allergy regex")
});

static DISLIKE_STATEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bi\s+(?:don'?t|do not|never|can'?t|cannot)\s+eat\s+([a-z][a-z -]{0,30}?)\s*(?:[.,!;?]|\band\b|$)")
        .expect("valid dislike regex")
});

/// 检测话题
///
/// 按优先级排序；同时命中时非 positive 话题压过 positive；都不命中时为 general。
pub fn detect_topics(text: &str) -> Vec<Topic> {
    let mut topics: Vec<Topic> = TOPIC_PATTERNS
        .iter()
        .filter(|(_, re)| re.is_match(text))
        .map(|(t, _)| *t)
        .collect();

    if topics.iter().any(|t| *t != Topic::Positive) {
        topics.retain(|t| *t != Topic::Positive);
    }
    if topics.is_empty() {
        topics.push(Topic::General);
    }
    topics.sort();
    topics
}

/// 仅由可穿戴数据计算能量分数，结果在 [10, 95]
pub fn energy_from_wearable(wearable: &WearableSnapshot) -> u8 {
    let mut score: i32 = 60;

    score += match wearable.steps {
        s if s < 3_000 => -12,
        s if s < 6_000 => -6,
        s if s >= 10_000 => 8,
        _ => 0,
    };

    score += match wearable.sleep_hours {
        h if h < 5.0 => -18,
        h if h < 6.0 => -12,
        h if h < 7.0 => -5,
        h if h >= 8.0 => 5,
        _ => 0,
    };

    score += match wearable.stress {
        StressLevel::High => -12,
        StressLevel::Moderate => -6,
        StressLevel::Low => 4,
    };

    score.clamp(10, 95) as u8
}

/// 从文本中提取档案更新（过敏、忌口）
pub fn extract_profile_updates(text: &str) -> Vec<ProfileDelta> {
    let mut updates = Vec::new();
    for caps in ALLERGY_STATEMENT.captures_iter(text) {
        if let Some(m) = caps.get(1) {
            updates.push(ProfileDelta::new("allergy", m.as_str().trim().to_lowercase()));
        }
    }
    for caps in DISLIKE_STATEMENT.captures_iter(text) {
        if let Some(m) = caps.get(1) {
            updates.push(ProfileDelta::new("dislike", m.as_str().trim().to_lowercase()));
        }
    }
    updates.dedup();
    updates
}

/// 危险内容的固定安全回复
pub fn safety_reply() -> &'static str {
    "I'm really glad you told me, and your safety matters more than anything we could plan here. \
If you might hurt yourself, or you've swallowed or breathed in something harmful, please contact \
emergency services right now (911 in the US) or Poison Control at 1-800-222-1222. \
You can also call or text 988 to reach the Suicide & Crisis Lifeline any time. \
I'm here to talk about how you're feeling once you're safe."
}

fn greeting_name(name: Option<&str>) -> String {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => format!(" {}", name),
        None => String::new(),
    }
}

fn first_or<'a>(items: &'a [String], default: &'a str) -> &'a str {
    items.first().map(String::as_str).unwrap_or(default)
}

fn push_unique(list: &mut Vec<String>, items: &[&str]) {
    for item in items {
        if !list.iter().any(|existing| existing == item) {
            list.push(item.to_string());
        }
    }
}

/// 规则降级引擎
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackEngine;

impl FallbackEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, text: &str, wearable: &WearableSnapshot) -> AnalyzerResult {
        let topics = detect_topics(text);
        let primary = topics[0];
        let energy_score = energy_from_wearable(wearable);

        let mut signals = vec![
            format!("steps: {}", wearable.steps),
            format!("sleep: {:.1}h", wearable.sleep_hours),
            format!("stress: {}", wearable.stress),
        ];
        signals.extend(topics.iter().filter(|t| **t != Topic::General).map(|t| format!("topic: {}", t)));

        let mut risk_flags = Vec::new();
        if wearable.sleep_hours < 5.0 {
            risk_flags.push("short sleep".to_string());
        }
        if wearable.stress == StressLevel::High {
            risk_flags.push("high stress".to_string());
        }
        if wearable.steps < 3_000 {
            risk_flags.push("low activity".to_string());
        }
        if Trend::detect(text).emergency {
            risk_flags.push("possible emergency".to_string());
        }

        AnalyzerResult {
            summary: format!("{} Estimated energy {}/100 from activity, sleep and stress.", template(primary).summary, energy_score),
            energy_score,
            signals,
            risk_flags,
            topics,
        }
    }

    pub fn plan(&self, text: &str, analyzer: &AnalyzerResult) -> PlanRecommendation {
        let topics = if analyzer.topics.is_empty() {
            detect_topics(text)
        } else {
            analyzer.topics.clone()
        };

        let mut plan = PlanRecommendation {
            summary: format!("Simple steps focused on {}.", topics[0]),
            ..Default::default()
        };

        for topic in &topics {
            let tpl = template(*topic);
            push_unique(&mut plan.diet, tpl.diet);
            push_unique(&mut plan.exercise, tpl.exercise);
            push_unique(&mut plan.hydration, tpl.hydration);
            push_unique(&mut plan.recovery, tpl.recovery);
            push_unique(&mut plan.context, tpl.nutrition);
        }

        if analyzer.energy_score < 40 {
            push_unique(&mut plan.recovery, &["Keep the rest of today low-key and go to bed a little earlier"]);
        }

        plan
    }

    pub fn compose(
        &self,
        text: &str,
        analyzer: &AnalyzerResult,
        plan: &PlanRecommendation,
        name: Option<&str>,
    ) -> ComposedReply {
        let primary = analyzer.topics.first().copied().unwrap_or(Topic::General);
        let tpl = template(primary);

        let mut reply = String::new();
        if !greeting_name(name).is_empty() {
            reply.push_str(&format!("Hi{}. ", greeting_name(name)));
        }
        reply.push_str(tpl.reply);
        reply.push_str(&format!(" Your energy looks to be around {}/100 right now.", analyzer.energy_score));
        reply.push_str(" Here's a simple plan: ");
        reply.push_str(first_or(&plan.diet, tpl.diet[0]));
        reply.push_str(". ");
        reply.push_str(first_or(&plan.exercise, tpl.exercise[0]));
        reply.push_str(". ");
        reply.push_str(first_or(&plan.hydration, tpl.hydration[0]));
        reply.push_str(". ");
        reply.push_str(first_or(&plan.recovery, tpl.recovery[0]));
        reply.push_str(". ");
        reply.push_str(tpl.follow_up);

        ComposedReply {
            text: reply,
            tone: tpl.tone,
            follow_up: tpl.follow_up.to_string(),
            adaptation_note: Some(format!("Raised {}; keep suggestions short and practical.", primary)),
            profile_updates: extract_profile_updates(text),
        }
    }

    /// 问候、确认、离题与危险内容的轻量回复
    pub fn compose_lightweight(&self, route: DispatchRoute, text: &str, name: Option<&str>) -> ComposedReply {
        let who = greeting_name(name);
        let (reply, tone, follow_up) = match route {
            DispatchRoute::Greeting => (
                format!("Hi{}! Good to see you. How's your energy today?", who),
                Tone::Warm,
                "How's your energy today?".to_string(),
            ),
            DispatchRoute::Quick => (
                format!("You're welcome{}! I'm here whenever you want to check in again.", who),
                Tone::Warm,
                "Anything else on your mind?".to_string(),
            ),
            DispatchRoute::Offtopic if crate::services::dispatcher::is_dangerous(text) => (
                safety_reply().to_string(),
                Tone::Cautious,
                "Are you safe right now?".to_string(),
            ),
            DispatchRoute::Offtopic => (
                format!(
                    "I'm your wellness coach{}, so I'll stay focused on energy, sleep, food and movement. \
Is there anything on that front I can help with?",
                    if who.is_empty() { String::new() } else { format!(",{}", who) }
                ),
                Tone::Warm,
                "How are you feeling today?".to_string(),
            ),
            _ => {
                let tpl = template(Topic::General);
                (format!("{} {}", tpl.reply, tpl.follow_up), tpl.tone, tpl.follow_up.to_string())
            }
        };

        ComposedReply {
            text: reply,
            tone,
            follow_up,
            adaptation_note: None,
            profile_updates: extract_profile_updates(text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::wearable::WearableSource;
    use rstest::rstest;

    fn wearable(steps: u32, sleep_hours: f32, stress: StressLevel) -> WearableSnapshot {
        WearableSnapshot {
            steps,
            sleep_hours,
            stress,
            resting_heart_rate: 62,
            active_minutes: 20,
            source: WearableSource::Device,
        }
    }

    #[test]
    fn test_tired_after_work_scenario() {
        let engine = FallbackEngine::new();
        let result = engine.analyze("I'm tired after work", &wearable(4200, 5.4, StressLevel::Moderate));
        assert!(result.topics.contains(&Topic::Fatigue));
        assert!((20..=50).contains(&result.energy_score), "{}", result.energy_score);
        assert_eq!(result.energy_score, 36);
    }

    #[rstest]
    #[case("I feel great but so tired", vec![Topic::Fatigue])]
    #[case("feeling great today", vec![Topic::Positive])]
    #[case("my head hurts, I have a headache", vec![Topic::Pain, Topic::Headache])]
    #[case("what's up", vec![Topic::General])]
    #[case("stressed and can't sleep", vec![Topic::Stress, Topic::Sleep])]
    fn test_detect_topics(#[case] text: &str, #[case] expected: Vec<Topic>) {
        assert_eq!(detect_topics(text), expected);
    }

    #[rstest]
    #[case(wearable(1000, 3.0, StressLevel::High), 18)]
    #[case(wearable(20000, 9.0, StressLevel::Low), 77)]
    #[case(wearable(8000, 7.5, StressLevel::Moderate), 54)]
    fn test_energy_from_wearable(#[case] w: WearableSnapshot, #[case] expected: u8) {
        assert_eq!(energy_from_wearable(&w), expected);
    }

    #[test]
    fn test_energy_is_clamped() {
        let mut w = wearable(0, 0.0, StressLevel::High);
        assert!(energy_from_wearable(&w) >= 10);
        w = wearable(50_000, 12.0, StressLevel::Low);
        assert!(energy_from_wearable(&w) <= 95);
    }

    #[test]
    fn test_engine_is_pure() {
        let engine = FallbackEngine::new();
        let w = wearable(4200, 5.4, StressLevel::Moderate);
        let text = "I'm tired after work and I'm allergic to peanuts.";

        let a1 = engine.analyze(text, &w);
        let a2 = engine.analyze(text, &w);
        assert_eq!(a1, a2);

        let p1 = engine.plan(text, &a1);
        let p2 = engine.plan(text, &a2);
        assert_eq!(p1, p2);

        let c1 = engine.compose(text, &a1, &p1, Some("Ana"));
        let c2 = engine.compose(text, &a2, &p2, Some("Ana"));
        assert_eq!(serde_json::to_string(&c1).unwrap(), serde_json::to_string(&c2).unwrap());
        assert!(c1.text.starts_with("Hi Ana."));
        assert_eq!(c1.profile_updates, vec![ProfileDelta::new("allergy", "peanuts")]);
    }

    #[test]
    fn test_low_energy_plan_adds_rest() {
        let engine = FallbackEngine::new();
        let analysis = engine.analyze("so tired", &wearable(1000, 4.0, StressLevel::High));
        let plan = engine.plan("so tired", &analysis);
        assert!(plan.recovery.iter().any(|r| r.contains("go to bed a little earlier")));
        assert!(!plan.context.is_empty());
    }

    #[test]
    fn test_extract_profile_updates() {
        let updates = extract_profile_updates("I'm allergic to shellfish and I don't eat red meat.");
        assert_eq!(
            updates,
            vec![ProfileDelta::new("allergy", "shellfish"), ProfileDelta::new("dislike", "red meat")]
        );
        assert!(extract_profile_updates("I'm tired").is_empty());
    }

    #[test]
    fn test_lightweight_replies() {
        let engine = FallbackEngine::new();
        let greet = engine.compose_lightweight(DispatchRoute::Greeting, "hi", Some("Sam"));
        assert!(greet.text.starts_with("Hi Sam!"));

        let danger = engine.compose_lightweight(DispatchRoute::Offtopic, "should I drink bleach", None);
        assert_eq!(danger.tone, Tone::Cautious);
        assert!(danger.text.contains("988"));

        let off = engine.compose_lightweight(DispatchRoute::Offtopic, "what's the weather", None);
        assert!(off.text.contains("wellness coach"));
    }
}
