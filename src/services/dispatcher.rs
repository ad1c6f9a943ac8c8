//! 意图调度
//!
//! 先走确定性的规则预过滤（不发网络请求），置信度 ≥ 0.8 直接返回；
//! 否则发一次低 token 的分类请求，解析失败或置信度 < 0.7 时回落到 `full`。
//! 危险模式的检查先于一切健康意图模式。

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::config::Budget;
use crate::llm::{CompletionRequest, LlmClient, Message};
use crate::models::route::{DecisionSource, DispatchDecision, DispatchRoute};
use crate::models::session::{Role, Turn};
use crate::services::json_extract::extract_json;

/// 预过滤直接返回的最低置信度
pub const PREFILTER_THRESHOLD: f32 = 0.8;
/// 模型分类结果可被接受的最低置信度
pub const MODEL_THRESHOLD: f32 = 0.7;
/// 分类请求附带的历史轮数
const CLASSIFIER_HISTORY_TURNS: usize = 4;

static SELF_HARM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(kill(ing)? myself|suicid\w*|self[- ]?harm\w*|hurt(ing)? myself|end(ing)? (it all|my life)|cut(ting)? myself|want to die|overdos\w*)\b",
    )
    .expect("valid self-harm regex")
});

static HARMFUL_INGESTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(drink\w*|eat\w*|swallow\w*|inhal\w*|huff\w*|sniff\w*|ingest\w*|consum\w*|snort\w*)\b.{0,40}?\b(bleach|detergent|gasoline|petrol|tide pods?|laundry pods?|glue|ammonia|antifreeze|paint thinner|lighter fluid|rat poison|poison|pesticide|cleaning products?|nail polish remover)\b",
    )
    .expect("valid ingestion regex")
});

static GREETING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(hi|hello|hey|heya|hiya|yo|howdy|greetings|good (morning|afternoon|evening)|what'?s up|sup)([\s,!.]+(there|coach|friend|again))*[\s!.?]*$",
    )
    .expect("valid greeting regex")
});

static ACKNOWLEDGEMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(ok(ay)?|k|thanks?|thank you|thx|ty|cool|great|got it|sounds good|will do|sure|nice|perfect|awesome|alright|noted|yep|yes|no|nope|bye|goodbye|see you)([\s,!.]+(ok(ay)?|thanks?|thank you|so much|a lot|will do|got it|coach|again|bye))*[\s!.]*$",
    )
    .expect("valid acknowledgement regex")
});

static FOLLOW_UP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(what about|how about|what else|tell me more|more about|why (is|does|should|would)|can you explain|what do you mean|instead|another option|what if|and then|same for)\b",
    )
    .expect("valid follow-up regex")
});

static HEALTH_REQUEST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(tired|fatigue\w*|exhausted|energy|sleep\w*|slept|insomnia|stress\w*|anxious|anxiety|pain\w*|ache\w*|hurt\w*|stomach|sore|headache|migraine|diet|eat\w*|food|meal\w*|nutrition|protein|calorie\w*|hydrat\w*|water|workout\w*|exercise\w*|run(ning)?|walk\w*|gym|weight|stretch\w*|recover\w*|motivat\w*|mood|sick|ill|nause\w*|dizzy|health\w*|heart rate|steps|body|muscle\w*|breakfast|lunch|dinner|snack\w*)\b",
    )
    .expect("valid health regex")
});

static OFF_TOPIC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(weather|stocks?|crypto\w*|bitcoin|politic\w*|election|movies?|sports? scores?|homework|poem|essay|write (me )?(some )?code|capital of|translate|joke|lottery|celebrity)\b",
    )
    .expect("valid off-topic regex")
});

/// 是否命中自伤或摄入/吸入有害物质的模式
pub fn is_dangerous(text: &str) -> bool {
    SELF_HARM.is_match(text) || HARMFUL_INGESTION.is_match(text)
}

/// 规则预过滤；`None` 表示没有把握，需要模型分类
pub fn pre_filter(text: &str, has_image: bool, has_history: bool) -> Option<DispatchDecision> {
    let text = text.trim();
    let rule = |route, confidence, reasoning: &str| {
        Some(DispatchDecision::new(route, confidence, reasoning, DecisionSource::PreFilter))
    };

    if text.is_empty() && !has_image {
        return rule(DispatchRoute::Greeting, 1.0, "empty message");
    }
    if is_dangerous(text) {
        return rule(DispatchRoute::Offtopic, 1.0, "dangerous content pattern");
    }
    if !has_image && GREETING.is_match(text) {
        return rule(DispatchRoute::Greeting, 0.95, "greeting pattern");
    }
    if !has_image && ACKNOWLEDGEMENT.is_match(text) {
        return rule(DispatchRoute::Quick, 0.9, "acknowledgement pattern");
    }
    if has_image {
        return rule(DispatchRoute::Photo, 0.9, "image attached");
    }
    if has_history && FOLLOW_UP.is_match(text) {
        return rule(DispatchRoute::Followup, 0.85, "follow-up phrasing with history");
    }
    if HEALTH_REQUEST.is_match(text) {
        return rule(DispatchRoute::Full, 0.85, "explicit health request");
    }
    if OFF_TOPIC.is_match(text) {
        return rule(DispatchRoute::Offtopic, 0.85, "non-health request");
    }
    if text.split_whitespace().count() <= 4 {
        return rule(DispatchRoute::Quick, 0.8, "short non-health message");
    }
    None
}

#[derive(Debug, Deserialize)]
struct ClassifierOutput {
    route: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    reasoning: String,
}

const CLASSIFIER_PROMPT: &str = "You route messages for a wellness coaching assistant. \
Choose exactly one label:\n\
- greeting: hello or small talk with no request\n\
- quick: acknowledgement or a short message needing a brief reply\n\
- followup: continues the previous exchange and needs a plan update but no fresh analysis\n\
- photo: the user shared a photo (usually food) to discuss\n\
- full: a health, energy, sleep, stress, food or exercise check-in needing analysis and a plan\n\
- offtopic: unrelated to health, or unsafe content\n\
Respond with JSON only: {\"route\": \"<label>\", \"confidence\": <0..1>, \"reasoning\": \"<short>\"}";

/// 意图调度器
pub struct Dispatcher {
    client: Arc<dyn LlmClient>,
    budget: Budget,
}

impl Dispatcher {
    pub fn new(client: Arc<dyn LlmClient>, budget: Budget) -> Self {
        Self { client, budget }
    }

    /// 为一轮对话选择路由
    pub async fn classify(&self, text: &str, has_image: bool, history: &[Turn]) -> DispatchDecision {
        if let Some(decision) = pre_filter(text, has_image, !history.is_empty())
            && decision.confidence >= PREFILTER_THRESHOLD
        {
            debug!(route = %decision.route, reasoning = %decision.reasoning, "pre-filter decision");
            return decision;
        }

        let request = CompletionRequest::new(
            CLASSIFIER_PROMPT,
            vec![Message::user(render_classifier_input(text, has_image, history))],
            self.budget,
        );

        let raw = match self.client.complete(request).await {
            Ok(response) => response.content.unwrap_or_default(),
            Err(e) => {
                warn!(stage = "dispatcher", error = %e, "classification call failed, defaulting to full");
                return DispatchDecision::safest_default("classification call failed");
            }
        };

        match extract_json::<ClassifierOutput>(&raw) {
            Ok(output) => match output.route.parse::<DispatchRoute>() {
                Ok(route) if output.confidence >= MODEL_THRESHOLD => {
                    DispatchDecision::new(route, output.confidence, output.reasoning, DecisionSource::Model)
                }
                Ok(route) => {
                    warn!(stage = "dispatcher", %route, confidence = output.confidence, "low classifier confidence, defaulting to full");
                    DispatchDecision::safest_default("low classifier confidence")
                }
                Err(e) => {
                    warn!(stage = "dispatcher", error = %e, "unknown route label, defaulting to full");
                    DispatchDecision::safest_default("unknown route label")
                }
            },
            Err(e) => {
                warn!(stage = "dispatcher", error = %e, "unparsable classifier output, defaulting to full");
                DispatchDecision::safest_default("unparsable classifier output")
            }
        }
    }
}

fn render_classifier_input(text: &str, has_image: bool, history: &[Turn]) -> String {
    let skip = history.len().saturating_sub(CLASSIFIER_HISTORY_TURNS);
    let mut out = String::new();
    if history.len() > skip {
        out.push_str("Recent conversation:\n");
        for turn in &history[skip..] {
            let who = match turn.role {
                Role::User => "User",
                Role::Assistant => "Coach",
            };
            out.push_str(&format!("{}: {}\n", who, turn.content));
        }
        out.push('\n');
    }
    out.push_str("Message: ");
    out.push_str(text.trim());
    if has_image {
        out.push_str("\n[image attached]");
    }
    out
}
