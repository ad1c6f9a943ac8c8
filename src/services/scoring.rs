//! 能量分数稳定化
//!
//! 相对上一轮分数限制升降幅度；文本明确表达好转/恶化时放宽对应方向的幅度；
//! 绝对下限不低于安全值，只有命中紧急模式时才降到紧急下限。

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::config::ScoringConfig;

static EMERGENCY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(chest pains?|can'?t breathe|cannot breathe|trouble breathing|passed out|fainted|fainting|collapsed|emergency|ambulance|911|severe bleeding|heart attack|stroke|seizure)\b",
    )
    .expect("valid emergency regex")
});

static WORSENING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(worse|worst|exhausted|drained|wiped out|terrible|awful|burn(?:ed|t)? out|can'?t get out of bed|no energy|getting sicker)\b",
    )
    .expect("valid worsening regex")
});

static IMPROVING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(better|much better|great|amazing|energi[sz]ed|recovered|well rested|refreshed|fantastic|feeling good)\b",
    )
    .expect("valid improving regex")
});

/// 文本中的趋势信号
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trend {
    pub emergency: bool,
    pub worsening: bool,
    pub improving: bool,
}

impl Trend {
    pub fn detect(text: &str) -> Self {
        Self {
            emergency: EMERGENCY.is_match(text),
            worsening: WORSENING.is_match(text),
            improving: IMPROVING.is_match(text),
        }
    }

    /// 是否允许超出常规升降幅度
    pub fn is_explicit(&self) -> bool {
        self.emergency || self.worsening || self.improving
    }
}

/// 稳定化原始分数
pub fn stabilize(raw: u8, prior: Option<u8>, text: &str, config: &ScoringConfig) -> u8 {
    let raw = raw.min(100);
    let trend = Trend::detect(text);

    if trend.emergency {
        return raw.max(config.emergency_floor).min(100);
    }

    let bounded = match prior {
        Some(prior) => {
            let rise = if trend.improving { config.widened_rise } else { config.max_rise };
            let drop = if trend.worsening { config.widened_drop } else { config.max_drop };
            let low = prior.saturating_sub(drop);
            let high = prior.saturating_add(rise).min(100);
            raw.clamp(low, high.max(low))
        }
        None => raw,
    };

    bounded.max(config.floor).min(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config() -> ScoringConfig {
        ScoringConfig::default()
    }

    #[rstest]
    #[case(90, Some(40), "just checking in", 55)]
    #[case(5, Some(60), "same as usual", 40)]
    #[case(90, Some(40), "I feel so much better today", 80)]
    #[case(10, Some(60), "I'm exhausted", 20)]
    #[case(10, None, "meh", 20)]
    #[case(3, Some(60), "I think I fainted at work", 5)]
    #[case(200, None, "hi", 100)]
    fn test_stabilize(#[case] raw: u8, #[case] prior: Option<u8>, #[case] text: &str, #[case] expected: u8) {
        assert_eq!(stabilize(raw, prior, text, &config()), expected);
    }

    #[test]
    fn test_consecutive_turns_stay_within_bounds() {
        let cfg = config();
        let mut prior = None;
        for raw in [80u8, 10, 95, 30, 70, 0, 100] {
            let score = stabilize(raw, prior, "ok", &cfg);
            if let Some(p) = prior {
                let diff = score as i16 - p as i16;
                assert!(diff <= cfg.max_rise as i16 && -diff <= cfg.max_drop as i16, "{} -> {}", p, score);
            }
            prior = Some(score);
        }
    }

    #[test]
    fn test_emergency_recovery_respects_rise_bound() {
        let cfg = config();
        let low = stabilize(2, Some(50), "chest pain right now", &cfg);
        assert_eq!(low, cfg.emergency_floor);
        let next = stabilize(60, Some(low), "ok", &cfg);
        assert_eq!(next, cfg.floor);
    }

    #[test]
    fn test_trend_detection() {
        assert!(Trend::detect("feeling worse").worsening);
        assert!(Trend::detect("I'm energized").improving);
        assert!(!Trend::detect("ok thanks").is_explicit());
    }
}
