//! 可穿戴设备数据快照
//!
//! 优先级：文本中的明确陈述 > 调用方传入的设备数据 > 按会话键合成的模拟数据。

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 压力水平
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StressLevel {
    Low,
    Moderate,
    High,
}

impl StressLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StressLevel::Low => "low",
            StressLevel::Moderate => "moderate",
            StressLevel::High => "high",
        }
    }
}

impl fmt::Display for StressLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 快照中优先级最高的数据来源
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum WearableSource {
    /// 模拟关闭且无设备数据时的中性值
    Baseline,
    /// 按会话键合成
    Mock,
    /// 调用方传入
    Device,
    /// 用户在文本中陈述
    Stated,
}

/// 可穿戴数据快照
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WearableSnapshot {
    pub steps: u32,
    pub sleep_hours: f32,
    pub stress: StressLevel,
    pub resting_heart_rate: u16,
    pub active_minutes: u32,
    pub source: WearableSource,
}

/// 调用方传入的设备数据，每个字段都可缺省
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct WearableInput {
    pub steps: Option<u32>,
    pub sleep_hours: Option<f32>,
    pub stress: Option<StressLevel>,
    pub resting_heart_rate: Option<u16>,
    pub active_minutes: Option<u32>,
}

impl WearableInput {
    pub fn is_empty(&self) -> bool {
        self.steps.is_none()
            && self.sleep_hours.is_none()
            && self.stress.is_none()
            && self.resting_heart_rate.is_none()
            && self.active_minutes.is_none()
    }
}

/// FNV-1a 64 位哈希，跨平台跨版本稳定
fn fnv1a(key: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    key.bytes().fold(OFFSET, |hash, b| (hash ^ u64::from(b)).wrapping_mul(PRIME))
}

fn round1(v: f32) -> f32 {
    (v * 10.0).round() / 10.0
}

impl WearableSnapshot {
    /// 按会话键确定性地合成模拟数据
    pub fn synthesize(session_key: &str) -> Self {
        let h = fnv1a(session_key);
        let stress = match (h >> 32) % 3 {
            0 => StressLevel::Low,
            1 => StressLevel::Moderate,
            _ => StressLevel::High,
        };
        Self {
            steps: 2_000 + (h % 9_000) as u32,
            sleep_hours: round1(4.5 + ((h >> 16) % 45) as f32 / 10.0),
            stress,
            resting_heart_rate: 55 + ((h >> 40) % 25) as u16,
            active_minutes: ((h >> 48) % 90) as u32,
            source: WearableSource::Mock,
        }
    }

    /// 中性基线
    pub fn baseline() -> Self {
        Self {
            steps: 5_000,
            sleep_hours: 7.0,
            stress: StressLevel::Moderate,
            resting_heart_rate: 65,
            active_minutes: 20,
            source: WearableSource::Baseline,
        }
    }

    /// 合成本轮使用的快照
    pub fn resolve(
        session_key: &str,
        input: Option<&WearableInput>,
        text: &str,
        mock_enabled: bool,
        last_known: Option<&WearableSnapshot>,
    ) -> Self {
        let mut snapshot = match (mock_enabled, last_known) {
            (true, _) => Self::synthesize(session_key),
            (false, Some(last)) => last.clone(),
            (false, None) => Self::baseline(),
        };

        if let Some(input) = input.filter(|i| !i.is_empty()) {
            if let Some(steps) = input.steps {
                snapshot.steps = steps;
            }
            if let Some(sleep) = input.sleep_hours {
                snapshot.sleep_hours = round1(sleep.clamp(0.0, 24.0));
            }
            if let Some(stress) = input.stress {
                snapshot.stress = stress;
            }
            if let Some(hr) = input.resting_heart_rate {
                snapshot.resting_heart_rate = hr;
            }
            if let Some(minutes) = input.active_minutes {
                snapshot.active_minutes = minutes;
            }
            snapshot.source = WearableSource::Device;
        }

        let stated = StatedValues::parse(text);
        if !stated.is_empty() {
            if let Some(sleep) = stated.sleep_hours {
                snapshot.sleep_hours = sleep;
            }
            if let Some(steps) = stated.steps {
                snapshot.steps = steps;
            }
            if let Some(stress) = stated.stress {
                snapshot.stress = stress;
            }
            snapshot.source = WearableSource::Stated;
        }

        snapshot
    }
}

static STATED_SLEEP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:slept|sleep|got)\D{0,12}?(\d{1,2}(?:\.\d+)?)\s*(?:h|hrs?|hours?)\b|(\d{1,2}(?:\.\d+)?)\s*(?:h|hrs?|hours?)\s+(?:of\s+)?sleep",
    )
    .expect("valid sleep regex")
});

static STATED_STEPS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d{1,3}(?:,\d{3})+|\d{3,6})\s*steps\b").expect("valid steps regex")
});

static STATED_HIGH_STRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:very|really|so|super|extremely)\s+stress(?:ed|ful)?\b|\bstressed\s+out\b|\boverwhelmed\b")
        .expect("valid stress regex")
});

static STATED_LOW_STRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:not\s+stressed|relaxed|feeling\s+calm|chilled?\s+out)\b").expect("valid calm regex")
});

/// 文本中明确陈述的数值
#[derive(Debug, Default, PartialEq)]
pub struct StatedValues {
    pub sleep_hours: Option<f32>,
    pub steps: Option<u32>,
    pub stress: Option<StressLevel>,
}

impl StatedValues {
    pub fn parse(text: &str) -> Self {
        let sleep_hours = STATED_SLEEP.captures(text).and_then(|c| {
            c.get(1)
                .or_else(|| c.get(2))
                .and_then(|m| m.as_str().parse::<f32>().ok())
                .filter(|h| (0.0..=16.0).contains(h))
                .map(round1)
        });

        let steps = STATED_STEPS
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().replace(',', "").parse::<u32>().ok());

        let stress = if STATED_LOW_STRESS.is_match(text) {
            Some(StressLevel::Low)
        } else if STATED_HIGH_STRESS.is_match(text) {
            Some(StressLevel::High)
        } else {
            None
        };

        Self {
            sleep_hours,
            steps,
            stress,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sleep_hours.is_none() && self.steps.is_none() && self.stress.is_none()
    }
}
