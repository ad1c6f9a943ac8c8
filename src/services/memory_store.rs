//! 会话记忆存储
//!
//! 按会话 ID 隔离的有界内存状态：对话历史（FIFO 环）、适应性提示、用户事实、
//! 上一轮能量分数与话题、最近的可穿戴快照。首次写入时创建，超过 TTL 未活动的会话
//! 在下一次清扫时整体移除。

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use tracing::debug;

use crate::config::config::MemoryConfig;
use crate::models::agent::Topic;
use crate::models::session::{SessionSnapshot, Turn};
use crate::models::wearable::WearableSnapshot;

#[derive(Debug, Clone)]
struct SessionState {
    history: VecDeque<Turn>,
    notes: VecDeque<String>,
    facts: VecDeque<String>,
    last_energy_score: Option<u8>,
    last_topics: Vec<Topic>,
    wearable: Option<WearableSnapshot>,
    last_active_at: DateTime<Utc>,
}

impl SessionState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            history: VecDeque::new(),
            notes: VecDeque::new(),
            facts: VecDeque::new(),
            last_energy_score: None,
            last_topics: Vec::new(),
            wearable: None,
            last_active_at: now,
        }
    }
}

/// 有界 FIFO 追加
fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, cap: usize) {
    queue.push_back(item);
    while queue.len() > cap {
        queue.pop_front();
    }
}

/// 会话记忆存储
pub struct SessionMemoryStore {
    sessions: DashMap<String, SessionState>,
    config: MemoryConfig,
}

impl SessionMemoryStore {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// 写操作入口：不存在则创建，并刷新活动时间
    fn with_session<R>(&self, session_id: &str, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let now = Utc::now();
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionState::new(now));
        entry.last_active_at = now;
        f(entry.value_mut())
    }

    /// 追加轮次；超过上限时静默丢弃最旧的轮次
    pub fn append(&self, session_id: &str, turn: Turn) {
        let cap = self.config.history_cap.max(1);
        self.with_session(session_id, |s| push_bounded(&mut s.history, turn, cap));
    }

    /// 按时间顺序返回有界历史
    pub fn recent_history(&self, session_id: &str) -> Vec<Turn> {
        self.sessions
            .get(session_id)
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 最近 `n` 轮
    pub fn last_turns(&self, session_id: &str, n: usize) -> Vec<Turn> {
        self.sessions
            .get(session_id)
            .map(|s| {
                let skip = s.history.len().saturating_sub(n);
                s.history.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn add_adaptation_note(&self, session_id: &str, note: impl Into<String>) {
        let note = note.into();
        let note = note.trim();
        if note.is_empty() {
            return;
        }
        let cap = self.config.note_cap.max(1);
        let note = note.to_string();
        self.with_session(session_id, |s| {
            s.notes.retain(|n| n != &note);
            push_bounded(&mut s.notes, note, cap);
        });
    }

    /// 添加用户事实（忽略大小写去重）
    pub fn add_user_fact(&self, session_id: &str, fact: impl Into<String>) {
        let fact = fact.into();
        let fact = fact.trim();
        if fact.is_empty() {
            return;
        }
        let cap = self.config.fact_cap.max(1);
        let fact = fact.to_string();
        self.with_session(session_id, |s| {
            if !s.facts.iter().any(|f| f.eq_ignore_ascii_case(&fact)) {
                push_bounded(&mut s.facts, fact, cap);
            }
        });
    }

    pub fn facts(&self, session_id: &str) -> Vec<String> {
        self.sessions
            .get(session_id)
            .map(|s| s.facts.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn notes(&self, session_id: &str) -> Vec<String> {
        self.sessions
            .get(session_id)
            .map(|s| s.notes.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// 当前历史长度（淘汰后的数量）
    pub fn size(&self, session_id: &str) -> usize {
        self.sessions.get(session_id).map(|s| s.history.len()).unwrap_or(0)
    }

    /// 记录本轮稳定化后的分数与话题
    pub fn record_analysis(&self, session_id: &str, energy_score: u8, topics: Vec<Topic>) {
        self.with_session(session_id, |s| {
            s.last_energy_score = Some(energy_score);
            s.last_topics = topics;
        });
    }

    pub fn last_energy_score(&self, session_id: &str) -> Option<u8> {
        self.sessions.get(session_id).and_then(|s| s.last_energy_score)
    }

    pub fn last_topics(&self, session_id: &str) -> Vec<Topic> {
        self.sessions
            .get(session_id)
            .map(|s| s.last_topics.clone())
            .unwrap_or_default()
    }

    pub fn set_wearable(&self, session_id: &str, snapshot: WearableSnapshot) {
        self.with_session(session_id, |s| s.wearable = Some(snapshot));
    }

    pub fn wearable(&self, session_id: &str) -> Option<WearableSnapshot> {
        self.sessions.get(session_id).and_then(|s| s.wearable.clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// 只读快照，不会创建会话
    pub fn snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.sessions.get(session_id).map(|s| SessionSnapshot {
            session_id: session_id.to_string(),
            memory_size: s.history.len(),
            notes: s.notes.iter().cloned().collect(),
            facts: s.facts.iter().cloned().collect(),
            last_energy_score: s.last_energy_score,
            last_topics: s.last_topics.clone(),
            wearable: s.wearable.clone(),
            last_active_at: Some(s.last_active_at),
        })
    }

    /// 移除超过 TTL 未活动的会话，返回移除数量
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Utc::now())
    }

    pub fn evict_expired_at(&self, now: DateTime<Utc>) -> usize {
        let ttl = Duration::seconds(self.config.session_ttl_secs as i64);
        let before = self.sessions.len();
        self.sessions.retain(|_, s| now - s.last_active_at < ttl);
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            debug!(removed, remaining = self.sessions.len(), "evicted expired sessions");
        }
        removed
    }
}
