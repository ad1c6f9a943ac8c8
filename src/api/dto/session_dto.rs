//! 会话 DTO

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::agent::Topic;
use crate::models::session::SessionSnapshot;
use crate::models::wearable::WearableSnapshot;

/// 会话状态响应
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionStateResponse {
    pub session_id: String,
    /// 当前历史长度
    pub memory_size: usize,
    pub notes: Vec<String>,
    pub facts: Vec<String>,
    pub last_energy_score: Option<u8>,
    pub last_topics: Vec<Topic>,
    pub wearable: Option<WearableSnapshot>,
    pub last_active_at: Option<DateTime<Utc>>,
}

impl From<SessionSnapshot> for SessionStateResponse {
    fn from(snapshot: SessionSnapshot) -> Self {
        Self {
            session_id: snapshot.session_id,
            memory_size: snapshot.memory_size,
            notes: snapshot.notes,
            facts: snapshot.facts,
            last_energy_score: snapshot.last_energy_score,
            last_topics: snapshot.last_topics,
            wearable: snapshot.wearable,
            last_active_at: snapshot.last_active_at,
        }
    }
}
