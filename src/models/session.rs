use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::agent::Topic;
use crate::models::wearable::WearableSnapshot;

/// 轮次角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// 用户消息
    User,
    /// 助手回复
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// 对话轮次
///
/// 追加到会话历史后不可变。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    /// 创建新轮次
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// 随消息上传的图片（base64）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageAttachment {
    pub media_type: String,
    pub data: String,
}

/// 会话状态快照（只读接口返回）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
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

impl SessionSnapshot {
    /// 不存在的会话
    pub fn empty(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            memory_size: 0,
            notes: Vec::new(),
            facts: Vec::new(),
            last_energy_score: None,
            last_topics: Vec::new(),
            wearable: None,
            last_active_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_constructors() {
        let turn = Turn::user("hello");
        assert_eq!(turn.role, Role::User);
        assert_eq!(turn.content, "hello");
        assert_eq!(Turn::assistant("hi").role.as_str(), "assistant");
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }
}
