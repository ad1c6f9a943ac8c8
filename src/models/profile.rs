use serde::{Deserialize, Serialize};

/// 调用方提供的用户上下文
///
/// 过敏与忌口是 Validator 的约束来源；档案本身由外部系统持久化。
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct UserContext {
    /// 称呼
    pub name: Option<String>,
    /// 过敏原
    pub allergies: Vec<String>,
    /// 忌口
    pub dislikes: Vec<String>,
    /// 目标
    pub goals: Vec<String>,
}

impl UserContext {
    /// 是否存在需要校验的约束
    pub fn has_constraints(&self) -> bool {
        self.allergies.iter().any(|a| !a.trim().is_empty())
            || self.dislikes.iter().any(|d| !d.trim().is_empty())
    }

    /// 渲染成提示词片段
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(name) = self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            parts.push(format!("name: {}", name.trim()));
        }
        if !self.allergies.is_empty() {
            parts.push(format!("allergies: {}", self.allergies.join(", ")));
        }
        if !self.dislikes.is_empty() {
            parts.push(format!("dislikes: {}", self.dislikes.join(", ")));
        }
        if !self.goals.is_empty() {
            parts.push(format!("goals: {}", self.goals.join(", ")));
        }
        parts.join("; ")
    }
}

/// 档案更新增量
///
/// 由 Composer 产生，返回给调用方合并进外部持久化档案。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileDelta {
    pub key: String,
    pub value: String,
}

impl ProfileDelta {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// 作为会话内用户事实保存的形式
    pub fn as_fact(&self) -> String {
        format!("{}: {}", self.key, self.value)
    }
}
