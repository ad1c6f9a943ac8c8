//! 模型调用错误

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// 配额、限流或授权耗尽类的错误文本
static QUOTA_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)quota|throttl|rate.?limit|too many requests|limit exceeded|billing|credit balance|unauthori[sz]ed|access.?denied|expired.?token|invalid.?api.?key",
    )
    .expect("valid quota regex")
});

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("API error {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// 流式传输中途断开
    #[error("Transport error: {0}")]
    Transport(String),
}

impl LlmError {
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. })
    }

    /// 瞬时错误：限流、5xx、连接重置/中断、超时
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::ApiError { status, .. } => *status >= 500,
            LlmError::Network(_) => true,
            LlmError::Timeout(_) => true,
            LlmError::Transport(_) => true,
            LlmError::InvalidResponse(_) => false,
            LlmError::Json(_) => false,
        }
    }

    /// 连接层面的失败：断流、网络错误、超时
    pub fn is_transport(&self) -> bool {
        matches!(self, LlmError::Transport(_) | LlmError::Network(_) | LlmError::Timeout(_))
    }

    /// 是否属于配额/限流/授权耗尽，命中时切换到降级引擎
    pub fn is_quota_exhausted(&self) -> bool {
        if let LlmError::ApiError { status, .. } = self
            && matches!(status, 401 | 402 | 403 | 429)
        {
            return true;
        }
        QUOTA_PATTERN.is_match(&self.to_string())
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            LlmError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
