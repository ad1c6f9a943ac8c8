//! 语音对话
//!
//! 出站事件按固定顺序组成一轮脚本，入站事件按角色累积转写文本并按到达顺序拼接音频。

pub mod accumulator;
pub mod duplex;
pub mod pipeline;
pub mod protocol;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use accumulator::{InboundVoiceEvent, VoiceAccumulator};
pub use duplex::{AudioModelService, DuplexSession, HttpDuplexAudioService};
pub use pipeline::{VoicePipeline, VoiceTurnOutput};
pub use protocol::{VoiceEvent, VoiceScript, chunk_pcm};

use crate::config::config::LlmConfig;

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("voice is not configured")]
    Disabled,

    #[error("empty audio input")]
    EmptyInput,

    #[error("audio input too large: {size} bytes (max {max})")]
    InputTooLarge { size: usize, max: usize },

    #[error("audio input is not 16-bit PCM ({0} bytes)")]
    OddLength(usize),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("voice session closed before the turn completed")]
    Closed,

    #[error("voice turn timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid voice event JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid audio payload: {0}")]
    Audio(#[from] base64::DecodeError),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl VoiceError {
    /// 是否由调用方输入引起
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            VoiceError::EmptyInput | VoiceError::InputTooLarge { .. } | VoiceError::OddLength(_)
        )
    }
}

/// 未配置双工流地址时返回 `None`
pub fn create_audio_service(config: &LlmConfig) -> Result<Option<Arc<dyn AudioModelService>>, VoiceError> {
    if config.audio_url.trim().is_empty() {
        return Ok(None);
    }
    let service = HttpDuplexAudioService::from_config(config)?;
    Ok(Some(Arc::new(service)))
}
