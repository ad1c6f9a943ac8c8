//! 入站语音事件累积
//!
//! `textOutput` 按角色分别累积（USER 为转写，ASSISTANT 为回复），
//! `audioOutput` 按到达顺序拼接。推测阶段（SPECULATIVE）的助手文本不计入回复。

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::VoiceError;
use super::protocol::{ContentKind, Envelope, VoiceRole};

/// 打断标记，不属于回复文本
const INTERRUPTED_MARKER: &str = "\"interrupted\"";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ContentStartOut {
    pub content_id: Option<String>,
    pub role: Option<VoiceRole>,
    #[serde(rename = "type")]
    pub kind: Option<ContentKind>,
    /// JSON 字符串，例如 `{"generationStage":"SPECULATIVE"}`
    pub additional_model_fields: Option<String>,
}

impl ContentStartOut {
    fn is_speculative(&self) -> bool {
        self.additional_model_fields
            .as_deref()
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .and_then(|v| v.get("generationStage").and_then(|s| s.as_str()).map(|s| s == "SPECULATIVE"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TextOutput {
    #[serde(default)]
    pub content_id: Option<String>,
    pub role: VoiceRole,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioOutput {
    #[serde(default)]
    pub content_id: Option<String>,
    /// base64 编码的 PCM
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct StopInfo {
    pub content_id: Option<String>,
    pub stop_reason: Option<String>,
}

/// 入站事件
#[derive(Debug, Clone, PartialEq)]
pub enum InboundVoiceEvent {
    ContentStart(ContentStartOut),
    TextOutput(TextOutput),
    AudioOutput(AudioOutput),
    ContentEnd(StopInfo),
    CompletionEnd(StopInfo),
    /// 其他事件（completionStart、usageEvent 等），只记录名称
    Other(String),
}

impl InboundVoiceEvent {
    /// 解析一行 `{"event":{"<name>":{…}}}`
    pub fn parse(line: &str) -> Result<Self, VoiceError> {
        let envelope: Envelope<Map<String, Value>> = serde_json::from_str(line)?;
        let Some((name, body)) = envelope.event.into_iter().next() else {
            return Err(VoiceError::Protocol("empty event object".into()));
        };

        let event = match name.as_str() {
            "contentStart" => InboundVoiceEvent::ContentStart(serde_json::from_value(body)?),
            "textOutput" => InboundVoiceEvent::TextOutput(serde_json::from_value(body)?),
            "audioOutput" => InboundVoiceEvent::AudioOutput(serde_json::from_value(body)?),
            "contentEnd" => InboundVoiceEvent::ContentEnd(serde_json::from_value(body)?),
            "completionEnd" => InboundVoiceEvent::CompletionEnd(serde_json::from_value(body)?),
            _ => InboundVoiceEvent::Other(name),
        };
        Ok(event)
    }
}

#[derive(Debug, Default)]
pub struct VoiceAccumulator {
    user: Vec<String>,
    assistant: Vec<String>,
    audio: Vec<u8>,
    speculative: bool,
    complete: bool,
}

impl VoiceAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: InboundVoiceEvent) -> Result<(), VoiceError> {
        match event {
            InboundVoiceEvent::ContentStart(start) => {
                self.speculative = start.role == Some(VoiceRole::Assistant) && start.is_speculative();
            }
            InboundVoiceEvent::TextOutput(text) => {
                let content = text.content.trim();
                if content.is_empty() || content.contains(INTERRUPTED_MARKER) {
                    return Ok(());
                }
                match text.role {
                    VoiceRole::User => self.user.push(content.to_string()),
                    VoiceRole::Assistant if !self.speculative => self.assistant.push(content.to_string()),
                    VoiceRole::Assistant => {}
                    VoiceRole::System => debug!("ignoring system text output"),
                }
            }
            InboundVoiceEvent::AudioOutput(audio) => {
                let bytes = STANDARD.decode(audio.content.trim())?;
                self.audio.extend_from_slice(&bytes);
            }
            InboundVoiceEvent::ContentEnd(_) => self.speculative = false,
            InboundVoiceEvent::CompletionEnd(_) => self.complete = true,
            InboundVoiceEvent::Other(name) => debug!(event = %name, "ignoring voice event"),
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.assistant.is_empty() && self.audio.is_empty()
    }

    pub fn user_transcript(&self) -> String {
        self.user.join(" ")
    }

    pub fn assistant_text(&self) -> String {
        self.assistant.join(" ")
    }

    pub fn audio(&self) -> &[u8] {
        &self.audio
    }

    pub fn into_audio(self) -> Vec<u8> {
        self.audio
    }
}
