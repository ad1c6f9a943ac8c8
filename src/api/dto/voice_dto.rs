//! 语音 WebSocket 帧

use serde::{Deserialize, Serialize};

use crate::models::profile::UserContext;

/// 客户端文本帧
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceClientMessage {
    /// 已发送的音频构成一轮，开始处理
    EndTurn {
        #[serde(default)]
        user_context: Option<UserContext>,
    },
    /// 丢弃已缓冲的音频
    Reset,
}

/// 服务端文本帧
#[derive(Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceServerMessage {
    Transcript { role: String, text: String },
    TurnComplete { sample_rate: u32, safety_override: bool },
    Error { message: String },
}

impl VoiceServerMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","message":"encoding failed"}"#.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages() {
        let end: VoiceClientMessage = serde_json::from_str(r#"{"type":"end_turn"}"#).unwrap();
        assert_eq!(end, VoiceClientMessage::EndTurn { user_context: None });
        let reset: VoiceClientMessage = serde_json::from_str(r#"{"type":"reset"}"#).unwrap();
        assert_eq!(reset, VoiceClientMessage::Reset);
    }

    #[test]
    fn test_server_message_shape() {
        let msg = VoiceServerMessage::Transcript {
            role: "user".into(),
            text: "hi".into(),
        };
        assert_eq!(msg.to_json(), r#"{"type":"transcript","role":"user","text":"hi"}"#);
    }
}
