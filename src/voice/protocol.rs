//! 双向语音事件协议（出站）
//!
//! 每个事件序列化为 `{"event":{"<name>":{…}}}`，音频负载为 base64。
//! 顺序必须与生成顺序一致，乱序会破坏上游的音频解码。

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::config::config::{Budget, VoiceConfig};
use crate::models::session::{Role, Turn};

/// 事件外层包装
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope<T> {
    pub event: T,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum VoiceRole {
    System,
    User,
    Assistant,
}

impl From<Role> for VoiceRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => VoiceRole::User,
            Role::Assistant => VoiceRole::Assistant,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentKind {
    Text,
    Audio,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfiguration {
    pub max_tokens: u32,
    pub top_p: f32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TextFormat {
    pub media_type: String,
}

impl Default for TextFormat {
    fn default() -> Self {
        Self {
            media_type: "text/plain".into(),
        }
    }
}

/// 16 位单声道 LPCM
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub media_type: String,
    pub sample_rate_hertz: u32,
    pub sample_size_bits: u16,
    pub channel_count: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    pub encoding: String,
    pub audio_type: String,
}

impl AudioFormat {
    pub fn input(sample_rate: u32) -> Self {
        Self {
            media_type: "audio/lpcm".into(),
            sample_rate_hertz: sample_rate,
            sample_size_bits: 16,
            channel_count: 1,
            voice_id: None,
            encoding: "base64".into(),
            audio_type: "SPEECH".into(),
        }
    }

    pub fn output(sample_rate: u32, voice_id: &str) -> Self {
        Self {
            voice_id: Some(voice_id.to_string()),
            ..Self::input(sample_rate)
        }
    }
}

/// 出站事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum VoiceEvent {
    SessionStart {
        inference_configuration: InferenceConfiguration,
    },
    PromptStart {
        prompt_name: String,
        text_output_configuration: TextFormat,
        audio_output_configuration: AudioFormat,
    },
    ContentStart {
        prompt_name: String,
        content_name: String,
        #[serde(rename = "type")]
        kind: ContentKind,
        interactive: bool,
        role: VoiceRole,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text_input_configuration: Option<TextFormat>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_input_configuration: Option<AudioFormat>,
    },
    TextInput {
        prompt_name: String,
        content_name: String,
        content: String,
    },
    AudioInput {
        prompt_name: String,
        content_name: String,
        /// base64 编码的 PCM
        content: String,
    },
    ContentEnd {
        prompt_name: String,
        content_name: String,
    },
    PromptEnd {
        prompt_name: String,
    },
    SessionEnd {},
}

impl VoiceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            VoiceEvent::SessionStart { .. } => "sessionStart",
            VoiceEvent::PromptStart { .. } => "promptStart",
            VoiceEvent::ContentStart { .. } => "contentStart",
            VoiceEvent::TextInput { .. } => "textInput",
            VoiceEvent::AudioInput { .. } => "audioInput",
            VoiceEvent::ContentEnd { .. } => "contentEnd",
            VoiceEvent::PromptEnd { .. } => "promptEnd",
            VoiceEvent::SessionEnd {} => "sessionEnd",
        }
    }

    /// 序列化为一行 JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&Envelope { event: self })
    }
}

/// 按固定时长切分 PCM
///
/// 分片大小 = 采样率 × 2 字节 × 时长 / 1000，向下取偶数，至少一个采样。
pub fn chunk_pcm(pcm: &[u8], sample_rate: u32, chunk_ms: u32) -> Vec<&[u8]> {
    let size = ((sample_rate as usize * 2 * chunk_ms as usize / 1000) & !1).max(2);
    pcm.chunks(size).collect()
}

/// 一轮语音对话的出站脚本
///
/// `turn` 为系统提示、历史文本与用户音频段；`closing` 在收到回复后发送。
#[derive(Debug, Clone)]
pub struct VoiceScript {
    pub prompt_name: String,
    pub turn: Vec<VoiceEvent>,
    pub closing: Vec<VoiceEvent>,
}

impl VoiceScript {
    pub fn build(config: &VoiceConfig, budget: Budget, system_prompt: &str, history: &[Turn], pcm: &[u8]) -> Self {
        let prompt_name = uuid::Uuid::new_v4().to_string();
        let mut turn = vec![
            VoiceEvent::SessionStart {
                inference_configuration: InferenceConfiguration {
                    max_tokens: budget.max_tokens,
                    top_p: 0.9,
                    temperature: budget.temperature,
                },
            },
            VoiceEvent::PromptStart {
                prompt_name: prompt_name.clone(),
                text_output_configuration: TextFormat::default(),
                audio_output_configuration: AudioFormat::output(config.output_sample_rate, &config.voice_id),
            },
        ];

        push_text(&mut turn, &prompt_name, VoiceRole::System, system_prompt);
        for past in history {
            push_text(&mut turn, &prompt_name, past.role.into(), &past.content);
        }

        let content_name = uuid::Uuid::new_v4().to_string();
        turn.push(VoiceEvent::ContentStart {
            prompt_name: prompt_name.clone(),
            content_name: content_name.clone(),
            kind: ContentKind::Audio,
            interactive: true,
            role: VoiceRole::User,
            text_input_configuration: None,
            audio_input_configuration: Some(AudioFormat::input(config.input_sample_rate)),
        });
        for chunk in chunk_pcm(pcm, config.input_sample_rate, config.chunk_ms) {
            turn.push(VoiceEvent::AudioInput {
                prompt_name: prompt_name.clone(),
                content_name: content_name.clone(),
                content: STANDARD.encode(chunk),
            });
        }
        turn.push(VoiceEvent::ContentEnd {
            prompt_name: prompt_name.clone(),
            content_name,
        });

        let closing = vec![
            VoiceEvent::PromptEnd {
                prompt_name: prompt_name.clone(),
            },
            VoiceEvent::SessionEnd {},
        ];

        Self {
            prompt_name,
            turn,
            closing,
        }
    }

    /// 完整的出站顺序
    pub fn events(&self) -> impl Iterator<Item = &VoiceEvent> {
        self.turn.iter().chain(self.closing.iter())
    }
}

fn push_text(events: &mut Vec<VoiceEvent>, prompt_name: &str, role: VoiceRole, text: &str) {
    let content_name = uuid::Uuid::new_v4().to_string();
    events.push(VoiceEvent::ContentStart {
        prompt_name: prompt_name.to_string(),
        content_name: content_name.clone(),
        kind: ContentKind::Text,
        interactive: false,
        role,
        text_input_configuration: Some(TextFormat::default()),
        audio_input_configuration: None,
    });
    events.push(VoiceEvent::TextInput {
        prompt_name: prompt_name.to_string(),
        content_name: content_name.clone(),
        content: text.to_string(),
    });
    events.push(VoiceEvent::ContentEnd {
        prompt_name: prompt_name.to_string(),
        content_name,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VoiceConfig {
        VoiceConfig::default()
    }

    #[test]
    fn test_chunk_size_at_16khz_32ms() {
        let pcm = vec![0u8; 2500];
        let chunks = chunk_pcm(&pcm, 16_000, 32);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 1024);
        assert_eq!(chunks[2].len(), 2500 - 2048);
    }

    #[test]
    fn test_chunk_size_never_splits_a_sample() {
        // 22050 Hz × 2 × 32 ms / 1000 = 1411
        let pcm = vec![0u8; 4000];
        let chunks = chunk_pcm(&pcm, 22_050, 32);
        assert_eq!(chunks[0].len(), 1410);
        assert!(chunks.iter().all(|c| c.len() % 2 == 0));
    }

    #[test]
    fn test_event_envelope_shape() {
        let event = VoiceEvent::AudioInput {
            prompt_name: "p".into(),
            content_name: "c".into(),
            content: "AAA=".into(),
        };
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["event"]["audioInput"]["promptName"], "p");
        assert_eq!(json["event"]["audioInput"]["contentName"], "c");

        let end = VoiceEvent::SessionEnd {}.to_json().unwrap();
        assert_eq!(end, r#"{"event":{"sessionEnd":{}}}"#);
    }

    #[test]
    fn test_content_start_uses_type_field() {
        let event = VoiceEvent::ContentStart {
            prompt_name: "p".into(),
            content_name: "c".into(),
            kind: ContentKind::Audio,
            interactive: true,
            role: VoiceRole::User,
            text_input_configuration: None,
            audio_input_configuration: Some(AudioFormat::input(16_000)),
        };
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        let body = &json["event"]["contentStart"];
        assert_eq!(body["type"], "AUDIO");
        assert_eq!(body["role"], "USER");
        assert_eq!(body["audioInputConfiguration"]["sampleRateHertz"], 16_000);
        assert!(body.get("textInputConfiguration").is_none());
    }

    #[test]
    fn test_script_order() {
        let history = vec![Turn::user("hi"), Turn::assistant("hello!")];
        let pcm = vec![1u8; 3000];
        let script = VoiceScript::build(&config(), Budget::new(512, 0.7), "be kind", &history, &pcm);
        let names: Vec<_> = script.events().map(VoiceEvent::name).collect();

        assert_eq!(
            names,
            vec![
                "sessionStart",
                "promptStart",
                // system
                "contentStart", "textInput", "contentEnd",
                // history
                "contentStart", "textInput", "contentEnd",
                "contentStart", "textInput", "contentEnd",
                // audio
                "contentStart", "audioInput", "audioInput", "audioInput", "contentEnd",
                "promptEnd",
                "sessionEnd",
            ]
        );
        assert!(script.events().all(|e| match e {
            VoiceEvent::SessionStart { .. } | VoiceEvent::SessionEnd {} => true,
            VoiceEvent::PromptStart { prompt_name, .. }
            | VoiceEvent::ContentStart { prompt_name, .. }
            | VoiceEvent::TextInput { prompt_name, .. }
            | VoiceEvent::AudioInput { prompt_name, .. }
            | VoiceEvent::ContentEnd { prompt_name, .. }
            | VoiceEvent::PromptEnd { prompt_name } => *prompt_name == script.prompt_name,
        }));
    }

    #[test]
    fn test_audio_chunks_round_trip_in_order() {
        let pcm: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let script = VoiceScript::build(&config(), Budget::new(512, 0.7), "sys", &[], &pcm);
        let decoded: Vec<u8> = script
            .turn
            .iter()
            .filter_map(|e| match e {
                VoiceEvent::AudioInput { content, .. } => STANDARD.decode(content).ok(),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(decoded, pcm);
    }
}
