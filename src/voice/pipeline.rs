//! 语音对话轮次
//!
//! 与文本流水线共用会话记忆：系统提示取自会话笔记与事实，交换结果写回历史。

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::VoiceError;
use super::accumulator::VoiceAccumulator;
use super::duplex::{AudioModelService, DuplexSession};
use super::protocol::VoiceScript;
use crate::config::config::{Budget, VoiceConfig};
use crate::models::profile::UserContext;
use crate::models::session::Turn;
use crate::observability::AppMetrics;
use crate::services::coordinator::SessionLocks;
use crate::services::dispatcher::is_dangerous;
use crate::services::fallback::safety_reply;
use crate::services::memory_store::SessionMemoryStore;

/// 附带给语音模型的历史轮数
const VOICE_HISTORY_TURNS: usize = 6;

const VOICE_PROMPT: &str = "You are a warm, upbeat wellness coach speaking with the user by voice. \
Keep replies to two or three short spoken sentences. Focus on energy, sleep, stress, food and movement. \
Never give medical diagnoses; suggest seeing a professional when symptoms sound serious.";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VoiceTurnOutput {
    pub session_id: String,
    pub user_transcript: String,
    pub reply_text: String,
    /// 16 位 PCM，按到达顺序拼接
    #[serde(skip)]
    pub audio: Vec<u8>,
    pub sample_rate: u32,
    /// 转写命中危险模式，使用固定安全回复
    pub safety_override: bool,
}

pub struct VoicePipeline {
    service: Arc<dyn AudioModelService>,
    memory: Arc<SessionMemoryStore>,
    locks: Arc<SessionLocks>,
    metrics: Arc<AppMetrics>,
    config: VoiceConfig,
    budget: Budget,
}

impl VoicePipeline {
    pub fn new(
        service: Arc<dyn AudioModelService>,
        memory: Arc<SessionMemoryStore>,
        locks: Arc<SessionLocks>,
        metrics: Arc<AppMetrics>,
        config: VoiceConfig,
        budget: Budget,
    ) -> Self {
        Self {
            service,
            memory,
            locks,
            metrics,
            config,
            budget,
        }
    }

    pub fn config(&self) -> &VoiceConfig {
        &self.config
    }

    pub async fn run_turn(
        &self,
        session_id: &str,
        pcm: &[u8],
        user_context: &UserContext,
    ) -> Result<VoiceTurnOutput, VoiceError> {
        if pcm.is_empty() {
            return Err(VoiceError::EmptyInput);
        }
        if pcm.len() > self.config.max_input_bytes {
            return Err(VoiceError::InputTooLarge {
                size: pcm.len(),
                max: self.config.max_input_bytes,
            });
        }
        if pcm.len() % 2 != 0 {
            return Err(VoiceError::OddLength(pcm.len()));
        }

        // 与同一会话的文本轮次串行，持有到历史写回之后
        let _guard = self.locks.acquire(session_id).await;
        self.memory.evict_expired();
        self.metrics.record_voice_turn();

        let system = self.system_prompt(session_id, user_context);
        let history = self.memory.last_turns(session_id, VOICE_HISTORY_TURNS);
        let script = VoiceScript::build(&self.config, self.budget, &system, &history, pcm);

        let session = self.service.open().await?;
        let timeout = Duration::from_secs(self.config.turn_timeout_secs.max(1));
        let acc = tokio::time::timeout(timeout, exchange(session, script))
            .await
            .map_err(|_| {
                warn!(session_id, stage = "voice", "voice turn timed out");
                VoiceError::Timeout(timeout)
            })??;

        let transcript = acc.user_transcript();
        let safety_override = is_dangerous(&transcript);
        let (reply_text, audio) = if safety_override {
            warn!(session_id, stage = "voice", "dangerous content in voice transcript, replying with safety message");
            (safety_reply().to_string(), Vec::new())
        } else {
            (acc.assistant_text(), acc.into_audio())
        };

        let user_text = if transcript.is_empty() {
            "(voice message)".to_string()
        } else {
            transcript.clone()
        };
        self.memory.append(session_id, Turn::user(user_text));
        self.memory.append(session_id, Turn::assistant(reply_text.clone()));
        self.metrics.set_sessions_active(self.memory.session_count());

        info!(
            session_id,
            stage = "voice",
            transcript_chars = transcript.len(),
            audio_bytes = audio.len(),
            "voice turn completed"
        );

        Ok(VoiceTurnOutput {
            session_id: session_id.to_string(),
            user_transcript: transcript,
            reply_text,
            audio,
            sample_rate: self.config.output_sample_rate,
            safety_override,
        })
    }

    fn system_prompt(&self, session_id: &str, user: &UserContext) -> String {
        let mut lines = vec![VOICE_PROMPT.to_string()];
        let profile = user.describe();
        if !profile.is_empty() {
            lines.push(format!("User profile: {}", profile));
        }
        let facts = self.memory.facts(session_id);
        if !facts.is_empty() {
            lines.push(format!("Known facts: {}", facts.join("; ")));
        }
        let notes = self.memory.notes(session_id);
        if !notes.is_empty() {
            lines.push(format!("Adaptation notes: {}", notes.join("; ")));
        }
        lines.join("\n")
    }
}

/// 发送脚本并累积输出；收到 completionEnd 后发送结束事件
async fn exchange(session: DuplexSession, script: VoiceScript) -> Result<VoiceAccumulator, VoiceError> {
    let DuplexSession { outbound, mut inbound } = session;
    let VoiceScript { turn, closing, .. } = script;

    let writer = outbound.clone();
    let send = async move {
        for event in turn {
            writer.send(event).await.map_err(|_| VoiceError::Closed)?;
        }
        Ok::<_, VoiceError>(())
    };
    let receive = async {
        let mut acc = VoiceAccumulator::new();
        while let Some(event) = inbound.recv().await {
            acc.push(event?)?;
            if acc.is_complete() {
                return Ok(acc);
            }
        }
        if acc.is_empty() {
            Err(VoiceError::Closed)
        } else {
            warn!(stage = "voice", "voice stream ended without completion");
            Ok(acc)
        }
    };

    let (sent, received) = tokio::join!(send, receive);
    let acc = received?;
    sent?;

    for event in closing {
        if outbound.send(event).await.is_err() {
            break;
        }
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config::MemoryConfig;
    use crate::voice::duplex::MockAudioModelService;
    use crate::voice::protocol::VoiceEvent;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    /// 记录出站事件名称，按给定行回放入站事件
    fn scripted_service(replies: Vec<String>, seen: Arc<Mutex<Vec<&'static str>>>) -> MockAudioModelService {
        gated_service(replies, seen, None)
    }

    /// 同上；给定 `gate` 时等到放行才开始回复
    fn gated_service(
        replies: Vec<String>,
        seen: Arc<Mutex<Vec<&'static str>>>,
        gate: Option<Arc<Notify>>,
    ) -> MockAudioModelService {
        let mut service = MockAudioModelService::new();
        service.expect_open().returning(move || {
            let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<VoiceEvent>(256);
            let (in_tx, in_rx) = tokio::sync::mpsc::channel(256);
            let replies = replies.clone();
            let seen = seen.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                // 收到用户音频段结束后开始回复
                let mut audio_started = false;
                while let Some(event) = out_rx.recv().await {
                    seen.lock().unwrap().push(event.name());
                    match event {
                        VoiceEvent::AudioInput { .. } => audio_started = true,
                        VoiceEvent::ContentEnd { .. } if audio_started => {
                            if let Some(gate) = &gate {
                                gate.notified().await;
                            }
                            for line in &replies {
                                let _ = in_tx.send(crate::voice::InboundVoiceEvent::parse(line)).await;
                            }
                        }
                        _ => {}
                    }
                }
            });
            Ok(DuplexSession {
                outbound: out_tx,
                inbound: in_rx,
            })
        });
        service
    }

    fn reply_lines(user: &str, assistant: &str, audio: &[&[u8]]) -> Vec<String> {
        let mut lines = vec![
            serde_json::json!({"event": {"textOutput": {"role": "USER", "content": user}}}).to_string(),
            serde_json::json!({"event": {"textOutput": {"role": "ASSISTANT", "content": assistant}}}).to_string(),
        ];
        for chunk in audio {
            lines.push(serde_json::json!({"event": {"audioOutput": {"content": STANDARD.encode(chunk)}}}).to_string());
        }
        lines.push(r#"{"event":{"completionEnd":{"stopReason":"END_TURN"}}}"#.to_string());
        lines
    }

    fn pipeline(service: MockAudioModelService) -> VoicePipeline {
        VoicePipeline::new(
            Arc::new(service),
            Arc::new(SessionMemoryStore::new(MemoryConfig::default())),
            Arc::new(SessionLocks::new()),
            Arc::new(AppMetrics::default()),
            VoiceConfig::default(),
            Budget::new(512, 0.7),
        )
    }

    #[tokio::test]
    async fn test_voice_turn_round_trip() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let service = scripted_service(
            reply_lines("I'm tired today", "Let's keep today gentle.", &[&[1, 2], &[3, 4]]),
            seen.clone(),
        );
        let pipeline = pipeline(service);
        let out = pipeline
            .run_turn("v1", &vec![0u8; 4096], &UserContext::default())
            .await
            .unwrap();

        assert_eq!(out.user_transcript, "I'm tired today");
        assert_eq!(out.reply_text, "Let's keep today gentle.");
        assert_eq!(out.audio, vec![1, 2, 3, 4]);
        assert!(!out.safety_override);
        assert_eq!(pipeline.memory.size("v1"), 2);

        // 让模拟任务处理完结束事件
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.first(), Some(&"sessionStart"));
        assert_eq!(seen.iter().filter(|n| **n == "audioInput").count(), 4);
        assert_eq!(&seen[seen.len() - 2..], &["promptEnd", "sessionEnd"]);
    }

    #[tokio::test]
    async fn test_dangerous_transcript_gets_safety_reply() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let service = scripted_service(
            reply_lines("I want to drink bleach", "Here's how...", &[&[9, 9]]),
            seen,
        );
        let pipeline = pipeline(service);
        let out = pipeline
            .run_turn("v1", &vec![0u8; 64], &UserContext::default())
            .await
            .unwrap();

        assert!(out.safety_override);
        assert_eq!(out.reply_text, safety_reply());
        assert!(out.audio.is_empty());
        let history = pipeline.memory.recent_history("v1");
        assert_eq!(history[1].content, safety_reply());
    }

    #[tokio::test]
    async fn test_input_checks() {
        let pipeline = pipeline(MockAudioModelService::new());
        let user = UserContext::default();
        assert!(matches!(pipeline.run_turn("v1", &[], &user).await, Err(VoiceError::EmptyInput)));
        assert!(matches!(pipeline.run_turn("v1", &[0u8; 3], &user).await, Err(VoiceError::OddLength(3))));
        let too_big = vec![0u8; VoiceConfig::default().max_input_bytes + 2];
        assert!(matches!(
            pipeline.run_turn("v1", &too_big, &user).await,
            Err(VoiceError::InputTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_session_closed_without_output() {
        let mut service = MockAudioModelService::new();
        service.expect_open().returning(|| {
            let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<VoiceEvent>(256);
            let (in_tx, in_rx) = tokio::sync::mpsc::channel(1);
            tokio::spawn(async move {
                while out_rx.recv().await.is_some() {}
            });
            drop(in_tx);
            Ok(DuplexSession {
                outbound: out_tx,
                inbound: in_rx,
            })
        });
        let pipeline = pipeline(service);
        let err = pipeline
            .run_turn("v1", &[0u8; 64], &UserContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::Closed));
        assert_eq!(pipeline.memory.size("v1"), 0);
    }

    #[tokio::test]
    async fn test_voice_turn_serializes_with_text_turn() {
        use crate::config::config::AppConfig;
        use crate::llm::client::mock::{MockLlmClient, MockReply};
        use crate::models::session::Role;
        use crate::services::coordinator::{Coordinator, TurnRequest};
        use crate::services::nutrition::StaticNutritionTable;
        use crate::streaming::EventSink;

        let memory = Arc::new(SessionMemoryStore::new(MemoryConfig::default()));
        let metrics = Arc::new(AppMetrics::default());
        let coordinator = Coordinator::new(
            &AppConfig::development(),
            Arc::new(MockLlmClient::new(vec![MockReply::text("Anytime!")])),
            Arc::new(StaticNutritionTable::new()),
            memory.clone(),
            metrics.clone(),
        );
        let gate = Arc::new(Notify::new());
        let service = gated_service(
            reply_lines("I slept badly", "Take it slow this morning.", &[&[1, 2]]),
            Arc::new(Mutex::new(Vec::new())),
            Some(gate.clone()),
        );
        let pipeline = VoicePipeline::new(
            Arc::new(service),
            memory.clone(),
            coordinator.session_locks(),
            metrics,
            VoiceConfig::default(),
            Budget::new(512, 0.7),
        );

        let user_ctx = UserContext::default();
        let voice = pipeline.run_turn("s1", &[0u8; 64], &user_ctx);
        let text = async {
            tokio::task::yield_now().await;
            coordinator
                .run_turn(TurnRequest::new("s1", "ok thanks"), EventSink::disabled())
                .await
        };
        let release = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            // 语音轮次持锁期间文本轮次不能写入
            assert_eq!(memory.size("s1"), 0);
            gate.notify_one();
        };
        let (voice, text, ()) = tokio::join!(voice, text, release);
        assert!(voice.is_ok() && text.is_ok());

        let history = memory.recent_history("s1");
        let roles: Vec<_> = history.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
        assert_eq!(history[0].content, "I slept badly");
        assert_eq!(history[2].content, "ok thanks");
    }
}
