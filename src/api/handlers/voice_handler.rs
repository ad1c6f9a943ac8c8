//! 语音 WebSocket
//!
//! 二进制帧为 16 位 PCM，文本帧为控制消息。一个连接内的轮次顺序执行。

use std::sync::Arc;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use tracing::{debug, info, warn};

use crate::{
    api::{
        app_state::AppState,
        dto::{
            turn_dto::validate_session_id,
            voice_dto::{VoiceClientMessage, VoiceServerMessage},
        },
    },
    error::AppError,
    models::profile::UserContext,
    observability::AppMetrics,
    voice::{VoiceError, VoicePipeline, chunk_pcm},
};

const VOICE_UNAVAILABLE: &str = "The voice service is temporarily unavailable. Please try again in a moment.";

pub async fn voice_ws_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: Option<WebSocketUpgrade>,
) -> Result<Response, AppError> {
    validate_session_id(&session_id)?;
    let pipeline = state
        .voice
        .clone()
        .ok_or_else(|| AppError::Unavailable("voice is not configured".into()))?;
    let ws = ws.ok_or_else(|| AppError::Validation("websocket upgrade required".into()))?;

    let metrics = state.metrics.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, pipeline, metrics, session_id)))
}

/// 单个语音连接
struct VoiceConnection {
    session_id: String,
    pipeline: Arc<VoicePipeline>,
    sender: SplitSink<WebSocket, Message>,
    buffer: Vec<u8>,
}

impl VoiceConnection {
    async fn send(&mut self, message: VoiceServerMessage) -> bool {
        self.sender.send(Message::Text(message.to_json())).await.is_ok()
    }

    /// 缓冲音频；超过单轮上限时丢弃并报错
    async fn push_audio(&mut self, bytes: Vec<u8>) -> bool {
        let max = self.pipeline.config().max_input_bytes;
        if self.buffer.len() + bytes.len() > max {
            let size = self.buffer.len() + bytes.len();
            self.buffer.clear();
            let err = VoiceError::InputTooLarge { size, max };
            return self.send(VoiceServerMessage::Error { message: err.to_string() }).await;
        }
        self.buffer.extend_from_slice(&bytes);
        true
    }

    async fn end_turn(&mut self, user_context: UserContext) -> bool {
        let pcm = std::mem::take(&mut self.buffer);
        match self.pipeline.run_turn(&self.session_id, &pcm, &user_context).await {
            Ok(output) => {
                if !output.user_transcript.is_empty()
                    && !self
                        .send(VoiceServerMessage::Transcript {
                            role: "user".into(),
                            text: output.user_transcript.clone(),
                        })
                        .await
                {
                    return false;
                }
                if !self
                    .send(VoiceServerMessage::Transcript {
                        role: "assistant".into(),
                        text: output.reply_text.clone(),
                    })
                    .await
                {
                    return false;
                }
                let chunk_ms = self.pipeline.config().chunk_ms;
                for chunk in chunk_pcm(&output.audio, output.sample_rate, chunk_ms) {
                    if self.sender.send(Message::Binary(chunk.to_vec())).await.is_err() {
                        return false;
                    }
                }
                self.send(VoiceServerMessage::TurnComplete {
                    sample_rate: output.sample_rate,
                    safety_override: output.safety_override,
                })
                .await
            }
            Err(err) => {
                let message = if err.is_client_error() {
                    err.to_string()
                } else {
                    warn!(session_id = %self.session_id, stage = "voice", error = %err, "voice turn failed");
                    VOICE_UNAVAILABLE.to_string()
                };
                self.send(VoiceServerMessage::Error { message }).await
            }
        }
    }

    async fn handle_text(&mut self, text: &str) -> bool {
        match serde_json::from_str::<VoiceClientMessage>(text) {
            Ok(VoiceClientMessage::EndTurn { user_context }) => self.end_turn(user_context.unwrap_or_default()).await,
            Ok(VoiceClientMessage::Reset) => {
                self.buffer.clear();
                true
            }
            Err(e) => {
                debug!(session_id = %self.session_id, error = %e, "invalid voice control frame");
                self.send(VoiceServerMessage::Error {
                    message: "invalid control message".into(),
                })
                .await
            }
        }
    }
}

async fn handle_socket(ws: WebSocket, pipeline: Arc<VoicePipeline>, metrics: Arc<AppMetrics>, session_id: String) {
    let (sender, mut receiver) = ws.split();
    metrics.connection_opened();
    info!(session_id = %session_id, "voice connection opened");

    let mut conn = VoiceConnection {
        session_id,
        pipeline,
        sender,
        buffer: Vec::new(),
    };

    while let Some(msg) = receiver.next().await {
        let keep_going = match msg {
            Ok(Message::Binary(bytes)) => conn.push_audio(bytes).await,
            Ok(Message::Text(text)) => conn.handle_text(&text).await,
            Ok(Message::Close(_)) => false,
            Ok(_) => true,
            Err(e) => {
                debug!(session_id = %conn.session_id, error = %e, "voice socket error");
                false
            }
        };
        if !keep_going {
            break;
        }
    }

    metrics.connection_closed();
    debug!(session_id = %conn.session_id, "voice connection closed");
}
