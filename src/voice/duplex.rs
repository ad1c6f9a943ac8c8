//! 双向语音模型会话
//!
//! HTTP 实现把出站事件写成一个流式请求体（NDJSON，每行一个事件），
//! 再逐行读取流式响应。单一写端、单一读端，保持上游产生的顺序。

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Body, Client};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::VoiceError;
use super::accumulator::InboundVoiceEvent;
use super::protocol::VoiceEvent;
use crate::config::config::LlmConfig;

const CHANNEL_CAPACITY: usize = 256;

/// 已打开的双工会话
pub struct DuplexSession {
    pub outbound: mpsc::Sender<VoiceEvent>,
    pub inbound: mpsc::Receiver<Result<InboundVoiceEvent, VoiceError>>,
}

/// 双向语音模型能力（外部协作方）
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioModelService: Send + Sync {
    async fn open(&self) -> Result<DuplexSession, VoiceError>;
}

pub struct HttpDuplexAudioService {
    http: Client,
    url: String,
    api_key: String,
    model: String,
}

impl HttpDuplexAudioService {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            url: url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    pub fn from_config(config: &LlmConfig) -> Result<Self, VoiceError> {
        let http = Client::builder()
            .connect_timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()?;
        Ok(Self {
            http,
            url: config.audio_url.clone(),
            api_key: config.api_key(),
            model: config.audio_model.clone(),
        })
    }
}

#[async_trait]
impl AudioModelService for HttpDuplexAudioService {
    async fn open(&self) -> Result<DuplexSession, VoiceError> {
        let (out_tx, out_rx) = mpsc::channel::<VoiceEvent>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let lines = ReceiverStream::new(out_rx).map(|event| event.to_json().map(|line| line + "\n"));
        let mut request = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .header("x-model-id", &self.model)
            .body(Body::wrap_stream(lines));
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        // 上游可能在请求体结束前开始响应，读端放到独立任务里
        tokio::spawn(read_responses(request, in_tx));

        Ok(DuplexSession {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

async fn read_responses(
    request: reqwest::RequestBuilder,
    tx: mpsc::Sender<Result<InboundVoiceEvent, VoiceError>>,
) {
    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => {
            let _ = tx.send(Err(VoiceError::Network(e))).await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), body = %body, "voice upstream error body");
        let _ = tx
            .send(Err(VoiceError::Upstream(format!("status {}", status.as_u16()))))
            .await;
        return;
    }

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx.send(Err(VoiceError::Network(e))).await;
                return;
            }
        };
        buffer.extend_from_slice(&chunk);

        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let event = InboundVoiceEvent::parse(line);
            if let Err(e) = &event {
                warn!(error = %e, "unparsable voice event");
            }
            if tx.send(event).await.is_err() {
                return;
            }
        }
    }

    let rest = String::from_utf8_lossy(&buffer);
    if !rest.trim().is_empty() {
        let _ = tx.send(InboundVoiceEvent::parse(rest.trim())).await;
    }
}
