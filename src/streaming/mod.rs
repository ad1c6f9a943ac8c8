//! 文本事件流
//!
//! Coordinator 把类型化事件写进通道，传输层（SSE）负责排空。
//! 事件按产生顺序送达；流以 `final` 或 `error` 之一加 `done` 结束，
//! 或在客户端提前断开时终止。

pub mod sse;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::agent::{AgentStage, TurnResult};

/// 默认通道容量
pub const DEFAULT_CAPACITY: usize = 64;

/// 流水线事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    /// 进度消息
    Status { message: String },
    /// 单个阶段完成
    AgentUpdate {
        stage: AgentStage,
        summary: String,
        payload: serde_json::Value,
    },
    /// 增量回复文本（仅流式模式）；`replace` 为真时客户端丢弃已收到的正文
    TextChunk {
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        replace: bool,
    },
    /// 完整结构化结果
    Final { result: Box<TurnResult> },
    /// 脱敏后的错误消息
    Error { message: String },
    Done,
}

impl TurnEvent {
    pub fn status(message: impl Into<String>) -> Self {
        TurnEvent::Status { message: message.into() }
    }

    pub fn text_chunk(text: impl Into<String>) -> Self {
        TurnEvent::TextChunk {
            text: text.into(),
            replace: false,
        }
    }

    /// 替换此前流出的全部正文
    pub fn replacement_text(text: impl Into<String>) -> Self {
        TurnEvent::TextChunk {
            text: text.into(),
            replace: true,
        }
    }

    pub fn agent_update(stage: AgentStage, summary: impl Into<String>, payload: serde_json::Value) -> Self {
        TurnEvent::AgentUpdate {
            stage,
            summary: summary.into(),
            payload,
        }
    }

    /// SSE 事件名
    pub fn event_type(&self) -> &'static str {
        match self {
            TurnEvent::Status { .. } => "status",
            TurnEvent::AgentUpdate { .. } => "agent_update",
            TurnEvent::TextChunk { .. } => "text_chunk",
            TurnEvent::Final { .. } => "final",
            TurnEvent::Error { .. } => "error",
            TurnEvent::Done => "done",
        }
    }

    /// 是否为结束流的事件（final/error）
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnEvent::Final { .. } | TurnEvent::Error { .. })
    }
}

/// 事件写入端
///
/// 非流式调用使用 `disabled()`，事件被丢弃。
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<TurnEvent>>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TurnEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_streaming(&self) -> bool {
        self.tx.is_some()
    }

    /// 发送事件；接收端已关闭时返回 false
    pub async fn emit(&self, event: TurnEvent) -> bool {
        match &self.tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => true,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.is_closed())
    }

    /// 等待接收端关闭；禁用的 sink 永不完成
    pub async fn closed(&self) {
        match &self.tx {
            Some(tx) => tx.closed().await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_event_serialization_uses_type_tag() {
        let json = serde_json::to_value(TurnEvent::text_chunk("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "text_chunk", "text": "hi"}));

        let json = serde_json::to_value(TurnEvent::replacement_text("hello")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "text_chunk", "text": "hello", "replace": true}));

        let json = serde_json::to_value(TurnEvent::Done).unwrap();
        assert_eq!(json, serde_json::json!({"type": "done"}));

        let update = TurnEvent::agent_update(AgentStage::Planner, "plan ready", serde_json::json!({}));
        assert_eq!(serde_json::to_value(&update).unwrap()["stage"], "planner");
        assert_eq!(update.event_type(), "agent_update");
    }

    #[tokio::test]
    async fn test_sink_preserves_order() {
        let (sink, mut rx) = EventSink::channel(8);
        assert!(sink.emit(TurnEvent::status("one")).await);
        assert!(sink.emit(TurnEvent::status("two")).await);
        assert!(sink.emit(TurnEvent::Done).await);
        drop(sink);

        let mut types = Vec::new();
        while let Some(event) = rx.recv().await {
            types.push(event);
        }
        assert_eq!(
            types,
            vec![TurnEvent::status("one"), TurnEvent::status("two"), TurnEvent::Done]
        );
    }

    #[tokio::test]
    async fn test_sink_reports_disconnect() {
        let (sink, rx) = EventSink::channel(8);
        assert!(!sink.is_closed());
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.emit(TurnEvent::Done).await);
        tokio::time::timeout(Duration::from_millis(100), sink.closed())
            .await
            .expect("closed resolves after receiver drop");
    }

    #[tokio::test]
    async fn test_disabled_sink_never_closes() {
        let sink = EventSink::disabled();
        assert!(sink.emit(TurnEvent::Done).await);
        assert!(!sink.is_closed());
        assert!(tokio::time::timeout(Duration::from_millis(20), sink.closed()).await.is_err());
    }
}
