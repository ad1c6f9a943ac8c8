//! SSE 传输

use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::TurnEvent;

/// 把单个事件编码成 SSE 帧，事件名即事件类型
pub fn encode_event(event: &TurnEvent) -> Result<Event, axum::Error> {
    Event::default().event(event.event_type()).json_data(event)
}

/// 把事件通道包装成 SSE 响应
///
/// 响应被丢弃（客户端断开）时接收端随之释放，Coordinator 通过 `EventSink::closed` 感知。
pub fn into_sse(rx: mpsc::Receiver<TurnEvent>) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let stream = ReceiverStream::new(rx).map(|event| encode_event(&event));
    Sse::new(stream).keep_alive(KeepAlive::default())
}
