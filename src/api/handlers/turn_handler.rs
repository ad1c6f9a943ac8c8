use axum::{
    Json,
    extract::State,
    response::{IntoResponse, Response},
};
use tracing::{debug, error};

use crate::{
    api::{app_state::AppState, dto::turn_dto::*},
    error::AppError,
    services::coordinator::PipelineError,
    streaming::{DEFAULT_CAPACITY, EventSink, sse::into_sse},
};

/// 提交一轮对话
///
/// `streaming=true` 时返回 SSE 事件流，否则返回完整的 `TurnResult`。
/// 流水线在独立任务中运行，客户端断开不会丢失已排队的会话写入。
pub async fn create_turn(
    State(state): State<AppState>,
    Json(request): Json<CreateTurnRequest>,
) -> Result<Response, AppError> {
    request.validate()?;
    debug!(
        session_id = %request.session_id,
        streaming = request.streaming,
        has_image = request.image.is_some(),
        "turn submitted"
    );

    let streaming = request.streaming;
    let turn = request.into_request();
    let coordinator = state.coordinator.clone();

    if streaming {
        let (sink, rx) = EventSink::channel(DEFAULT_CAPACITY);
        tokio::spawn(async move {
            // 错误已作为事件送达
            let _ = coordinator.run_turn(turn, sink).await;
        });
        return Ok(into_sse(rx).into_response());
    }

    let handle = tokio::spawn(async move { coordinator.run_turn(turn, EventSink::disabled()).await });
    match handle.await {
        Ok(Ok(result)) => Ok(Json(result).into_response()),
        Ok(Err(err @ PipelineError::ModelHardFailure { .. })) => Err(AppError::Upstream(err.public_message())),
        Ok(Err(PipelineError::Cancelled)) => Err(AppError::Internal("turn cancelled".into())),
        Err(join_err) => {
            error!(error = %join_err, "turn task failed");
            Err(AppError::Internal("turn task failed".into()))
        }
    }
}
