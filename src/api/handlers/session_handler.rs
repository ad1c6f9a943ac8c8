use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use tracing::debug;

use crate::{
    api::{
        app_state::AppState,
        dto::{session_dto::SessionStateResponse, turn_dto::validate_session_id},
    },
    error::AppError,
};

/// 只读会话状态，不会创建会话
pub async fn get_session_state(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    validate_session_id(&session_id)?;
    debug!(session_id = %session_id, "reading session state");

    let snapshot = state.coordinator.session_state(&session_id);
    Ok(Json(SessionStateResponse::from(snapshot)))
}
