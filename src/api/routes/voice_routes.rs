use axum::{Router, routing::get};

use crate::api::app_state::AppState;
use crate::api::handlers::voice_handler::voice_ws_handler;

/// 语音 WebSocket 路由
pub fn create_voice_router() -> Router<AppState> {
    Router::new().route("/voice/:session_id", get(voice_ws_handler))
}
