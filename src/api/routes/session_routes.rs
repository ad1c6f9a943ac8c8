//! Session Routes

use axum::{Router, routing::get};

use crate::api::app_state::AppState;
use crate::api::handlers::session_handler::*;

/// 创建会话路由器
pub fn create_session_router() -> Router<AppState> {
    Router::new().route("/sessions/:session_id/state", get(get_session_state))
}
