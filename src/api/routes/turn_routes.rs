//! Turn Routes
//!
//! 定义轮次相关的 API 路由。

use axum::{Router, routing::post};

use crate::api::app_state::AppState;
use crate::api::handlers::turn_handler::*;

/// 创建轮次路由器
pub fn create_turn_router() -> Router<AppState> {
    Router::new().route("/turns", post(create_turn))
}
