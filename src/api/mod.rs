//! API 模块
//!
//! 对外 HTTP 接口：轮次提交（JSON / SSE）、会话状态查询和语音 WebSocket。

pub mod app_state;
pub mod dto;
pub mod handlers;
pub mod routes;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::api::app_state::AppState;
use crate::observability::metrics_middleware;
use crate::security::middleware::{rate_limit_middleware, security_headers_middleware};

/// 按配置构造 CORS 层，`*` 表示任意来源
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let values: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(values))
}

pub fn create_router(app_state: AppState) -> Router {
    let api = Router::new()
        .merge(routes::turn_routes::create_turn_router())
        .merge(routes::session_routes::create_session_router())
        .merge(routes::voice_routes::create_voice_router())
        .layer(axum::middleware::from_fn_with_state(
            app_state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(DefaultBodyLimit::max(app_state.config.server.max_request_size));

    Router::new()
        .nest("/api/v1", api)
        .layer(axum::middleware::from_fn(security_headers_middleware))
        .layer(axum::middleware::from_fn_with_state(
            app_state.metrics.clone(),
            metrics_middleware,
        ))
        .layer(cors_layer(&app_state.config.security.cors_allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}
