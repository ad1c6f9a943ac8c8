//! 错误处理模块
//!
//! 定义应用程序的错误类型和错误处理逻辑。

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 应用程序错误类型
#[derive(Error, Debug)]
pub enum AppError {
    /// 参数验证错误
    #[error("参数验证失败: {0}")]
    Validation(String),

    /// 速率限制
    #[error("请求过于频繁，请稍后再试")]
    RateLimited,

    /// 上游模型服务错误（消息已脱敏）
    #[error("{0}")]
    Upstream(String),

    /// 功能未启用
    #[error("功能未启用: {0}")]
    Unavailable(String),

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),
}

/// Axum response implementation for AppError
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = (&self).into();
        let body = Json(ErrorResponse::new(&code, &self.to_string()));
        (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body,
        )
            .into_response()
    }
}

/// 错误响应
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// 错误代码
    pub code: String,
    /// 错误消息
    pub message: String,
    /// 详细信息
    pub details: Option<String>,
    /// 请求 ID
    pub request_id: Option<String>,
}

impl ErrorResponse {
    /// 创建新错误响应
    pub fn new(code: &str, message: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
            details: None,
            request_id: None,
        }
    }
}

/// HTTP 状态码映射
impl From<&AppError> for (u16, String) {
    fn from(err: &AppError) -> (u16, String) {
        match err {
            AppError::Validation(_) => (400, "BAD_REQUEST".to_string()),
            AppError::RateLimited => (429, "RATE_LIMITED".to_string()),
            AppError::Upstream(_) => (502, "UPSTREAM_UNAVAILABLE".to_string()),
            AppError::Unavailable(_) => (503, "SERVICE_UNAVAILABLE".to_string()),
            AppError::Internal(_) => (500, "INTERNAL_ERROR".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let (status, code): (u16, String) = (&AppError::RateLimited).into();
        assert_eq!(status, 429);
        assert_eq!(code, "RATE_LIMITED");

        let (status, _): (u16, String) = (&AppError::Upstream("down".into())).into();
        assert_eq!(status, 502);

        let (status, code): (u16, String) = (&AppError::Unavailable("voice".into())).into();
        assert_eq!(status, 503);
        assert_eq!(code, "SERVICE_UNAVAILABLE");

        let (status, _): (u16, String) = (&AppError::Internal("join".into())).into();
        assert_eq!(status, 500);
    }

    #[tokio::test]
    async fn test_into_response_body_shape() {
        let response = AppError::Validation("message is empty".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: ErrorResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.code, "BAD_REQUEST");
        assert!(body.message.contains("message is empty"));
        assert!(body.details.is_none());
    }
}
