//! 轮次 DTO

use serde::Deserialize;

use crate::error::AppError;
use crate::models::profile::UserContext;
use crate::models::session::ImageAttachment;
use crate::models::wearable::WearableInput;
use crate::services::coordinator::TurnRequest;

/// 单条消息最大字符数
pub const MAX_MESSAGE_CHARS: usize = 4_000;
/// 图片 base64 最大长度（约 5 MB 原始数据）
pub const MAX_IMAGE_BASE64_LEN: usize = 7_000_000;
const MAX_SESSION_ID_LEN: usize = 128;

/// 提交轮次请求
#[derive(Debug, Deserialize)]
pub struct CreateTurnRequest {
    pub session_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub image: Option<ImageAttachment>,
    #[serde(default)]
    pub user_context: Option<UserContext>,
    #[serde(default)]
    pub wearable: Option<WearableInput>,
    /// true 时以 SSE 返回事件流
    #[serde(default)]
    pub streaming: bool,
}

/// 会话 ID：1..=128 个字母、数字、`-`、`_`、`.`、`:`
pub fn validate_session_id(session_id: &str) -> Result<(), AppError> {
    if session_id.is_empty() || session_id.len() > MAX_SESSION_ID_LEN {
        return Err(AppError::Validation(format!(
            "session_id must be 1..={} characters",
            MAX_SESSION_ID_LEN
        )));
    }
    if !session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(AppError::Validation("session_id contains invalid characters".into()));
    }
    Ok(())
}

impl CreateTurnRequest {
    pub fn validate(&self) -> Result<(), AppError> {
        validate_session_id(&self.session_id)?;
        if self.message.chars().count() > MAX_MESSAGE_CHARS {
            return Err(AppError::Validation(format!(
                "message exceeds {} characters",
                MAX_MESSAGE_CHARS
            )));
        }
        if let Some(image) = &self.image {
            if !image.media_type.starts_with("image/") {
                return Err(AppError::Validation("image.media_type must be an image type".into()));
            }
            if image.data.is_empty() || image.data.len() > MAX_IMAGE_BASE64_LEN {
                return Err(AppError::Validation("image.data must be non-empty base64 under 5 MB".into()));
            }
        }
        Ok(())
    }

    pub fn into_request(self) -> TurnRequest {
        TurnRequest {
            session_id: self.session_id,
            message: self.message,
            feedback: self.feedback,
            image: self.image,
            user_context: self.user_context,
            wearable: self.wearable,
        }
    }
}
