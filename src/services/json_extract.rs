//! 从模型自由文本中提取 JSON
//!
//! 先严格解析整段文本；失败则取第一个括号平衡的 `{...}` 子串再解析。
//! 字段缺省值由目标类型的 `#[serde(default)]` 提供。

use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ExtractError {
    #[error("no JSON object found in model output")]
    NotFound,

    #[error("JSON object did not match schema: {0}")]
    Schema(String),
}

/// 第一个括号平衡的对象子串（忽略字符串字面量中的括号）
pub fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// 解析为目标类型
pub fn extract_json<T: DeserializeOwned>(text: &str) -> Result<T, ExtractError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<T>(trimmed) {
        return Ok(value);
    }

    let candidate = first_balanced_object(trimmed).ok_or(ExtractError::NotFound)?;
    serde_json::from_str::<T>(candidate).map_err(|e| ExtractError::Schema(e.to_string()))
}
