use crate::config::config::AppConfig;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use std::path::PathBuf;

/// 环境变量前缀
const ENV_PREFIX: &str = "VIGOR_";

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从默认路径加载配置
    ///
    /// 合并顺序：
    /// 1. 开发环境默认值
    /// 2. ./vigor.toml（可选）
    /// 3. 环境变量（`VIGOR_` 前缀，`__` 分隔层级）
    pub fn load() -> Result<AppConfig, figment::Error> {
        Self::load_from(default_config_path())
    }

    /// 从指定路径加载配置
    pub fn load_from(path: PathBuf) -> Result<AppConfig, figment::Error> {
        Self::figment(path).extract()
    }

    fn figment(path: PathBuf) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::development()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// 验证配置
    pub fn validate(config: &AppConfig) -> Result<(), ConfigValidationError> {
        if config.server.port == 0 {
            return Err(ConfigValidationError::InvalidPort);
        }

        if config.llm.text_model.trim().is_empty() {
            return Err(ConfigValidationError::MissingTextModel);
        }

        if config.memory.history_cap == 0 {
            return Err(ConfigValidationError::InvalidHistoryCap);
        }

        let scoring = &config.scoring;
        if scoring.floor > 100 || scoring.emergency_floor > scoring.floor {
            return Err(ConfigValidationError::InvalidScoreFloor);
        }
        // 紧急下限之后的下一轮必须能够回到安全下限以内
        if u16::from(scoring.emergency_floor) + u16::from(scoring.max_rise) < u16::from(scoring.floor) {
            return Err(ConfigValidationError::InvalidScoreFloor);
        }

        if config.voice.input_sample_rate == 0 || config.voice.chunk_ms == 0 {
            return Err(ConfigValidationError::InvalidVoiceFormat);
        }

        Ok(())
    }
}

/// 配置验证错误
#[derive(thiserror::Error, Debug)]
pub enum ConfigValidationError {
    #[error("服务端口无效，必须大于 0")]
    InvalidPort,

    #[error("文本模型未配置")]
    MissingTextModel,

    #[error("历史轮次上限必须大于 0")]
    InvalidHistoryCap,

    #[error("能量分数下限配置无效")]
    InvalidScoreFloor,

    #[error("语音采样率或分片时长无效")]
    InvalidVoiceFormat,
}

/// 获取默认配置文件路径
pub fn default_config_path() -> PathBuf {
    PathBuf::from("vigor.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_development_config_is_valid() {
        let config = AppConfig::development();
        assert!(ConfigLoader::validate(&config).is_ok());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = ConfigLoader::load_from(PathBuf::from("does-not-exist.toml")).unwrap();
        assert_eq!(config.memory.history_cap, 20);
        assert_eq!(config.voice.chunk_ms, 32);
    }

    #[test]
    fn test_rejects_unreachable_floor() {
        let mut config = AppConfig::development();
        config.scoring.emergency_floor = 0;
        config.scoring.max_rise = 5;
        config.scoring.floor = 30;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigValidationError::InvalidScoreFloor)
        ));
    }

    #[test]
    fn test_rejects_zero_history_cap() {
        let mut config = AppConfig::development();
        config.memory.history_cap = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigValidationError::InvalidHistoryCap)
        ));
    }

    #[test]
    fn test_production_enables_rate_limit() {
        let config = AppConfig::production();
        assert!(config.security.rate_limit_enabled);
        assert!(config.logging.structured);
    }
}
