use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::models::route::DispatchRoute;

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// 服务地址
    pub host: String,
    /// 服务端口
    pub port: u16,
    /// 最大请求体大小（字节）
    pub max_request_size: usize,
}

/// LLM 推理服务配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LlmConfig {
    /// OpenAI 兼容接口地址
    pub base_url: String,
    /// 存放 API 密钥的环境变量名
    pub api_key_env: String,
    /// 文本/视觉/工具调用模型
    pub text_model: String,
    /// 双向语音模型
    pub audio_model: String,
    /// 语音双工流地址（为空则禁用语音）
    pub audio_url: String,
    /// 单次调用超时（毫秒）
    pub timeout_ms: u64,
    /// 瞬时错误最大重试次数
    pub max_retries: u32,
    /// 线性退避步长（毫秒）
    pub retry_backoff_ms: u64,
    /// 工具调用最大轮数
    pub max_tool_rounds: u32,
}

impl LlmConfig {
    /// 读取 API 密钥，未设置时返回空字符串
    pub fn api_key(&self) -> String {
        std::env::var(&self.api_key_env).unwrap_or_default()
    }
}

/// 单个阶段/路由的采样预算
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Budget {
    /// 最大输出 token
    pub max_tokens: u32,
    /// 采样温度
    pub temperature: f32,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
        }
    }
}

impl Budget {
    pub const fn new(max_tokens: u32, temperature: f32) -> Self {
        Self {
            max_tokens,
            temperature,
        }
    }
}

/// 各阶段与各路由的预算
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub classifier: Budget,
    pub analyzer: Budget,
    pub planner: Budget,
    pub greeting: Budget,
    pub quick: Budget,
    pub followup: Budget,
    pub photo: Budget,
    pub full: Budget,
    pub offtopic: Budget,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            classifier: Budget::new(120, 0.0),
            analyzer: Budget::new(600, 0.2),
            planner: Budget::new(900, 0.4),
            greeting: Budget::new(150, 0.8),
            quick: Budget::new(200, 0.7),
            followup: Budget::new(600, 0.6),
            photo: Budget::new(900, 0.6),
            full: Budget::new(900, 0.6),
            offtopic: Budget::new(200, 0.3),
        }
    }
}

impl BudgetConfig {
    /// Composer 使用的路由预算
    pub fn composer(&self, route: DispatchRoute) -> Budget {
        match route {
            DispatchRoute::Greeting => self.greeting,
            DispatchRoute::Quick => self.quick,
            DispatchRoute::Followup => self.followup,
            DispatchRoute::Photo => self.photo,
            DispatchRoute::Full => self.full,
            DispatchRoute::Offtopic => self.offtopic,
        }
    }
}

/// 会话记忆配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// 历史轮次上限
    pub history_cap: usize,
    /// 适应性备注上限
    pub note_cap: usize,
    /// 用户事实上限
    pub fact_cap: usize,
    /// 会话空闲过期时间（秒）
    pub session_ttl_secs: u64,
    /// 后台清理间隔（秒），0 表示只在每轮开始时清理
    pub sweep_interval_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            history_cap: 20,
            note_cap: 10,
            fact_cap: 20,
            session_ttl_secs: 3600,
            sweep_interval_secs: 300,
        }
    }
}

/// 能量分数稳定化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// 相对上一轮的最大上升
    pub max_rise: u8,
    /// 相对上一轮的最大下降
    pub max_drop: u8,
    /// 明确好转时放宽的上升幅度
    pub widened_rise: u8,
    /// 明确恶化时放宽的下降幅度
    pub widened_drop: u8,
    /// 安全下限
    pub floor: u8,
    /// 紧急情况下的下限
    pub emergency_floor: u8,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            max_rise: 15,
            max_drop: 20,
            widened_rise: 40,
            widened_drop: 45,
            floor: 20,
            emergency_floor: 5,
        }
    }
}

/// 安全配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    /// Rate limiting 启用
    pub rate_limit_enabled: bool,
    /// 单个调用方每分钟请求数
    pub requests_per_minute: u32,
    /// 单个调用方每小时请求数
    pub requests_per_hour: u32,
    /// 突发容量
    pub burst_size: u32,
    /// CORS 允许的来源
    pub cors_allowed_origins: Vec<String>,
}

/// 语音配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// 输入采样率
    pub input_sample_rate: u32,
    /// 输出采样率
    pub output_sample_rate: u32,
    /// 每个音频分片的时长（毫秒）
    pub chunk_ms: u32,
    /// 语音音色
    pub voice_id: String,
    /// 单轮语音超时（秒）
    pub turn_timeout_secs: u64,
    /// 单轮最大输入音频（字节）
    pub max_input_bytes: usize,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            chunk_ms: 32,
            voice_id: "matthew".into(),
            turn_timeout_secs: 60,
            max_input_bytes: 16_000 * 2 * 60,
        }
    }
}

/// 可穿戴数据配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WearableConfig {
    /// 调用方未提供数据时，按会话键合成模拟数据
    pub mock_enabled: bool,
}

impl Default for WearableConfig {
    fn default() -> Self {
        Self { mock_enabled: true }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别
    pub level: String,
    /// 结构化日志格式
    pub structured: bool,
    /// 日志文件目录
    pub log_dir: Option<PathBuf>,
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// 服务器配置
    pub server: ServerConfig,
    /// LLM 配置
    pub llm: LlmConfig,
    /// 预算配置
    pub budgets: BudgetConfig,
    /// 会话记忆配置
    pub memory: MemoryConfig,
    /// 分数稳定化配置
    pub scoring: ScoringConfig,
    /// 安全配置
    pub security: SecurityConfig,
    /// 语音配置
    pub voice: VoiceConfig,
    /// 可穿戴数据配置
    pub wearable: WearableConfig,
    /// 日志配置
    pub logging: LoggingConfig,
    /// 应用名称
    pub app_name: String,
    /// 环境
    pub environment: String,
}

impl AppConfig {
    /// 创建开发环境配置
    pub fn development() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".into(),
                port: 8080,
                max_request_size: 10 * 1024 * 1024,
            },
            llm: LlmConfig {
                base_url: "https://api.openai.com".into(),
                api_key_env: "VIGOR_LLM_API_KEY".into(),
                text_model: "gpt-4o-mini".into(),
                audio_model: "speech-duplex-v1".into(),
                audio_url: String::new(),
                timeout_ms: 30_000,
                max_retries: 2,
                retry_backoff_ms: 500,
                max_tool_rounds: 2,
            },
            budgets: BudgetConfig::default(),
            memory: MemoryConfig::default(),
            scoring: ScoringConfig::default(),
            security: SecurityConfig {
                rate_limit_enabled: false,
                requests_per_minute: 30,
                requests_per_hour: 600,
                burst_size: 10,
                cors_allowed_origins: vec!["http://localhost:3000".into()],
            },
            voice: VoiceConfig::default(),
            wearable: WearableConfig::default(),
            logging: LoggingConfig {
                level: "debug".into(),
                structured: false,
                log_dir: None,
            },
            app_name: "vigor".into(),
            environment: "development".into(),
        }
    }

    /// 创建生产环境配置
    pub fn production() -> Self {
        let mut config = Self::development();
        config.environment = "production".into();
        config.logging.level = "info".into();
        config.logging.structured = true;
        config.security.rate_limit_enabled = true;
        config
    }
}
