use std::sync::Arc;

use crate::config::config::AppConfig;
use crate::llm::LlmClient;
use crate::observability::AppMetrics;
use crate::security::rate_limit::RateLimiter;
use crate::services::coordinator::Coordinator;
use crate::services::memory_store::SessionMemoryStore;
use crate::services::nutrition::NutritionProvider;
use crate::voice::{AudioModelService, VoicePipeline};

/// Application state containing all shared services
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    /// 文本流水线
    pub coordinator: Arc<Coordinator>,
    /// 未配置语音服务时为 `None`
    pub voice: Option<Arc<VoicePipeline>>,
    pub memory: Arc<SessionMemoryStore>,
    pub metrics: Arc<AppMetrics>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("app_name", &self.config.app_name)
            .field("coordinator", &"Arc<Coordinator>")
            .field("voice", &self.voice.is_some())
            .field("sessions", &self.memory.session_count())
            .field("rate_limiter", &self.rate_limiter)
            .finish()
    }
}

impl AppState {
    pub fn new(
        config: AppConfig,
        client: Arc<dyn LlmClient>,
        nutrition: Arc<dyn NutritionProvider>,
        audio: Option<Arc<dyn AudioModelService>>,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        let memory = Arc::new(SessionMemoryStore::new(config.memory.clone()));
        let coordinator = Arc::new(Coordinator::new(
            &config,
            client,
            nutrition,
            memory.clone(),
            metrics.clone(),
        ));
        let voice = audio.map(|service| {
            Arc::new(VoicePipeline::new(
                service,
                memory.clone(),
                coordinator.session_locks(),
                metrics.clone(),
                config.voice.clone(),
                config.budgets.full,
            ))
        });
        let rate_limiter = Arc::new(RateLimiter::from_config(&config.security));

        Self {
            config: Arc::new(config),
            coordinator,
            voice,
            memory,
            metrics,
            rate_limiter,
        }
    }
}
