use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info, warn};
use vigor::api::{self, app_state::AppState};
use vigor::config::loader::ConfigLoader;
use vigor::llm::create_client;
use vigor::observability::{
    AppMetrics, HealthCheckResult, ObservabilityState, create_observability_router, init_tracing,
};
use vigor::services::nutrition::StaticNutritionTable;
use vigor::voice::create_audio_service;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ConfigLoader::load().context("failed to load configuration")?;
    ConfigLoader::validate(&config).context("invalid configuration")?;

    // guard 需要活到进程结束，否则文件日志会丢失尾部
    let _log_guard = init_tracing(&config.logging).context("failed to initialize tracing")?;
    info!(app = %config.app_name, env = %config.environment, "Starting Vigor...");

    let client = create_client(&config.llm).context("failed to create model client")?;
    info!(model = %config.llm.text_model, "Model client initialized");

    let audio = create_audio_service(&config.llm).context("failed to create audio service")?;
    if audio.is_none() {
        warn!("llm.audio_url is empty, voice turns are disabled");
    }

    let metrics = Arc::new(AppMetrics::default());
    let nutrition = Arc::new(StaticNutritionTable::new());
    let app_state = AppState::new(config.clone(), client, nutrition, audio, metrics.clone());
    info!("Application state created");

    let observability_state = Arc::new(ObservabilityState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        metrics,
    ));
    let has_key = !config.llm.api_key().is_empty();
    observability_state
        .add_health_check(HealthCheckResult {
            name: "model_client".into(),
            healthy: has_key,
            message: if has_key {
                "api key configured".into()
            } else {
                format!("{} is not set, turns will run in fallback mode", config.llm.api_key_env)
            },
            latency_ms: 0,
        })
        .await;
    observability_state
        .add_health_check(HealthCheckResult {
            name: "voice".into(),
            healthy: true,
            message: if app_state.voice.is_some() { "enabled" } else { "disabled" }.into(),
            latency_ms: 0,
        })
        .await;

    spawn_sweeper(app_state.clone(), config.memory.sweep_interval_secs);

    let router = create_observability_router(observability_state).merge(api::create_router(app_state));
    info!("API router created with observability endpoints");

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server listening on {}", addr);

    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Server stopped");
    Ok(())
}

/// 后台定期清理过期会话与限流记录
fn spawn_sweeper(state: AppState, interval_secs: u64) {
    if interval_secs == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let sessions = state.coordinator.sweep();
            let clients = state.rate_limiter.sweep().await;
            debug!(sessions, clients, "sweep completed");
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
