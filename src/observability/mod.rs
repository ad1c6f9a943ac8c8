//! 可观测性模块
//!
//! 提供 Prometheus 文本指标、结构化日志和健康检查。

use axum::{Json, Router, response::IntoResponse, routing::get};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::config::LoggingConfig;

// ===== Metrics =====

/// 应用指标
#[derive(Default)]
pub struct AppMetrics {
    pub http_requests_total: AtomicU64,
    pub http_request_duration_sum: AtomicU64,
    pub active_connections: AtomicUsize,
    pub sessions_active: AtomicUsize,
    pub turns_total: AtomicU64,
    pub voice_turns_total: AtomicU64,
    pub fallback_activations_total: AtomicU64,
    pub replans_total: AtomicU64,
    pub classification_failures_total: AtomicU64,
    pub stream_fallbacks_total: AtomicU64,
    pub stream_disconnects_total: AtomicU64,
    pub errors_total: AtomicU64,
}

impl AppMetrics {
    /// 记录 HTTP 请求
    pub fn record_http_request(&self, duration_ms: u64) {
        self.http_requests_total.fetch_add(1, Ordering::Relaxed);
        self.http_request_duration_sum.fetch_add(duration_ms, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    /// 设置当前活跃会话数
    pub fn set_sessions_active(&self, count: usize) {
        self.sessions_active.store(count, Ordering::Relaxed);
    }

    pub fn record_turn(&self) {
        self.turns_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_voice_turn(&self) {
        self.voice_turns_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallback_activations_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replan(&self) {
        self.replans_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_classification_failure(&self) {
        self.classification_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stream_fallback(&self) {
        self.stream_fallbacks_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.stream_disconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录错误
    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// 生成 Prometheus 格式指标
    pub fn gather(&self) -> String {
        let counter = |name: &str, help: &str, value: u64| {
            format!("# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n")
        };
        let gauge = |name: &str, help: &str, value: usize| {
            format!("# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n")
        };
        let requests = self.http_requests_total.load(Ordering::Relaxed);

        let mut out = String::new();
        out.push_str(&counter("http_requests_total", "Total HTTP requests", requests));
        out.push_str(&format!(
            "# HELP http_request_duration_seconds HTTP request duration in seconds\n\
# TYPE http_request_duration_seconds summary\n\
http_request_duration_seconds_sum {}\n\
http_request_duration_seconds_count {}\n",
            self.http_request_duration_sum.load(Ordering::Relaxed) as f64 / 1000.0,
            requests
        ));
        out.push_str(&gauge(
            "active_connections",
            "Active HTTP connections",
            self.active_connections.load(Ordering::Relaxed),
        ));
        out.push_str(&gauge(
            "sessions_active",
            "Sessions held in memory",
            self.sessions_active.load(Ordering::Relaxed),
        ));
        out.push_str(&counter("turns_total", "Total text turns", self.turns_total.load(Ordering::Relaxed)));
        out.push_str(&counter(
            "voice_turns_total",
            "Total voice turns",
            self.voice_turns_total.load(Ordering::Relaxed),
        ));
        out.push_str(&counter(
            "fallback_activations_total",
            "Turns switched to the rule-based fallback engine",
            self.fallback_activations_total.load(Ordering::Relaxed),
        ));
        out.push_str(&counter(
            "replans_total",
            "Plans regenerated after a validation conflict",
            self.replans_total.load(Ordering::Relaxed),
        ));
        out.push_str(&counter(
            "classification_failures_total",
            "Dispatcher classifications that fell back to the default route",
            self.classification_failures_total.load(Ordering::Relaxed),
        ));
        out.push_str(&counter(
            "stream_fallbacks_total",
            "Streaming compositions retried in whole-response mode",
            self.stream_fallbacks_total.load(Ordering::Relaxed),
        ));
        out.push_str(&counter(
            "stream_disconnects_total",
            "Turns cancelled by a client disconnect",
            self.stream_disconnects_total.load(Ordering::Relaxed),
        ));
        out.push_str(&counter("errors_total", "Total errors", self.errors_total.load(Ordering::Relaxed)));
        out
    }
}

// ===== Health Check =====

/// 健康检查状态
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: String,
    pub version: String,
    pub uptime_seconds: f64,
    pub checks: Vec<HealthCheck>,
}

/// 单个健康检查项
#[derive(Debug, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: String,
    pub message: Option<String>,
    pub latency_ms: Option<u64>,
}

/// 健康检查结果
#[derive(Clone)]
pub struct HealthCheckResult {
    pub name: String,
    pub healthy: bool,
    pub message: String,
    pub latency_ms: u64,
}

/// 可观测性状态
#[derive(Clone)]
pub struct ObservabilityState {
    pub metrics: Arc<AppMetrics>,
    pub health_checks: Arc<Mutex<Vec<HealthCheckResult>>>,
    pub start_time: DateTime<Utc>,
    pub version: String,
}

impl ObservabilityState {
    pub fn new(version: String, metrics: Arc<AppMetrics>) -> Self {
        Self {
            metrics,
            health_checks: Arc::new(Mutex::new(Vec::new())),
            start_time: Utc::now(),
            version,
        }
    }

    /// 添加健康检查结果，只保留最近 10 条
    pub async fn add_health_check(&self, result: HealthCheckResult) {
        let mut checks = self.health_checks.lock().await;
        checks.retain(|c| c.name != result.name);
        checks.push(result);
        if checks.len() > 10 {
            checks.remove(0);
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        (Utc::now() - self.start_time).num_seconds() as f64
    }
}

// ===== Health Check Handlers =====

/// 获取完整健康状态
pub async fn health_check(state: axum::extract::State<Arc<ObservabilityState>>) -> impl IntoResponse {
    let checks = state.health_checks.lock().await;
    let all_healthy = checks.iter().all(|c| c.healthy);

    let health_status = HealthStatus {
        status: if all_healthy { "healthy" } else { "unhealthy" }.to_string(),
        timestamp: Utc::now().to_rfc3339(),
        version: state.version.clone(),
        uptime_seconds: state.uptime_seconds(),
        checks: checks
            .iter()
            .map(|c| HealthCheck {
                name: c.name.clone(),
                status: if c.healthy { "healthy" } else { "unhealthy" }.to_string(),
                message: Some(c.message.clone()),
                latency_ms: Some(c.latency_ms),
            })
            .collect(),
    };

    let status_code = if all_healthy {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health_status))
}

/// 简单存活检查
pub async fn liveness() -> impl IntoResponse {
    "OK"
}

/// 就绪检查
pub async fn readiness(state: axum::extract::State<Arc<ObservabilityState>>) -> impl IntoResponse {
    let checks = state.health_checks.lock().await;
    if checks.iter().all(|c| c.healthy) {
        (axum::http::StatusCode::OK, "Ready")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "Not Ready")
    }
}

/// Prometheus 指标端点
pub async fn metrics(state: axum::extract::State<Arc<ObservabilityState>>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.gather(),
    )
}

/// 版本信息端点
pub async fn version(state: axum::extract::State<Arc<ObservabilityState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "version": state.version,
        "uptime_seconds": state.uptime_seconds(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// 创建可观测性路由
pub fn create_observability_router(state: Arc<ObservabilityState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/metrics", get(metrics))
        .route("/version", get(version))
        .with_state(state)
}

// ===== Structured Logging =====

/// 初始化日志
///
/// `RUST_LOG` 优先于配置的级别。配置了 `log_dir` 时额外写入按天滚动的 JSON 日志文件，
/// 返回的 guard 需要持有到进程退出。
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<WorkerGuard>, TryInitError> {
    let level = if config.level.is_empty() { "info" } else { config.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("{},vigor={}", level, level)));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "vigor.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().json().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if config.structured {
        registry.with(fmt::layer().json().with_target(true)).try_init()?;
    } else {
        registry
            .with(fmt::layer().with_target(true).with_line_number(true))
            .try_init()?;
    }

    Ok(guard)
}

// ===== Request Metrics Middleware =====

/// 记录请求指标的中间件
pub async fn metrics_middleware(
    axum::extract::State(metrics): axum::extract::State<Arc<AppMetrics>>,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let start = std::time::Instant::now();
    metrics.connection_opened();

    let response = next.run(req).await;

    metrics.record_http_request(start.elapsed().as_millis() as u64);
    metrics.connection_closed();
    // 502 由流水线自己计数
    let status = response.status();
    if status.is_server_error() && status != axum::http::StatusCode::BAD_GATEWAY {
        metrics.record_error();
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_gather() {
        let metrics = AppMetrics::default();
        metrics.record_http_request(100);
        metrics.connection_opened();
        metrics.record_fallback();
        metrics.record_replan();
        metrics.record_error();

        let output = metrics.gather();
        assert!(output.contains("http_requests_total 1"));
        assert!(output.contains("active_connections 1"));
        assert!(output.contains("fallback_activations_total 1"));
        assert!(output.contains("replans_total 1"));
        assert!(output.contains("errors_total 1"));
    }

    #[test]
    fn test_connection_gauge_does_not_underflow() {
        let metrics = AppMetrics::default();
        metrics.connection_closed();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_health_checks_replace_by_name() {
        let state = ObservabilityState::new("0.1.0".into(), Arc::new(AppMetrics::default()));
        for healthy in [false, true] {
            state
                .add_health_check(HealthCheckResult {
                    name: "llm".into(),
                    healthy,
                    message: String::new(),
                    latency_ms: 1,
                })
                .await;
        }
        let checks = state.health_checks.lock().await;
        assert_eq!(checks.len(), 1);
        assert!(checks[0].healthy);
    }
}
