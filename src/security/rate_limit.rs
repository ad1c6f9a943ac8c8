//! Rate Limiting Module
//!
//! 按调用方身份（API Key → 转发 IP → 对端地址）做滑动窗口限流：
//! 每秒突发、每分钟、每小时三个窗口，任一超限即拒绝。

use axum::extract::ConnectInfo;
use axum::http::Request;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::config::SecurityConfig;

/// Rate limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    /// 一秒内允许的突发请求数
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 30,
            requests_per_hour: 600,
            burst_size: 10,
        }
    }
}

impl From<&SecurityConfig> for RateLimitConfig {
    fn from(config: &SecurityConfig) -> Self {
        Self {
            requests_per_minute: config.requests_per_minute,
            requests_per_hour: config.requests_per_hour,
            burst_size: config.burst_size,
        }
    }
}

/// Rate limit information
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub window: String,
}

/// Rate limit result
#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitResult {
    /// 未启用限流
    Unlimited,
    Allowed(RateLimitInfo),
    Limited {
        /// 距离可重试的秒数
        retry_after: u64,
        limit: RateLimitInfo,
    },
}

/// 调用方身份
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum ClientIdentity {
    ApiKey(String),
    ForwardedIp(String),
    Peer(String),
    Anonymous,
}

impl ClientIdentity {
    pub fn from_request<B>(req: &Request<B>) -> Self {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        if let Some(key) = header("x-api-key") {
            return ClientIdentity::ApiKey(key.to_string());
        }
        if let Some(key) = header("authorization").and_then(|a| a.strip_prefix("Bearer ")) {
            return ClientIdentity::ApiKey(key.trim().to_string());
        }
        if let Some(forwarded) = header("x-forwarded-for")
            && let Some(first) = forwarded.split(',').map(str::trim).find(|ip| !ip.is_empty())
        {
            return ClientIdentity::ForwardedIp(first.to_string());
        }
        if let Some(ip) = header("x-real-ip") {
            return ClientIdentity::ForwardedIp(ip.to_string());
        }
        if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
            return ClientIdentity::Peer(addr.ip().to_string());
        }
        ClientIdentity::Anonymous
    }

    /// 限流表中的键
    pub fn key(&self) -> String {
        match self {
            ClientIdentity::ApiKey(k) => format!("key:{}", k),
            ClientIdentity::ForwardedIp(ip) => format!("ip:{}", ip),
            ClientIdentity::Peer(ip) => format!("peer:{}", ip),
            ClientIdentity::Anonymous => "anonymous".to_string(),
        }
    }
}

/// In-memory rate limiter using sliding windows
#[derive(Debug, Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    history: Arc<RwLock<HashMap<String, VecDeque<DateTime<Utc>>>>>,
    enabled: bool,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, enabled: bool) -> Self {
        Self {
            config,
            history: Arc::new(RwLock::new(HashMap::new())),
            enabled,
        }
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self::new(RateLimitConfig::from(config), config.rate_limit_enabled)
    }

    pub fn disabled() -> Self {
        Self::new(RateLimitConfig::default(), false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn check(&self, client: &ClientIdentity) -> RateLimitResult {
        self.check_at(client, Utc::now()).await
    }

    /// 检查并记录一次请求
    pub async fn check_at(&self, client: &ClientIdentity, now: DateTime<Utc>) -> RateLimitResult {
        if !self.enabled {
            return RateLimitResult::Unlimited;
        }

        let mut history = self.history.write().await;
        let stamps = history.entry(client.key()).or_default();
        let hour_cutoff = now - Duration::hours(1);
        while stamps.front().is_some_and(|t| *t <= hour_cutoff) {
            stamps.pop_front();
        }

        let windows = [
            ("second", Duration::seconds(1), self.config.burst_size),
            ("minute", Duration::minutes(1), self.config.requests_per_minute),
            ("hour", Duration::hours(1), self.config.requests_per_hour),
        ];

        for (name, span, limit) in windows {
            let cutoff = now - span;
            let in_window: Vec<&DateTime<Utc>> = stamps.iter().filter(|t| **t > cutoff).collect();
            if limit > 0 && in_window.len() >= limit as usize {
                // 窗口内最早的请求滑出后即可重试
                let reset_at = *in_window[0] + span;
                let retry_after = (reset_at - now).num_milliseconds().max(0) as u64;
                return RateLimitResult::Limited {
                    retry_after: retry_after.div_ceil(1000).max(1),
                    limit: RateLimitInfo {
                        limit,
                        remaining: 0,
                        reset_at,
                        window: name.to_string(),
                    },
                };
            }
        }

        let minute_cutoff = now - Duration::minutes(1);
        let used = stamps.iter().filter(|t| **t > minute_cutoff).count() as u32;
        stamps.push_back(now);

        RateLimitResult::Allowed(RateLimitInfo {
            limit: self.config.requests_per_minute,
            remaining: self.config.requests_per_minute.saturating_sub(used + 1),
            reset_at: now + Duration::minutes(1),
            window: "minute".to_string(),
        })
    }

    /// 清理一小时内没有请求的调用方
    pub async fn sweep(&self) -> usize {
        let cutoff = Utc::now() - Duration::hours(1);
        let mut history = self.history.write().await;
        let before = history.len();
        history.retain(|_, stamps| stamps.back().is_some_and(|t| *t > cutoff));
        before - history.len()
    }

    pub async fn tracked_clients(&self) -> usize {
        self.history.read().await.len()
    }
}
