//! Security Module
//!
//! 按调用方身份限流，以及统一的安全响应头。

pub mod middleware;
pub mod rate_limit;

pub use middleware::{rate_limit_middleware, security_headers_middleware};
pub use rate_limit::{ClientIdentity, RateLimitConfig, RateLimitInfo, RateLimitResult, RateLimiter};
