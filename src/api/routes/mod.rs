//! Routes 模块
//!
//! 定义 API 路由。

pub mod session_routes;
pub mod turn_routes;
pub mod voice_routes;
