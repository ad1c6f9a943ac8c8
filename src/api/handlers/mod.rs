//! Handlers 模块
//!
//! HTTP 请求处理程序。

pub mod session_handler;
pub mod turn_handler;
pub mod voice_handler;

pub use session_handler::*;
pub use turn_handler::*;
pub use voice_handler::*;
