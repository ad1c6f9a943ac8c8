//! 核心数据模型模块
//!
//! 定义会话、轮次、调度决策、流水线各阶段输出以及可穿戴数据快照。

pub mod agent;
pub mod profile;
pub mod route;
pub mod session;
pub mod wearable;

pub use agent::*;
pub use profile::*;
pub use route::*;
pub use session::*;
pub use wearable::*;
