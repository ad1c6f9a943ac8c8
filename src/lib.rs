//! Vigor - 健康教练对话编排服务
//!
//! 把对外部大语言模型服务的多次调用（意图分流、分析、规划、校验、回复生成）
//! 编排成一条连贯的回复，维护有界的会话记忆，在模型配额耗尽时降级为规则引擎，
//! 并以有序事件流（SSE）和双向语音事件协议向客户端输出。

pub mod api;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod observability;
pub mod security;
pub mod services;
pub mod streaming;
pub mod voice;
