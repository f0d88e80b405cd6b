//! agent-relay - 多通道智能体消息中继
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、策略选择与失败计数、降级路由器、会话注册表
//! - **credentials**: AuthBundle 与加密凭据存储
//! - **observability**: tracing 日志初始化
//! - **streaming**: 流式响应适配（分片 → 单一终止事件）
//! - **transport**: 传输接口与三种实现（持久会话 / 令牌会话 / 浏览器自动化）

pub mod config;
pub mod core;
pub mod credentials;
pub mod observability;
pub mod streaming;
pub mod transport;

pub use crate::core::{Router, RouterError, SessionRegistry, Strategy};
pub use crate::streaming::StreamHandlers;
