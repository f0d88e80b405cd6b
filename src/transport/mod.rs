//! 传输层：三种投递策略的统一能力接口
//!
//! - **session**: 持久 WebSocket 会话（Cookie 认证，primary）
//! - **token**: 令牌 WebSocket 会话（clientId / sessionId / tokenCluster）
//! - **browser**: 浏览器自动化（无原生流式，整段结果一次交付）
//!
//! Router 只依赖 `Transport` trait。

pub mod browser;
#[cfg(feature = "browser")]
pub mod chrome;
pub mod factory;
pub mod mock;
pub mod session;
pub mod socket;
pub mod token;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{ConnectError, SendError, Strategy, TransportError, WaitError};
use crate::credentials::AuthBundle;
use crate::streaming::StreamHandlers;

pub use browser::{BrowserTransport, PageDriver};
#[cfg(feature = "browser")]
pub use chrome::ChromeDriver;
pub use factory::{DefaultTransportFactory, TransportFactory};
pub use session::SessionDialect;
pub use socket::{Dialect, Inbound, ReconnectPolicy, SocketTransport};
pub use token::TokenDialect;

/// 请求标识：进程内唯一，永不复用
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(1);

impl RequestId {
    pub fn generate() -> Self {
        let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(format!("req-{seq}-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// 连接状态机
///
/// `Disconnected → Connecting → Handshaking → Connected → {Error, BackingOff, Disconnected}`；
/// `BackingOff` 仅出现在支持自动重连的 socket 传输中，`Error` 需重新 `connect()` 才能离开。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    BackingOff,
    Error,
}

impl ConnectionState {
    /// 是否允许发起新的连接
    pub fn can_connect(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Error)
    }
}

/// 传输能力接口
#[async_trait]
pub trait Transport: Send + Sync {
    fn strategy(&self) -> Strategy;

    /// 建立会话；已连接时幂等
    async fn connect(&self) -> Result<(), ConnectError>;

    /// 登记并发送请求，立即返回请求 ID；未连接时先尝试隐式连接
    async fn send_message(
        &self,
        text: &str,
        handlers: StreamHandlers,
    ) -> Result<RequestId, SendError>;

    /// 等待请求完成；超时后结果被丢弃、登记被清理
    async fn wait_for_response(
        &self,
        id: &RequestId,
        timeout: Duration,
    ) -> Result<String, WaitError>;

    /// 释放会话资源，重复调用无副作用
    async fn close(&self) -> Result<(), TransportError>;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// 提取本次会话观察到的凭据（仅浏览器策略提供）
    async fn extract_auth_data(&self) -> Option<AuthBundle> {
        None
    }
}
