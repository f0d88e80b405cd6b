//! 错误类型
//!
//! 传输层错误（连接 / 发送 / 等待）在 Router 内部被吸收，转为失败计数与降级；
//! 只有 `RouterError::AllStrategiesFailed` 会到达调用方。

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::core::strategy::Strategy;
use crate::transport::RequestId;

/// 建立会话失败（不可达、握手被拒、缺少凭据等）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    /// 正处于 Connecting / Handshaking / BackingOff，不允许重入
    #[error("connection attempt already in progress")]
    InProgress,

    #[error("strategy unavailable: {0}")]
    Unavailable(String),
}

/// 连接建立后发送失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("transmit failed: {0}")]
    Transmit(String),
}

/// 等待响应失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("no terminal event within {0:?}")]
    Timeout(Duration),

    #[error("unknown request id {0}")]
    NotFound(RequestId),

    #[error("request failed: {0}")]
    Failed(String),
}

/// 传输层错误汇总（Router 记录单次尝试失败原因时使用）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error("empty response")]
    EmptyResponse,

    #[error("close failed: {0}")]
    Close(String),
}

/// 单个策略在一次调用中的失败记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyFailure {
    pub strategy: Strategy,
    pub error: TransportError,
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.strategy, self.error)
    }
}

/// Router 对调用方暴露的唯一失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("all strategies failed ({})", join_failures(.attempts))]
    AllStrategiesFailed { attempts: Vec<StrategyFailure> },
}

impl RouterError {
    /// 本次调用中各策略的失败记录（按尝试顺序）
    pub fn attempts(&self) -> &[StrategyFailure] {
        match self {
            RouterError::AllStrategiesFailed { attempts } => attempts,
        }
    }
}

/// 凭据存储错误
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("credential file I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential serialization: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    /// 密钥错误或文件被篡改
    #[error("decryption failed: {0}")]
    Decrypt(String),
}

fn join_failures(attempts: &[StrategyFailure]) -> String {
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_failed_message_lists_attempts() {
        let err = RouterError::AllStrategiesFailed {
            attempts: vec![
                StrategyFailure {
                    strategy: Strategy::Primary,
                    error: ConnectError::Unreachable("refused".into()).into(),
                },
                StrategyFailure {
                    strategy: Strategy::Browser,
                    error: TransportError::EmptyResponse,
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("primary: endpoint unreachable: refused"));
        assert!(text.contains("browser: empty response"));
        assert_eq!(err.attempts().len(), 2);
    }
}
