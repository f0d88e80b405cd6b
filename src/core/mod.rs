//! 核心层：错误类型、策略与失败计数、降级路由器、按用户的会话注册表

pub mod error;
pub mod registry;
pub mod router;
pub mod strategy;

pub use error::{
    ConnectError, CredentialError, RouterError, SendError, StrategyFailure, TransportError,
    WaitError,
};
pub use registry::SessionRegistry;
pub use router::{Router, RouterSettings, RouterStats, StrategyStats};
pub use strategy::{FailureCounter, Strategy, StrategyBoard};
