//! Mock 传输（用于测试，无需网络或浏览器）
//!
//! `MockTransportFactory` 为每个策略配置一种行为，并统计构造、连接、发送、关闭次数，
//! 便于在不依赖真实服务的情况下验证 Router 的降级与计数逻辑。

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::factory::TransportFactory;
use super::{ConnectionState, RequestId, Transport};
use crate::core::{ConnectError, SendError, Strategy, TransportError, WaitError};
use crate::credentials::AuthBundle;
use crate::streaming::{PendingTable, StreamHandlers};

/// 单个策略的模拟行为
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// connect() 失败
    FailConnect,
    /// 连接成功但发送失败
    FailSend,
    /// 依次推送分片，再以可选载荷结束
    Reply { chunks: Vec<String>, tail: Option<String> },
    /// 回显输入并追加后缀（一次性结果）
    Echo(String),
    /// 永不回复
    Silent,
    /// 回复空字符串
    Empty,
}

impl MockBehavior {
    pub fn reply(chunks: &[&str], tail: Option<&str>) -> Self {
        MockBehavior::Reply {
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            tail: tail.map(str::to_string),
        }
    }

    pub fn echo(suffix: &str) -> Self {
        MockBehavior::Echo(suffix.to_string())
    }
}

/// 单个策略的调用统计
#[derive(Debug, Default)]
pub struct MockCalls {
    pub builds: AtomicUsize,
    pub connects: AtomicUsize,
    pub sends: AtomicUsize,
    pub closes: AtomicUsize,
}

/// Mock 传输
pub struct MockTransport {
    strategy: Strategy,
    behavior: MockBehavior,
    state: Mutex<ConnectionState>,
    pending: PendingTable,
    auth: Option<AuthBundle>,
    calls: Arc<MockCalls>,
}

impl MockTransport {
    pub fn new(strategy: Strategy, behavior: MockBehavior) -> Self {
        Self {
            strategy,
            behavior,
            state: Mutex::new(ConnectionState::Disconnected),
            pending: PendingTable::new(),
            auth: None,
            calls: Arc::default(),
        }
    }

    /// extract_auth_data() 返回的凭据
    pub fn with_auth(mut self, auth: AuthBundle) -> Self {
        self.auth = Some(auth);
        self
    }

    fn with_calls(mut self, calls: Arc<MockCalls>) -> Self {
        self.calls = calls;
        self
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    fn deliver(&self, id: RequestId, text: &str) {
        let pending = self.pending.clone();
        let reply = match &self.behavior {
            MockBehavior::Reply { chunks, tail } => Some((chunks.clone(), tail.clone())),
            MockBehavior::Echo(suffix) => Some((Vec::new(), Some(format!("{text}{suffix}")))),
            MockBehavior::Empty => Some((Vec::new(), Some(String::new()))),
            _ => None,
        };

        if let Some((chunks, tail)) = reply {
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                for chunk in &chunks {
                    pending.push_chunk(&id, chunk);
                }
                pending.complete(&id, tail.as_deref());
            });
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn strategy(&self) -> Strategy {
        self.strategy
    }

    async fn connect(&self) -> Result<(), ConnectError> {
        self.calls.connects.fetch_add(1, Ordering::SeqCst);
        if self.behavior == MockBehavior::FailConnect {
            self.set_state(ConnectionState::Error);
            return Err(ConnectError::Unreachable(format!("mock {} unreachable", self.strategy)));
        }
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn send_message(
        &self,
        text: &str,
        handlers: StreamHandlers,
    ) -> Result<RequestId, SendError> {
        if !self.is_connected() {
            self.connect()
                .await
                .map_err(|e| SendError::NotConnected(e.to_string()))?;
        }
        self.calls.sends.fetch_add(1, Ordering::SeqCst);
        if self.behavior == MockBehavior::FailSend {
            return Err(SendError::Transmit(format!("mock {} send failure", self.strategy)));
        }

        let id = RequestId::generate();
        self.pending.register(id.clone(), handlers);
        self.deliver(id.clone(), text);
        Ok(id)
    }

    async fn wait_for_response(
        &self,
        id: &RequestId,
        timeout: Duration,
    ) -> Result<String, WaitError> {
        self.pending.wait(id, timeout).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.calls.closes.fetch_add(1, Ordering::SeqCst);
        self.pending.fail_all("transport closed");
        self.pending.clear();
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn extract_auth_data(&self) -> Option<AuthBundle> {
        self.auth.clone()
    }
}

/// Mock 工厂：未配置的策略默认连接失败
#[derive(Default)]
pub struct MockTransportFactory {
    behaviors: Mutex<HashMap<Strategy, MockBehavior>>,
    calls: [Arc<MockCalls>; 3],
    browser_auth: Option<AuthBundle>,
    seen_auth: Mutex<HashMap<Strategy, Option<AuthBundle>>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, strategy: Strategy, behavior: MockBehavior) -> Self {
        self.set(strategy, behavior);
        self
    }

    /// 浏览器传输成功后可提取的凭据
    pub fn with_browser_auth(mut self, auth: AuthBundle) -> Self {
        self.browser_auth = Some(auth);
        self
    }

    /// 运行中修改某策略之后构造的传输的行为
    pub fn set(&self, strategy: Strategy, behavior: MockBehavior) {
        self.behaviors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(strategy, behavior);
    }

    pub fn calls(&self, strategy: Strategy) -> &MockCalls {
        &self.calls[strategy.index()]
    }

    pub fn builds(&self, strategy: Strategy) -> usize {
        self.calls(strategy).builds.load(Ordering::SeqCst)
    }

    pub fn connects(&self, strategy: Strategy) -> usize {
        self.calls(strategy).connects.load(Ordering::SeqCst)
    }

    pub fn sends(&self, strategy: Strategy) -> usize {
        self.calls(strategy).sends.load(Ordering::SeqCst)
    }

    pub fn closes(&self, strategy: Strategy) -> usize {
        self.calls(strategy).closes.load(Ordering::SeqCst)
    }

    /// 最近一次构造该策略时传入的凭据
    pub fn seen_auth(&self, strategy: Strategy) -> Option<AuthBundle> {
        self.seen_auth
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&strategy)
            .cloned()
            .flatten()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn build(
        &self,
        strategy: Strategy,
        auth: Option<&AuthBundle>,
    ) -> Result<Box<dyn Transport>, ConnectError> {
        let calls = Arc::clone(&self.calls[strategy.index()]);
        calls.builds.fetch_add(1, Ordering::SeqCst);
        self.seen_auth
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(strategy, auth.cloned());

        let behavior = self
            .behaviors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&strategy)
            .cloned()
            .unwrap_or(MockBehavior::FailConnect);

        let mut transport = MockTransport::new(strategy, behavior).with_calls(calls);
        if strategy == Strategy::Browser {
            if let Some(auth) = &self.browser_auth {
                transport = transport.with_auth(auth.clone());
            }
        }
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reply_streams_chunks_then_tail() {
        let transport = MockTransport::new(Strategy::Token, MockBehavior::reply(&["a", "b"], Some("c")));
        let id = transport.send_message("x", StreamHandlers::new()).await.unwrap();
        let text = transport.wait_for_response(&id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(text, "abc");
    }

    #[tokio::test]
    async fn test_fail_connect_counts() {
        let factory = MockTransportFactory::new();
        let transport = factory.build(Strategy::Primary, None).await.unwrap();
        assert!(transport.connect().await.is_err());
        assert_eq!(factory.builds(Strategy::Primary), 1);
        assert_eq!(factory.connects(Strategy::Primary), 1);
        assert_eq!(transport.state(), ConnectionState::Error);
    }
}
