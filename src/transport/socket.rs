//! WebSocket 传输核心
//!
//! `SocketTransport<D>` 负责连接、握手、后台监听任务、指数退避重连与在途请求表；
//! 线路格式（URL、握手帧、提示帧编码、入站帧解析）由 `Dialect` 提供。

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{ConnectionState, RequestId, Transport};
use crate::config::ReconnectSection;
use crate::core::{ConnectError, SendError, Strategy, TransportError, WaitError};
use crate::streaming::{PendingTable, StreamHandlers};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// 解析后的入站帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// 服务端确认会话就绪
    Ready,
    /// 增量内容
    Chunk { id: RequestId, text: String },
    /// 终止帧，可附带最后一段载荷
    Final { id: RequestId, text: Option<String> },
    /// 服务端报告某个请求失败
    Error { id: RequestId, reason: String },
    /// 远端连接状态变化（仅记录日志）
    State { detail: String },
    /// 非 JSON 或结构不符
    Malformed(String),
    Ignored,
}

/// 线路方言：一种 WebSocket 会话的协议细节
pub trait Dialect: Send + Sync + 'static {
    fn strategy(&self) -> Strategy;

    /// 建立连接的 HTTP 升级请求（URL + 请求头）
    fn request(&self) -> Result<Request, ConnectError>;

    /// 连接建立后立即发送的握手帧
    fn handshake(&self) -> Option<String> {
        None
    }

    /// 是否需要等待服务端的就绪帧
    fn awaits_ready(&self) -> bool {
        false
    }

    fn encode_prompt(&self, id: &RequestId, text: &str) -> String;

    fn decode(&self, raw: &str) -> Inbound;
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, ConnectError> {
    HeaderValue::from_str(value)
        .map_err(|e| ConnectError::Unreachable(format!("invalid {name} header: {e}")))
}

pub(crate) fn insert_header(
    request: &mut Request,
    name: HeaderName,
    value: &str,
) -> Result<(), ConnectError> {
    let value = header_value(name.as_str(), value)?;
    request.headers_mut().insert(name, value);
    Ok(())
}

pub(crate) fn parse_frame(raw: &str) -> Result<Value, Inbound> {
    serde_json::from_str::<Value>(raw).map_err(|e| Inbound::Malformed(e.to_string()))
}

pub(crate) fn str_field<'a>(frame: &'a Value, key: &str) -> Option<&'a str> {
    frame.get(key).and_then(Value::as_str)
}

/// 指数退避：`base × 2^(attempt−1)`，不超过 `max_delay`，最多 `max_attempts` 次
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectSection::default())
    }
}

impl From<&ReconnectSection> for ReconnectPolicy {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            base_delay: Duration::from_millis(section.base_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
            max_attempts: section.max_attempts,
        }
    }
}

struct Listener {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner<D> {
    dialect: D,
    policy: ReconnectPolicy,
    handshake_timeout: Duration,
    state: StdMutex<ConnectionState>,
    writer: Mutex<Option<WsSink>>,
    pending: PendingTable,
}

impl<D: Dialect> Inner<D> {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            tracing::debug!(strategy = %self.dialect.strategy(), from = ?*state, to = ?next, "Socket state transition");
            *state = next;
        }
    }

    /// 建立 WebSocket 并完成握手
    async fn open(&self) -> Result<(WsSink, WsSource), ConnectError> {
        let request = self.dialect.request()?;
        let (ws, _) = tokio::time::timeout(
            self.handshake_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| ConnectError::Timeout(self.handshake_timeout))?
        .map_err(|e| ConnectError::Unreachable(e.to_string()))?;

        self.set_state(ConnectionState::Handshaking);
        let (mut sink, mut source) = ws.split();

        if let Some(frame) = self.dialect.handshake() {
            sink.send(Message::Text(frame.into()))
                .await
                .map_err(|e| ConnectError::Handshake(e.to_string()))?;
        }

        if self.dialect.awaits_ready() {
            tokio::time::timeout(self.handshake_timeout, self.await_ready(&mut source))
                .await
                .map_err(|_| ConnectError::Timeout(self.handshake_timeout))??;
        }

        Ok((sink, source))
    }

    async fn await_ready(&self, source: &mut WsSource) -> Result<(), ConnectError> {
        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Text(raw)) => {
                    if self.dialect.decode(&raw) == Inbound::Ready {
                        return Ok(());
                    }
                }
                Ok(Message::Close(frame)) => {
                    return Err(ConnectError::Handshake(format!(
                        "closed before ready: {frame:?}"
                    )))
                }
                Ok(_) => {}
                Err(e) => return Err(ConnectError::Handshake(e.to_string())),
            }
        }
        Err(ConnectError::Handshake("stream ended before ready".to_string()))
    }

    /// 读取入站帧直到连接结束，返回结束原因
    async fn pump(&self, source: &mut WsSource) -> String {
        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Text(raw)) => self.dispatch(&raw),
                Ok(Message::Close(frame)) => return format!("closed by peer: {frame:?}"),
                Ok(_) => {}
                Err(e) => return e.to_string(),
            }
        }
        "stream ended".to_string()
    }

    fn dispatch(&self, raw: &str) {
        let strategy = self.dialect.strategy();
        match self.dialect.decode(raw) {
            Inbound::Chunk { id, text } => {
                self.pending.push_chunk(&id, &text);
            }
            Inbound::Final { id, text } => {
                if self.pending.complete(&id, text.as_deref()) {
                    tracing::debug!(%strategy, request_id = %id, "Response complete");
                }
            }
            Inbound::Error { id, reason } => {
                tracing::warn!(%strategy, request_id = %id, %reason, "Remote reported request failure");
                self.pending.fail(&id, &reason);
            }
            Inbound::State { detail } => {
                tracing::info!(%strategy, %detail, "Remote connection state changed");
            }
            Inbound::Malformed(reason) => {
                let preview: String = raw.chars().take(100).collect();
                tracing::warn!(%strategy, %reason, %preview, "Malformed frame");
            }
            Inbound::Ready | Inbound::Ignored => {
                tracing::trace!(%strategy, "Ignoring frame");
            }
        }
    }

    /// 断线后按退避策略重连；耗尽次数或被取消时返回 None
    async fn reconnect(&self, cancel: &CancellationToken) -> Option<WsSource> {
        let strategy = self.dialect.strategy();
        self.writer.lock().await.take();

        for attempt in 1..=self.policy.max_attempts {
            self.set_state(ConnectionState::BackingOff);
            let delay = self.policy.delay(attempt);
            tracing::info!(%strategy, attempt, ?delay, "Backing off before reconnect");

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            self.set_state(ConnectionState::Connecting);
            let opened = tokio::select! {
                _ = cancel.cancelled() => return None,
                opened = self.open() => opened,
            };
            match opened {
                Ok((sink, source)) => {
                    *self.writer.lock().await = Some(sink);
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(%strategy, attempt, "Reconnected");
                    return Some(source);
                }
                Err(e) => {
                    tracing::warn!(%strategy, attempt, error = %e, "Reconnect attempt failed");
                }
            }
        }

        tracing::error!(%strategy, max_attempts = self.policy.max_attempts, "Max reconnection attempts reached");
        None
    }
}

/// 后台监听任务：分发入站帧，断线时重连
async fn listen<D: Dialect>(inner: Arc<Inner<D>>, mut source: WsSource, cancel: CancellationToken) {
    let strategy = inner.dialect.strategy();
    loop {
        let reason = tokio::select! {
            _ = cancel.cancelled() => return,
            reason = inner.pump(&mut source) => reason,
        };
        if cancel.is_cancelled() {
            return;
        }
        tracing::warn!(%strategy, %reason, "WebSocket connection lost");

        match inner.reconnect(&cancel).await {
            Some(next) => source = next,
            None => {
                if !cancel.is_cancelled() {
                    inner.set_state(ConnectionState::Error);
                    let failed = inner.pending.fail_all("connection lost");
                    tracing::error!(%strategy, failed, "Connection unrecoverable, failed pending requests");
                }
                return;
            }
        }
    }
}

/// 基于 WebSocket 的传输
pub struct SocketTransport<D: Dialect> {
    inner: Arc<Inner<D>>,
    listener: Mutex<Option<Listener>>,
}

impl<D: Dialect> SocketTransport<D> {
    pub fn new(dialect: D, policy: ReconnectPolicy, handshake_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                dialect,
                policy,
                handshake_timeout,
                state: StdMutex::new(ConnectionState::Disconnected),
                writer: Mutex::new(None),
                pending: PendingTable::new(),
            }),
            listener: Mutex::new(None),
        }
    }

    pub fn dialect(&self) -> &D {
        &self.inner.dialect
    }

    pub fn pending(&self) -> &PendingTable {
        &self.inner.pending
    }

    async fn stop_listener(listener: Listener) {
        listener.cancel.cancel();
        listener.handle.abort();
        if let Err(e) = listener.handle.await {
            if e.is_panic() {
                tracing::error!(error = %e, "Socket listener panicked");
            }
        }
    }
}

#[async_trait]
impl<D: Dialect> Transport for SocketTransport<D> {
    fn strategy(&self) -> Strategy {
        self.inner.dialect.strategy()
    }

    async fn connect(&self) -> Result<(), ConnectError> {
        let mut listener = self.listener.lock().await;
        match self.inner.state() {
            ConnectionState::Connected => {
                tracing::debug!(strategy = %self.strategy(), "Already connected");
                return Ok(());
            }
            state if !state.can_connect() => return Err(ConnectError::InProgress),
            _ => {}
        }

        if let Some(stale) = listener.take() {
            Self::stop_listener(stale).await;
        }

        tracing::info!(strategy = %self.strategy(), "Connecting");
        self.inner.set_state(ConnectionState::Connecting);

        match self.inner.open().await {
            Ok((sink, source)) => {
                *self.inner.writer.lock().await = Some(sink);
                self.inner.set_state(ConnectionState::Connected);

                let cancel = CancellationToken::new();
                let handle = tokio::spawn(listen(Arc::clone(&self.inner), source, cancel.clone()));
                *listener = Some(Listener { cancel, handle });

                tracing::info!(strategy = %self.strategy(), "WebSocket connection established");
                Ok(())
            }
            Err(e) => {
                self.inner.set_state(ConnectionState::Error);
                tracing::warn!(strategy = %self.strategy(), error = %e, "Failed to connect");
                Err(e)
            }
        }
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

        let id = RequestId::generate();
        let frame = self.inner.dialect.encode_prompt(&id, text);
        // 先登记再发送，避免回复先于登记到达
        self.inner.pending.register(id.clone(), handlers);

        let mut writer = self.inner.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            self.inner.pending.remove(&id);
            return Err(SendError::NotConnected("socket writer unavailable".to_string()));
        };
        if let Err(e) = sink.send(Message::Text(frame.into())).await {
            self.inner.pending.remove(&id);
            return Err(SendError::Transmit(e.to_string()));
        }

        tracing::info!(strategy = %self.strategy(), request_id = %id, chars = text.chars().count(), "Sent prompt");
        Ok(id)
    }

    async fn wait_for_response(
        &self,
        id: &RequestId,
        timeout: Duration,
    ) -> Result<String, WaitError> {
        self.inner.pending.wait(id, timeout).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(listener) = self.listener.lock().await.take() {
            Self::stop_listener(listener).await;
        }

        let mut result = Ok(());
        if let Some(mut sink) = self.inner.writer.lock().await.take() {
            match sink.close().await {
                Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {}
                Err(e) => result = Err(TransportError::Close(e.to_string())),
            }
        }

        let failed = self.inner.pending.fail_all("transport closed");
        self.inner.pending.clear();
        if self.inner.state() != ConnectionState::Disconnected {
            tracing::info!(strategy = %self.strategy(), failed, "WebSocket connection closed");
        }
        self.inner.set_state(ConnectionState::Disconnected);
        result
    }

    fn state(&self) -> ConnectionState {
        self.inner.state()
    }
}

impl<D: Dialect> Drop for SocketTransport<D> {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.cancel.cancel();
            listener.handle.abort();
        }
    }
}
