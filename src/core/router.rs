//! 降级路由器
//!
//! 每次调用按选择策略确定起始传输，失败时沿固定顺序 primary → token → browser 降级，
//! 同一次调用内不重试同一策略。浏览器策略成功后提取凭据并持久化，供下次优先使用
//! 更快的 socket 策略。
//!
//! 传输按需构造并缓存；构造或连接失败的实例被关闭并丢弃，下次重新构造。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;

use super::error::{RouterError, StrategyFailure, TransportError};
use super::strategy::{Strategy, StrategyBoard};
use crate::config::AppConfig;
use crate::credentials::{AuthBundle, CredentialStore};
use crate::streaming::StreamHandlers;
use crate::transport::{ConnectionState, Transport, TransportFactory};

/// Router 参数（按策略索引的数组与 `Strategy::ORDER` 对应）
#[derive(Debug, Clone, PartialEq)]
pub struct RouterSettings {
    pub thresholds: [u32; 3],
    pub response_timeouts: [Duration; 3],
    /// 固定起始策略；None 表示每次调用按选择策略决定
    pub pinned: Option<Strategy>,
    pub stickiness_ttl: Option<Duration>,
    /// 存储凭据的最大有效期，超期的凭据不会被使用
    pub auth_max_age: Duration,
}

impl RouterSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let strategies = &config.strategies;
        Self {
            thresholds: Strategy::ORDER.map(|s| strategies.get(s).failure_threshold),
            response_timeouts: Strategy::ORDER.map(|s| strategies.get(s).response_timeout()),
            pinned: config.router.pinned(),
            stickiness_ttl: config.router.stickiness_ttl(),
            auth_max_age: config.credentials.max_age(),
        }
    }

    pub fn response_timeout(&self, strategy: Strategy) -> Duration {
        self.response_timeouts[strategy.index()]
    }
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 单个策略的统计
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrategyStats {
    pub strategy: Strategy,
    pub failures: u32,
    pub threshold: u32,
    pub successes: u64,
    /// 是否持有已构造的传输实例
    pub active: bool,
}

/// Router 统计快照（只读）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouterStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub success_rate: f64,
    pub strategies: Vec<StrategyStats>,
    pub last_strategy: Option<Strategy>,
    pub has_auth: bool,
}

impl RouterStats {
    pub fn failures(&self, strategy: Strategy) -> u32 {
        self.strategies
            .iter()
            .find(|s| s.strategy == strategy)
            .map(|s| s.failures)
            .unwrap_or_default()
    }
}

impl fmt::Display for RouterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "calls: {} (succeeded {}, {:.1}%)",
            self.total_calls,
            self.successful_calls,
            self.success_rate * 100.0
        )?;
        for s in &self.strategies {
            writeln!(
                f,
                "  {:<8} failures {}/{}  successes {}{}",
                s.strategy.as_str(),
                s.failures,
                s.threshold,
                s.successes,
                if s.active { "  [active]" } else { "" }
            )?;
        }
        let last = self.last_strategy.map(Strategy::as_str).unwrap_or("-");
        write!(f, "last strategy: {last}, stored auth: {}", if self.has_auth { "yes" } else { "no" })
    }
}

/// 降级路由器（每个用户一个）
pub struct Router {
    user_id: String,
    settings: RouterSettings,
    board: StrategyBoard,
    store: Arc<CredentialStore>,
    factory: Arc<dyn TransportFactory>,
    auth: Option<AuthBundle>,
    transports: [Option<Box<dyn Transport>>; 3],
    total_calls: u64,
    successful_calls: u64,
    last_strategy: Option<Strategy>,
}

impl Router {
    pub fn new(
        user_id: impl Into<String>,
        settings: RouterSettings,
        store: Arc<CredentialStore>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let user_id = user_id.into();
        let auth = if store.is_valid(&user_id, settings.auth_max_age) {
            store.get(&user_id)
        } else {
            if store.get(&user_id).is_some() {
                tracing::info!(user_id = %user_id, "Stored credentials expired, ignoring");
            }
            None
        };

        Self {
            board: StrategyBoard::new(settings.thresholds, settings.stickiness_ttl),
            user_id,
            settings,
            store,
            factory,
            auth,
            transports: [None, None, None],
            total_calls: 0,
            successful_calls: 0,
            last_strategy: None,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn auth(&self) -> Option<&AuthBundle> {
        self.auth.as_ref()
    }

    /// 发送消息，必要时降级；只有全部策略失败时返回错误
    pub async fn send_message(
        &mut self,
        text: &str,
        handlers: StreamHandlers,
    ) -> Result<String, RouterError> {
        self.total_calls += 1;
        let live: [bool; 3] = std::array::from_fn(|i| self.transports[i].is_some());
        let start = self.settings.pinned.unwrap_or_else(|| self.board.select(live));
        let mut attempts = Vec::new();

        for &strategy in start.escalation_from() {
            tracing::debug!(user_id = %self.user_id, %strategy, "Trying strategy");
            match self.attempt(strategy, text, handlers.clone()).await {
                Ok(reply) => {
                    self.board.record_success(strategy);
                    self.successful_calls += 1;
                    self.last_strategy = Some(strategy);
                    tracing::info!(user_id = %self.user_id, %strategy, chars = reply.chars().count(), "Message delivered");

                    if strategy == Strategy::Browser {
                        self.capture_browser_auth().await;
                    }
                    return Ok(reply);
                }
                Err(error) => {
                    self.board.record_failure(strategy);
                    tracing::warn!(
                        user_id = %self.user_id,
                        %strategy,
                        error = %error,
                        failures = self.board.failures(strategy),
                        "Strategy failed, escalating"
                    );
                    self.discard_if_broken(strategy).await;
                    attempts.push(StrategyFailure { strategy, error });
                }
            }
        }

        tracing::error!(user_id = %self.user_id, attempts = attempts.len(), "All strategies failed");
        Err(RouterError::AllStrategiesFailed { attempts })
    }

    async fn attempt(
        &mut self,
        strategy: Strategy,
        text: &str,
        handlers: StreamHandlers,
    ) -> Result<String, TransportError> {
        let timeout = self.settings.response_timeout(strategy);
        let transport = self.ensure_transport(strategy).await?;
        let id = transport.send_message(text, handlers).await?;
        let reply = transport.wait_for_response(&id, timeout).await?;
        if reply.trim().is_empty() {
            return Err(TransportError::EmptyResponse);
        }
        Ok(reply)
    }

    /// 取出缓存的传输，没有则构造并连接
    async fn ensure_transport(&mut self, strategy: Strategy) -> Result<&dyn Transport, TransportError> {
        let slot = &mut self.transports[strategy.index()];
        if slot.is_none() {
            let transport = self.factory.build(strategy, self.auth.as_ref()).await?;
            if let Err(e) = transport.connect().await {
                if let Err(close_err) = transport.close().await {
                    tracing::debug!(%strategy, error = %close_err, "Closing failed transport");
                }
                return Err(e.into());
            }
            *slot = Some(transport);
        }
        slot.as_deref()
            .ok_or_else(|| TransportError::Close(format!("{strategy} transport missing")))
    }

    /// 进入 Error 状态的传输（如重连耗尽）关闭并丢弃
    async fn discard_if_broken(&mut self, strategy: Strategy) {
        let slot = &mut self.transports[strategy.index()];
        if slot.as_ref().is_some_and(|t| t.state() == ConnectionState::Error) {
            if let Some(transport) = slot.take() {
                if let Err(e) = transport.close().await {
                    tracing::debug!(%strategy, error = %e, "Closing broken transport");
                }
                tracing::info!(user_id = %self.user_id, %strategy, "Discarded broken transport");
            }
        }
    }

    async fn capture_browser_auth(&mut self) {
        let Some(browser) = self.transports[Strategy::Browser.index()].as_deref() else {
            return;
        };
        let Some(bundle) = browser.extract_auth_data().await else {
            tracing::debug!(user_id = %self.user_id, "Browser session exposed no auth data");
            return;
        };

        match self.store.store(&self.user_id, bundle.clone()) {
            Ok(()) => tracing::info!(user_id = %self.user_id, "Persisted auth captured from browser"),
            Err(e) => tracing::warn!(user_id = %self.user_id, error = %e, "Failed to persist browser auth"),
        }
        self.auth = Some(bundle);

        // socket 传输以旧凭据构造，下次按新凭据重建
        for strategy in [Strategy::Primary, Strategy::Token] {
            if let Some(stale) = self.transports[strategy.index()].take() {
                if let Err(e) = stale.close().await {
                    tracing::debug!(%strategy, error = %e, "Closing transport with stale auth");
                }
            }
        }
    }

    pub fn stats(&self) -> RouterStats {
        let success_rate = if self.total_calls == 0 {
            0.0
        } else {
            self.successful_calls as f64 / self.total_calls as f64
        };

        RouterStats {
            total_calls: self.total_calls,
            successful_calls: self.successful_calls,
            success_rate,
            strategies: Strategy::ORDER
                .iter()
                .map(|&strategy| {
                    let counter = self.board.counter(strategy);
                    StrategyStats {
                        strategy,
                        failures: counter.count,
                        threshold: counter.threshold,
                        successes: self.board.successes(strategy),
                        active: self.transports[strategy.index()].is_some(),
                    }
                })
                .collect(),
            last_strategy: self.last_strategy,
            has_auth: self.auth.is_some(),
        }
    }

    /// 并发关闭全部传输；失败只记录日志，引用总是被清空
    pub async fn close(&mut self) {
        let transports: Vec<Box<dyn Transport>> =
            self.transports.iter_mut().filter_map(Option::take).collect();
        if transports.is_empty() {
            return;
        }

        let results = join_all(
            transports
                .iter()
                .map(|t| async move { (t.strategy(), t.close().await) }),
        )
        .await;

        for (strategy, result) in results {
            if let Err(e) = result {
                tracing::warn!(user_id = %self.user_id, %strategy, error = %e, "Failed to close transport");
            }
        }
        tracing::info!(user_id = %self.user_id, closed = transports.len(), "Router closed");
    }
}
