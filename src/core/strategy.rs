//! 策略、失败计数与选择策略
//!
//! 固定优先级：primary（持久会话）→ token（令牌会话）→ browser（浏览器自动化）。
//! 计数为「自上次成功以来的累计失败」，不是滑动窗口。

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// 消息投递策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// 持久 WebSocket 会话（Cookie 认证）
    Primary,
    /// 令牌 WebSocket 会话（clientId / sessionId / tokenCluster）
    Token,
    /// 浏览器自动化
    Browser,
}

impl Strategy {
    /// 降级顺序
    pub const ORDER: [Strategy; 3] = [Strategy::Primary, Strategy::Token, Strategy::Browser];

    pub fn index(self) -> usize {
        match self {
            Strategy::Primary => 0,
            Strategy::Token => 1,
            Strategy::Browser => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Primary => "primary",
            Strategy::Token => "token",
            Strategy::Browser => "browser",
        }
    }

    /// 基于 WebSocket 的策略
    pub fn is_socket(self) -> bool {
        !matches!(self, Strategy::Browser)
    }

    /// 从该策略开始的降级链
    pub fn escalation_from(self) -> &'static [Strategy] {
        &Self::ORDER[self.index()..]
    }

    /// 解析配置中的策略名；"auto" 或空串表示不固定
    pub fn parse_pinned(raw: &str) -> Result<Option<Strategy>, String> {
        match raw.trim().to_lowercase().as_str() {
            "" | "auto" => Ok(None),
            "primary" | "session" => Ok(Some(Strategy::Primary)),
            "token" => Ok(Some(Strategy::Token)),
            "browser" => Ok(Some(Strategy::Browser)),
            other => Err(format!("unknown strategy '{other}'")),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单策略失败计数器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureCounter {
    pub count: u32,
    pub threshold: u32,
}

impl FailureCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            count: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn tripped(&self) -> bool {
        self.count >= self.threshold
    }

    pub fn record_failure(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

/// 三个策略的计数与成功记录，以及选择策略
#[derive(Debug, Clone)]
pub struct StrategyBoard {
    counters: [FailureCounter; 3],
    successes: [u64; 3],
    last_success: [Option<Instant>; 3],
    /// 成功记录的有效期；None 表示永不衰减
    stickiness_ttl: Option<Duration>,
}

impl StrategyBoard {
    pub fn new(thresholds: [u32; 3], stickiness_ttl: Option<Duration>) -> Self {
        Self {
            counters: thresholds.map(FailureCounter::new),
            successes: [0; 3],
            last_success: [None; 3],
            stickiness_ttl,
        }
    }

    pub fn counter(&self, strategy: Strategy) -> FailureCounter {
        self.counters[strategy.index()]
    }

    pub fn failures(&self, strategy: Strategy) -> u32 {
        self.counters[strategy.index()].count
    }

    pub fn successes(&self, strategy: Strategy) -> u64 {
        self.successes[strategy.index()]
    }

    pub fn record_failure(&mut self, strategy: Strategy) {
        self.counters[strategy.index()].record_failure();
    }

    pub fn record_success(&mut self, strategy: Strategy) {
        let i = strategy.index();
        self.counters[i].reset();
        self.successes[i] += 1;
        self.last_success[i] = Some(Instant::now());
    }

    pub fn reset_all(&mut self) {
        for counter in &mut self.counters {
            counter.reset();
        }
    }

    /// 只有持有存活实例的 socket 策略会粘滞；浏览器成功后下次调用仍从更快的 socket 策略开始
    fn is_sticky(&self, strategy: Strategy, live: bool) -> bool {
        let i = strategy.index();
        if !strategy.is_socket() || !live || self.successes[i] == 0 || self.counters[i].tripped() {
            return false;
        }
        match (self.stickiness_ttl, self.last_success[i]) {
            (Some(ttl), Some(at)) => at.elapsed() < ttl,
            _ => true,
        }
    }

    /// 为本次调用选择起始策略；`live` 标记各策略当前是否持有传输实例
    ///
    /// 1. 有过成功且未超阈值的 socket 策略优先（按优先级取第一个）
    /// 2. 否则取第一个未超阈值的策略
    /// 3. 全部超阈值时整体清零，从 primary 重新开始
    pub fn select(&mut self, live: [bool; 3]) -> Strategy {
        if let Some(sticky) = Strategy::ORDER
            .into_iter()
            .find(|s| self.is_sticky(*s, live[s.index()]))
        {
            tracing::debug!(strategy = %sticky, "Preferring strategy with prior success");
            return sticky;
        }

        if let Some(open) = Strategy::ORDER
            .into_iter()
            .find(|s| !self.counters[s.index()].tripped())
        {
            return open;
        }

        tracing::info!("All strategies exceeded their failure thresholds, resetting counters");
        self.reset_all();
        Strategy::Primary
    }
}
