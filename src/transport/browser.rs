//! 浏览器自动化传输（browser）
//!
//! 页面操作由 `PageDriver` 完成（真实实现见 `chrome` 模块，需启用 feature "browser"）。
//! 浏览器没有原生流式：每个请求在后台任务里整段提交、整段取回，
//! 随后只触发一次终止事件，不产生 `on_update`。同一页面上的提交串行执行；
//! 等待结束（成功、失败、超时或被取消）即放弃对应提交，页面随即释放给下一个请求。

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ConnectionState, RequestId, Transport};
use crate::core::{ConnectError, SendError, Strategy, TransportError, WaitError};
use crate::credentials::AuthBundle;
use crate::streaming::{PendingTable, StreamHandlers};

/// 凭据缓存有效期
pub const AUTH_CACHE_TTL: Duration = Duration::from_secs(300);

/// 页面驱动：启动浏览器、提交提示并取回整段回复、导出凭据
#[async_trait]
pub trait PageDriver: Send + Sync + 'static {
    async fn launch(&self) -> Result<(), ConnectError>;

    /// 提交提示并等待完整回复；`cancel` 触发后应尽快放弃并释放页面
    async fn submit(&self, prompt: &str, cancel: &CancellationToken) -> Result<String, String>;

    /// 当前页面的 Cookie 与会话标识
    async fn capture_auth(&self) -> Option<AuthBundle>;

    async fn shutdown(&self);
}

/// 浏览器自动化传输
pub struct BrowserTransport {
    driver: Arc<dyn PageDriver>,
    state: StdMutex<ConnectionState>,
    pending: PendingTable,
    in_flight: Mutex<JoinSet<()>>,
    submissions: StdMutex<HashMap<RequestId, CancellationToken>>,
    /// 页面一次只处理一个提示
    page: Arc<Mutex<()>>,
    auth_cache: Mutex<Option<(AuthBundle, Instant)>>,
}

impl BrowserTransport {
    pub fn new(driver: Arc<dyn PageDriver>) -> Self {
        Self {
            driver,
            state: StdMutex::new(ConnectionState::Disconnected),
            pending: PendingTable::new(),
            in_flight: Mutex::new(JoinSet::new()),
            submissions: StdMutex::new(HashMap::new()),
            page: Arc::new(Mutex::new(())),
            auth_cache: Mutex::new(None),
        }
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    fn submissions(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, CancellationToken>> {
        self.submissions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != next {
            tracing::debug!(strategy = "browser", from = ?*state, to = ?next, "Browser state transition");
            *state = next;
        }
    }
}

#[async_trait]
impl Transport for BrowserTransport {
    fn strategy(&self) -> Strategy {
        Strategy::Browser
    }

    async fn connect(&self) -> Result<(), ConnectError> {
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            state if !state.can_connect() => return Err(ConnectError::InProgress),
            _ => {}
        }

        self.set_state(ConnectionState::Connecting);
        match self.driver.launch().await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                tracing::info!("Browser session ready");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Error);
                tracing::warn!(error = %e, "Failed to start browser session");
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
        self.pending.register(id.clone(), handlers);

        let driver = Arc::clone(&self.driver);
        let pending = self.pending.clone();
        let page = Arc::clone(&self.page);
        let prompt = text.to_string();
        let task_id = id.clone();
        let cancel = CancellationToken::new();
        self.submissions().insert(id.clone(), cancel.clone());

        let mut in_flight = self.in_flight.lock().await;
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(async move {
            let _page = tokio::select! {
                _ = cancel.cancelled() => return,
                guard = page.lock() => guard,
            };
            match driver.submit(&prompt, &cancel).await {
                _ if cancel.is_cancelled() => {
                    tracing::debug!(request_id = %task_id, "Abandoned browser submission finished");
                }
                Ok(reply) if reply.trim().is_empty() => {
                    pending.fail(&task_id, "browser returned an empty reply");
                }
                Ok(reply) => {
                    pending.complete(&task_id, Some(&reply));
                }
                Err(reason) => {
                    tracing::warn!(request_id = %task_id, %reason, "Browser submission failed");
                    pending.fail(&task_id, &reason);
                }
            }
        });

        tracing::info!(strategy = "browser", request_id = %id, chars = text.chars().count(), "Submitted prompt");
        Ok(id)
    }

    async fn wait_for_response(
        &self,
        id: &RequestId,
        timeout: Duration,
    ) -> Result<String, WaitError> {
        let _abandon = self
            .submissions()
            .remove(id)
            .map(CancellationToken::drop_guard);
        self.pending.wait(id, timeout).await
    }

    async fn close(&self) -> Result<(), TransportError> {
        for (_, cancel) in self.submissions().drain() {
            cancel.cancel();
        }
        self.in_flight.lock().await.abort_all();
        self.pending.fail_all("transport closed");
        self.pending.clear();

        if self.state() != ConnectionState::Disconnected {
            self.driver.shutdown().await;
            tracing::info!("Browser session closed");
        }
        self.auth_cache.lock().await.take();
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn extract_auth_data(&self) -> Option<AuthBundle> {
        let mut cache = self.auth_cache.lock().await;
        if let Some((bundle, at)) = cache.as_ref() {
            if at.elapsed() < AUTH_CACHE_TTL {
                return Some(bundle.clone());
            }
        }

        if !self.is_connected() {
            return None;
        }
        let bundle = self.driver.capture_auth().await.filter(|b| !b.is_empty())?;
        tracing::info!(keys = bundle.values().len(), "Captured auth data from browser session");
        *cache = Some((bundle.clone(), Instant::now()));
        Some(bundle)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct FakePage {
        fail_launch: bool,
        reply: String,
        abandoned: AtomicUsize,
        captures: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    #[async_trait]
    impl PageDriver for FakePage {
        async fn launch(&self) -> Result<(), ConnectError> {
            if self.fail_launch {
                return Err(ConnectError::Unavailable("no chrome".to_string()));
            }
            Ok(())
        }

        async fn submit(&self, prompt: &str, cancel: &CancellationToken) -> Result<String, String> {
            if prompt == "hang" {
                cancel.cancelled().await;
                self.abandoned.fetch_add(1, Ordering::SeqCst);
                return Err("abandoned".to_string());
            }
            Ok(self.reply.replace("{prompt}", prompt))
        }

        async fn capture_auth(&self) -> Option<AuthBundle> {
            self.captures.fetch_add(1, Ordering::SeqCst);
            Some(AuthBundle::captured_now(BTreeMap::new()).with_cookie("sid", "from-browser"))
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn page(reply: &str) -> Arc<FakePage> {
        Arc::new(FakePage {
            reply: reply.to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_whole_reply_single_completion() {
        let transport = BrowserTransport::new(page("echo: {prompt}"));
        let updates = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&updates);
        let handlers = StreamHandlers::new().on_update(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let id = transport.send_message("hi", handlers).await.unwrap();
        let text = transport
            .wait_for_response(&id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(text, "echo: hi");
        assert_eq!(updates.load(Ordering::SeqCst), 0);
        assert!(transport.pending().is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_submission_releases_page() {
        let driver = page("echo: {prompt}");
        let transport = BrowserTransport::new(Arc::clone(&driver) as Arc<dyn PageDriver>);

        let stuck = transport.send_message("hang", StreamHandlers::new()).await.unwrap();
        let err = transport
            .wait_for_response(&stuck, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, WaitError::Timeout(Duration::from_millis(50)));

        let id = transport.send_message("next", StreamHandlers::new()).await.unwrap();
        let text = transport
            .wait_for_response(&id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(text, "echo: next");
        assert_eq!(driver.abandoned.load(Ordering::SeqCst), 1);
        assert!(transport.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_empty_reply_is_failure() {
        let transport = BrowserTransport::new(page("  "));
        let id = transport.send_message("hi", StreamHandlers::new()).await.unwrap();
        let err = transport
            .wait_for_response(&id, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, WaitError::Failed(_)));
    }

    #[tokio::test]
    async fn test_launch_failure_surfaces_as_send_error() {
        let driver = Arc::new(FakePage {
            fail_launch: true,
            ..Default::default()
        });
        let transport = BrowserTransport::new(driver);
        let err = transport.send_message("hi", StreamHandlers::new()).await.unwrap_err();
        assert!(matches!(err, SendError::NotConnected(_)));
        assert_eq!(transport.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_auth_is_cached() {
        let driver = page("ok");
        let transport = BrowserTransport::new(Arc::clone(&driver) as Arc<dyn PageDriver>);
        assert!(transport.extract_auth_data().await.is_none());

        transport.connect().await.unwrap();
        let first = transport.extract_auth_data().await.unwrap();
        let second = transport.extract_auth_data().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(driver.captures.load(Ordering::SeqCst), 1);

        transport.close().await.unwrap();
        transport.close().await.unwrap();
        assert_eq!(driver.shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }
}
