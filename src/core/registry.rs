//! 会话注册表
//!
//! 每个用户一个 Router（放在 `tokio::sync::Mutex` 后面，同一用户的调用串行执行），
//! 不同用户之间不共享任何传输状态。空闲超过 `idle_timeout` 的 Router 会被关闭并移除。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::RouterError;
use super::router::{Router, RouterSettings, RouterStats};
use crate::credentials::CredentialStore;
use crate::streaming::StreamHandlers;
use crate::transport::TransportFactory;

struct Entry {
    router: Arc<Mutex<Router>>,
    last_active: Instant,
}

/// 用户 → Router
pub struct SessionRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    settings: RouterSettings,
    store: Arc<CredentialStore>,
    factory: Arc<dyn TransportFactory>,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(
        settings: RouterSettings,
        store: Arc<CredentialStore>,
        factory: Arc<dyn TransportFactory>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            settings,
            store,
            factory,
            idle_timeout,
        }
    }

    /// 获取或创建用户的 Router，并刷新活跃时间
    pub async fn router_for(&self, user_id: &str) -> Arc<Mutex<Router>> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(user_id.to_string()).or_insert_with(|| {
            tracing::info!(user_id, "Creating router");
            Entry {
                router: Arc::new(Mutex::new(Router::new(
                    user_id,
                    self.settings.clone(),
                    Arc::clone(&self.store),
                    Arc::clone(&self.factory),
                ))),
                last_active: Instant::now(),
            }
        });
        entry.last_active = Instant::now();
        Arc::clone(&entry.router)
    }

    pub async fn send(
        &self,
        user_id: &str,
        text: &str,
        handlers: StreamHandlers,
    ) -> Result<String, RouterError> {
        let router = self.router_for(user_id).await;
        let result = router.lock().await.send_message(text, handlers).await;
        self.touch(user_id).await;
        result
    }

    async fn touch(&self, user_id: &str) {
        if let Some(entry) = self.entries.write().await.get_mut(user_id) {
            entry.last_active = Instant::now();
        }
    }

    /// 用户的统计；没有 Router 时返回 None
    pub async fn stats(&self, user_id: &str) -> Option<RouterStats> {
        let router = self
            .entries
            .read()
            .await
            .get(user_id)
            .map(|e| Arc::clone(&e.router))?;
        let stats = router.lock().await.stats();
        Some(stats)
    }

    /// 关闭并移除用户的 Router，下次调用从全新状态开始
    pub async fn reset(&self, user_id: &str) -> bool {
        let Some(entry) = self.entries.write().await.remove(user_id) else {
            return false;
        };
        entry.router.lock().await.close().await;
        tracing::info!(user_id, "Router reset");
        true
    }

    /// 关闭空闲超时且当前没有调用在进行的 Router
    pub async fn evict_idle(&self) -> usize {
        let mut evicted = Vec::new();
        {
            let mut entries = self.entries.write().await;
            let idle: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.last_active.elapsed() > self.idle_timeout)
                .map(|(user_id, _)| user_id.clone())
                .collect();

            for user_id in idle {
                // 正在发送的 Router 持有锁，跳过
                let busy = entries
                    .get(&user_id)
                    .map_or(true, |e| e.router.try_lock().is_err());
                if busy {
                    continue;
                }
                if let Some(entry) = entries.remove(&user_id) {
                    evicted.push((user_id, entry.router));
                }
            }
        }

        for (user_id, router) in &evicted {
            router.lock().await.close().await;
            tracing::info!(user_id = %user_id, "Evicted idle router");
        }
        evicted.len()
    }

    /// 后台定期清理，取消令牌触发后退出
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.evict_idle().await;
                        if evicted > 0 {
                            tracing::debug!(evicted, "Idle sweep finished");
                        }
                    }
                }
            }
        })
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// 关闭全部 Router
    pub async fn shutdown(&self) {
        let entries: Vec<_> = self.entries.write().await.drain().collect();
        for (_, entry) in &entries {
            entry.router.lock().await.close().await;
        }
        tracing::info!(routers = entries.len(), "Session registry shut down");
    }
}
