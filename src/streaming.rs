//! 流式响应适配层
//!
//! 三种传输的推送模型（WebSocket 分片推送 / 浏览器一次性结果）统一为：
//! 零次或多次 `on_update(chunk)`，随后恰好一个终止事件（`on_complete(full_text)` 或失败）。
//!
//! 每个请求对应一个 `PendingRequest` 与一条有序投递队列，由独立的分发任务按接收顺序
//! 调用回调。累计缓冲区是权威结果：`full_text` 恒等于所有分片加最终载荷的拼接。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::core::WaitError;
use crate::transport::RequestId;

/// 流式回调（同步；需要异步处理的调用方可在回调里转发到 channel）
pub type StreamCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// 调用方注册的回调
#[derive(Clone, Default)]
pub struct StreamHandlers {
    on_update: Option<StreamCallback>,
    on_complete: Option<StreamCallback>,
}

impl StreamHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_update(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }

    pub fn has_update(&self) -> bool {
        self.on_update.is_some()
    }
}

impl std::fmt::Debug for StreamHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandlers")
            .field("on_update", &self.on_update.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .finish()
    }
}

/// 投递队列中的事件
#[derive(Debug)]
enum StreamEvent {
    Chunk(String),
    Complete(String),
    Failed(String),
}

type Outcome = Result<String, String>;

/// 一个在途请求
struct PendingRequest {
    content: String,
    complete: bool,
    created_at: Instant,
    updated_at: Instant,
    events: mpsc::UnboundedSender<StreamEvent>,
    outcome: Option<oneshot::Receiver<Outcome>>,
    dispatcher: JoinHandle<()>,
}

/// 在途请求快照（只读）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSnapshot {
    pub content: String,
    pub complete: bool,
    pub created_at: Instant,
    pub updated_at: Instant,
}

/// 在途请求表：每个传输实例独占一张
#[derive(Clone, Default)]
pub struct PendingTable {
    inner: Arc<Mutex<HashMap<RequestId, PendingRequest>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 登记请求并启动其分发任务（需在 tokio 运行时内调用）
    pub fn register(&self, id: RequestId, handlers: StreamHandlers) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let dispatcher = tokio::spawn(dispatch(events_rx, handlers, done_tx));
        let now = Instant::now();

        let previous = self.lock().insert(
            id.clone(),
            PendingRequest {
                content: String::new(),
                complete: false,
                created_at: now,
                updated_at: now,
                events: events_tx,
                outcome: Some(done_rx),
                dispatcher,
            },
        );
        if let Some(stale) = previous {
            tracing::warn!(request_id = %id, "Replacing pending request with duplicate id");
            stale.dispatcher.abort();
        }
    }

    /// 追加一个分片；未知或已完成的请求静默丢弃
    pub fn push_chunk(&self, id: &RequestId, chunk: &str) -> bool {
        let mut table = self.lock();
        let Some(entry) = table.get_mut(id).filter(|e| !e.complete) else {
            tracing::trace!(request_id = %id, "Dropping chunk for unknown or finished request");
            return false;
        };
        entry.content.push_str(chunk);
        entry.updated_at = Instant::now();
        entry.events.send(StreamEvent::Chunk(chunk.to_string())).is_ok()
    }

    /// 标记完成，可附带最后一段非分片载荷
    pub fn complete(&self, id: &RequestId, tail: Option<&str>) -> bool {
        let mut table = self.lock();
        let Some(entry) = table.get_mut(id).filter(|e| !e.complete) else {
            tracing::trace!(request_id = %id, "Dropping completion for unknown or finished request");
            return false;
        };
        if let Some(tail) = tail {
            entry.content.push_str(tail);
        }
        entry.complete = true;
        entry.updated_at = Instant::now();
        entry
            .events
            .send(StreamEvent::Complete(entry.content.clone()))
            .is_ok()
    }

    /// 以失败结束请求
    pub fn fail(&self, id: &RequestId, reason: &str) -> bool {
        let mut table = self.lock();
        let Some(entry) = table.get_mut(id).filter(|e| !e.complete) else {
            return false;
        };
        entry.complete = true;
        entry.updated_at = Instant::now();
        entry.events.send(StreamEvent::Failed(reason.to_string())).is_ok()
    }

    /// 以失败结束全部未完成请求（连接断开 / 关闭时）
    pub fn fail_all(&self, reason: &str) -> usize {
        let mut table = self.lock();
        let mut failed = 0;
        for entry in table.values_mut().filter(|e| !e.complete) {
            entry.complete = true;
            entry.updated_at = Instant::now();
            let _ = entry.events.send(StreamEvent::Failed(reason.to_string()));
            failed += 1;
        }
        failed
    }

    /// 等待终止事件；任何退出路径（含 future 被丢弃）都会注销该请求
    pub async fn wait(&self, id: &RequestId, timeout: Duration) -> Result<String, WaitError> {
        let outcome = self
            .lock()
            .get_mut(id)
            .and_then(|entry| entry.outcome.take())
            .ok_or_else(|| WaitError::NotFound(id.clone()))?;

        let _guard = Deregister { table: self, id };

        match tokio::time::timeout(timeout, outcome).await {
            Ok(Ok(Ok(text))) => Ok(text),
            Ok(Ok(Err(reason))) => Err(WaitError::Failed(reason)),
            Ok(Err(_)) => Err(WaitError::Failed("response channel closed".to_string())),
            Err(_) => {
                tracing::warn!(request_id = %id, ?timeout, "Timed out waiting for response");
                Err(WaitError::Timeout(timeout))
            }
        }
    }

    /// 注销请求并终止其分发任务
    pub fn remove(&self, id: &RequestId) -> bool {
        match self.lock().remove(id) {
            Some(entry) => {
                entry.dispatcher.abort();
                true
            }
            None => false,
        }
    }

    /// 注销全部请求
    pub fn clear(&self) {
        for (_, entry) in self.lock().drain() {
            entry.dispatcher.abort();
        }
    }

    pub fn snapshot(&self, id: &RequestId) -> Option<PendingSnapshot> {
        self.lock().get(id).map(|e| PendingSnapshot {
            content: e.content.clone(),
            complete: e.complete,
            created_at: e.created_at,
            updated_at: e.updated_at,
        })
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

struct Deregister<'a> {
    table: &'a PendingTable,
    id: &'a RequestId,
}

impl Drop for Deregister<'_> {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

/// 单请求分发任务：按接收顺序调用回调，终止事件只处理一次
async fn dispatch(
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    handlers: StreamHandlers,
    done: oneshot::Sender<Outcome>,
) {
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Chunk(chunk) => {
                if let Some(on_update) = &handlers.on_update {
                    on_update(&chunk);
                }
            }
            StreamEvent::Complete(full) => {
                if let Some(on_complete) = &handlers.on_complete {
                    on_complete(&full);
                }
                let _ = done.send(Ok(full));
                return;
            }
            StreamEvent::Failed(reason) => {
                let _ = done.send(Err(reason));
                return;
            }
        }
    }
}
