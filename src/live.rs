//! 变更通知与 Live Query
//!
//! 每次提交后 [`ChangeFeed`] 广播一条 [`ChangeEvent`]。[`LiveQuery`] 在后台
//! 任务里订阅变更：注册后立即投递一次完整结果集，之后只有当所属
//! collection 变化且结果集确实不同时才再次投递。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;

use crate::db::execute_compiled;
use crate::error::{Error, Result};
use crate::query::CompiledQuery;
use crate::types::{ChangeEvent, CollectionSpec, ResultRow};

/// 变更广播容量，溢出时订阅者收到 Lagged 并整体重跑查询
const FEED_CAPACITY: usize = 1024;

/// 结果集投递通道容量
const RESULT_CHANNEL_CAPACITY: usize = 16;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// 提交后变更广播器
#[derive(Debug)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    /// 广播事件（非阻塞；没有订阅者时直接丢弃）
    pub fn publish(&self, event: ChangeEvent) {
        tracing::trace!(
            "📡 change: seq={} doc={} kind={:?} origin={:?}",
            event.sequence,
            event.doc_id,
            event.kind,
            event.origin
        );
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// 一次结果集投递：完整结果集或执行错误
pub type QueryChange = Result<Vec<ResultRow>>;

/// 监听句柄
///
/// `remove()` 幂等；drop 时自动移除。
#[derive(Debug)]
pub struct ListenerToken {
    id: u64,
    task: Option<AbortHandle>,
    active: Arc<AtomicBool>,
}

impl ListenerToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// 移除监听，之后不再投递结果集
    pub fn remove(&mut self) {
        if let Some(task) = self.task.take() {
            self.active.store(false, Ordering::SeqCst);
            task.abort();
            tracing::debug!("📡 Live query listener removed: id={}", self.id);
        }
    }
}

impl Drop for ListenerToken {
    fn drop(&mut self) {
        self.remove();
    }
}

/// 结果集流
#[derive(Debug)]
pub struct QueryChanges {
    rx: mpsc::Receiver<QueryChange>,
    active: Arc<AtomicBool>,
}

impl QueryChanges {
    /// 下一次结果集；监听被移除后返回 `None`
    pub async fn next(&mut self) -> Option<QueryChange> {
        let change = self.rx.recv().await?;
        if !self.active.load(Ordering::SeqCst) {
            return None;
        }
        Some(change)
    }
}

/// Live query：结果集流 + 监听句柄
#[derive(Debug)]
pub struct LiveQuery {
    changes: QueryChanges,
    token: ListenerToken,
}

impl LiveQuery {
    pub(crate) fn spawn(
        conn: Arc<Mutex<Connection>>,
        feed: broadcast::Receiver<ChangeEvent>,
        collection: CollectionSpec,
        compiled: CompiledQuery,
    ) -> Result<Self> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Runtime(format!("live query 需要 tokio runtime: {}", e)))?;

        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let active = Arc::new(AtomicBool::new(true));

        let task = handle.spawn(run_live_query(conn, feed, collection, compiled, tx));
        tracing::debug!("📡 Live query listener registered: id={}", id);

        Ok(Self {
            changes: QueryChanges {
                rx,
                active: active.clone(),
            },
            token: ListenerToken {
                id,
                task: Some(task.abort_handle()),
                active,
            },
        })
    }

    pub async fn next(&mut self) -> Option<QueryChange> {
        self.changes.next().await
    }

    pub fn token_mut(&mut self) -> &mut ListenerToken {
        &mut self.token
    }

    pub fn into_parts(self) -> (QueryChanges, ListenerToken) {
        (self.changes, self.token)
    }
}

async fn run_live_query(
    conn: Arc<Mutex<Connection>>,
    mut feed: broadcast::Receiver<ChangeEvent>,
    collection: CollectionSpec,
    compiled: CompiledQuery,
    tx: mpsc::Sender<QueryChange>,
) {
    let compiled = Arc::new(compiled);
    let mut last: Option<Vec<ResultRow>> = None;

    loop {
        match execute_blocking(conn.clone(), compiled.clone()).await {
            Ok(rows) => {
                if last.as_ref() != Some(&rows) {
                    last = Some(rows.clone());
                    if tx.send(Ok(rows)).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!("Live query execution failed: {}", e);
                if tx.send(Err(e)).await.is_err() {
                    return;
                }
            }
        }

        // 等待所属 collection 的变更
        loop {
            match feed.recv().await {
                Ok(event) if event.affects(&collection) => break,
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("📡 Live query lagged by {} events, re-running", skipped);
                    break;
                }
                Err(RecvError::Closed) => return,
            }
        }

        // 合并已积压的变更，只重跑一次
        loop {
            match feed.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Closed) => return,
            }
        }

        if tx.is_closed() {
            return;
        }
    }
}

async fn execute_blocking(
    conn: Arc<Mutex<Connection>>,
    compiled: Arc<CompiledQuery>,
) -> Result<Vec<ResultRow>> {
    tokio::task::spawn_blocking(move || {
        let conn = conn.lock();
        execute_compiled(&conn, &compiled.sql, &compiled.params)
    })
    .await
    .map_err(|e| Error::Runtime(format!("查询任务失败: {}", e)))?
}
