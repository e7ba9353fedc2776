//! 持续双向同步
//!
//! 后台任务循环：推送待推送变更 → 拉取远端变更 → 等待本地变更、
//! 轮询间隔或停止信号。失败时状态转为 `Offline`，按指数退避重试。

use std::sync::Arc;

use parking_lot::Mutex;
use reqwest::StatusCode;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::config::SyncConfig;
use super::protocol::{ChangesResponse, PushRequest, PushResponse};
use super::status::{ActivityLevel, ReplicatorStatus};
use crate::db::LocalStore;
use crate::error::{Error, Result};
use crate::types::{ChangeEvent, ChangeOrigin, CollectionSpec};

/// 同步器
pub struct Replicator {
    store: Arc<LocalStore>,
    collection: CollectionSpec,
    config: SyncConfig,
    http: reqwest::Client,
    status: watch::Sender<ReplicatorStatus>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Replicator {
    /// 创建同步器（不启动）
    pub fn new(store: Arc<LocalStore>, collection: CollectionSpec, config: SyncConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("travel-sample-db/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let (status, _) = watch::channel(ReplicatorStatus::default());
        let (stop, _) = watch::channel(false);

        Ok(Arc::new(Self {
            store,
            collection,
            config,
            http,
            status,
            stop,
            task: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// 订阅同步状态
    pub fn status(&self) -> watch::Receiver<ReplicatorStatus> {
        self.status.subscribe()
    }

    /// 启动后台同步（已在运行时直接返回）
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Runtime(format!("同步需要 tokio runtime: {}", e)))?;

        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return Ok(());
        }

        self.stop.send_replace(false);
        self.status.send_modify(|s| {
            s.activity = ActivityLevel::Connecting;
            s.last_error = None;
        });

        // 先订阅，启动后的本地写入不会漏掉
        let changes = self.store.changes();
        let stop = self.stop.subscribe();
        *task = Some(handle.spawn(self.clone().run(changes, stop)));

        tracing::info!(
            "🔄 同步已启动: {} ({:?}, continuous={})",
            self.config.endpoint,
            self.config.replicator_type,
            self.config.continuous
        );
        Ok(())
    }

    /// 停止后台同步（幂等）
    pub fn stop(&self) {
        self.stop.send_replace(true);
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::info!("🔄 同步已停止: {}", self.config.endpoint);
        }
        self.status.send_modify(|s| s.activity = ActivityLevel::Stopped);
    }

    /// 停止后不再覆盖 `Stopped`
    fn update_status(&self, f: impl FnOnce(&mut ReplicatorStatus)) {
        self.status.send_if_modified(|status| {
            if *self.stop.borrow() {
                return false;
            }
            f(status);
            true
        });
    }

    async fn run(
        self: Arc<Self>,
        mut changes: broadcast::Receiver<ChangeEvent>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut failures: u32 = 0;

        loop {
            let delay = match self.sync_once().await {
                Ok((pushed, pulled)) => {
                    failures = 0;
                    self.update_status(|s| {
                        s.activity = ActivityLevel::Idle;
                        s.last_error = None;
                    });
                    if pushed + pulled > 0 {
                        tracing::debug!("🔄 同步完成: pushed={} pulled={}", pushed, pulled);
                    }
                    if !self.config.continuous {
                        self.update_status(|s| s.activity = ActivityLevel::Stopped);
                        return;
                    }
                    None
                }
                Err(e) => {
                    let delay = self.config.retry.delay_for(failures);
                    failures = failures.saturating_add(1);
                    tracing::warn!("🔄 同步失败 ({} 次)，{:?} 后重试: {}", failures, delay, e);
                    self.update_status(|s| {
                        s.activity = if self.config.continuous {
                            ActivityLevel::Offline
                        } else {
                            ActivityLevel::Stopped
                        };
                        s.last_error = Some(e.to_string());
                    });
                    if !self.config.continuous {
                        return;
                    }
                    Some(delay)
                }
            };

            match delay {
                // 退避期间只等超时或停止
                Some(delay) => {
                    tokio::select! {
                        _ = stop.changed() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = stop.changed() => return,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        alive = self.wait_local_change(&mut changes) => {
                            if !alive {
                                return;
                            }
                        }
                    }
                }
            }

            if *stop.borrow() {
                return;
            }
        }
    }

    /// 等待本 collection 的本地写入；变更源关闭时返回 false
    async fn wait_local_change(&self, changes: &mut broadcast::Receiver<ChangeEvent>) -> bool {
        if !self.config.replicator_type.pushes() {
            return std::future::pending().await;
        }

        loop {
            match changes.recv().await {
                Ok(event) if event.origin == ChangeOrigin::Local && event.affects(&self.collection) => {
                    return true
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(_)) => return true,
                Err(RecvError::Closed) => return false,
            }
        }
    }

    /// 执行一轮推送 + 拉取，返回 (推送数, 拉取数)
    pub async fn sync_once(&self) -> Result<(u64, u64)> {
        let pushed = if self.config.replicator_type.pushes() {
            self.push().await?
        } else {
            0
        };
        let pulled = if self.config.replicator_type.pulls() {
            self.pull().await?
        } else {
            0
        };
        Ok((pushed, pulled))
    }

    async fn push(&self) -> Result<u64> {
        let batch = self.config.batch_size;
        let url = format!("{}/push", self.config.endpoint);
        let mut total = 0u64;

        loop {
            let pending = self
                .with_store(move |store, c| store.pending_changes(c, batch))
                .await?;
            if pending.is_empty() {
                break;
            }

            self.update_status(|s| s.activity = ActivityLevel::Busy);
            let sequences: Vec<(String, i64)> = pending
                .iter()
                .map(|p| (p.doc.id.clone(), p.sequence))
                .collect();
            let request = PushRequest {
                docs: pending.into_iter().map(|p| p.doc).collect(),
            };

            tracing::debug!("⬆️ push {} docs -> {}", request.docs.len(), url);
            let response = self
                .http
                .post(&url)
                .basic_auth(&self.config.username, Some(&self.config.password))
                .json(&request)
                .send()
                .await?;
            let response: PushResponse = check_status(response).await?.json().await?;

            let acked: Vec<(String, i64)> = sequences
                .iter()
                .filter(|(id, _)| response.accepted.contains(id))
                .cloned()
                .collect();
            let marked = self.with_store(move |store, _| store.mark_synced(&acked)).await?;

            total += marked as u64;
            self.update_status(|s| s.pushed += marked as u64);

            // 有被拒绝的或已是最后一批，留给下一轮
            if response.accepted.len() < sequences.len() || sequences.len() < batch {
                if response.accepted.len() < sequences.len() {
                    tracing::warn!(
                        "⬆️ 远端拒绝了 {} 个文档",
                        sequences.len() - response.accepted.len()
                    );
                }
                break;
            }
        }

        Ok(total)
    }

    async fn pull(&self) -> Result<u64> {
        let batch = self.config.batch_size;
        let url = format!("{}/changes", self.config.endpoint);
        let endpoint = self.config.endpoint.clone();
        let mut total = 0u64;

        loop {
            let key = endpoint.clone();
            let since = self.with_store(move |store, _| store.pull_checkpoint(&key)).await?;

            let mut request = self
                .http
                .get(&url)
                .basic_auth(&self.config.username, Some(&self.config.password))
                .query(&[("limit", batch.to_string())]);
            if let Some(since) = &since {
                request = request.query(&[("since", since)]);
            }

            let response: ChangesResponse = check_status(request.send().await?).await?.json().await?;
            let checkpoint = response.checkpoint();
            let received = response.results.len();

            if received > 0 {
                self.update_status(|s| s.activity = ActivityLevel::Busy);
                tracing::debug!("⬇️ pull {} docs since {:?}", received, since);
            }

            let key = endpoint.clone();
            let next = checkpoint.clone();
            let applied = self
                .with_store(move |store, c| {
                    let mut applied = 0u64;
                    for doc in response.results.iter().filter(|d| d.belongs_to(c)) {
                        if store.apply_remote(c, doc)? == super::conflict::Resolution::AcceptRemote {
                            applied += 1;
                        }
                    }
                    if let Some(next) = &next {
                        store.set_pull_checkpoint(&key, next)?;
                    }
                    Ok(applied)
                })
                .await?;

            total += applied;
            self.update_status(|s| s.pulled += applied);

            if received < batch || checkpoint.is_none() || checkpoint == since {
                break;
            }
        }

        Ok(total)
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&LocalStore, &CollectionSpec) -> Result<T> + Send + 'static,
    {
        let store = self.store.clone();
        let collection = self.collection.clone();
        tokio::task::spawn_blocking(move || f(&store, &collection))
            .await
            .map_err(|e| Error::Runtime(format!("存储任务失败: {}", e)))?
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(Error::Sync(format!("认证失败: {}", response.status())))
        }
        status => {
            let message = response.text().await.unwrap_or_default();
            Err(Error::Sync(format!("远端返回 {}: {}", status, message)))
        }
    }
}
