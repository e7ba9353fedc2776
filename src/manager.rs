//! 数据库管理器
//!
//! 进程内唯一的门面：持有本地存储和同步器，维护"当前"酒店列表 live query，
//! 并把解码后的结果集发布给所有观察者。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::DbConfig;
use crate::db::LocalStore;
use crate::entity::{decode, encode, Entity, Hotel, TYPE_FIELD};
use crate::error::{Error, Result};
use crate::live::ListenerToken;
use crate::query::{literal, param, Direction, Expr, Parameters, Query};
use crate::search::{prefix_match_expression, FullTextIndexConfig};
use crate::sync::{ReplicatorStatus, SyncConfigProvider};
use crate::types::{CollectionSpec, Document, ResultRow};

#[cfg(feature = "sync")]
use crate::sync::Replicator;

/// 酒店所在 scope
pub const INVENTORY_SCOPE: &str = "inventory";
/// 酒店 collection
pub const HOTEL_COLLECTION: &str = "hotel";
/// 酒店名全文索引
pub const HOTEL_NAME_INDEX: &str = "hotelNameIndex";

/// 更新/删除找不到记录时的行为
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingRecordPolicy {
    /// 静默 no-op
    #[default]
    Ignore,
    /// 返回 [`Error::NotFound`]
    Error,
}

/// 管理器配置
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub db: DbConfig,
    /// 是否尝试启动同步
    pub replication: bool,
    pub missing_record_policy: MissingRecordPolicy,
}

impl ManagerConfig {
    pub fn new(db: DbConfig) -> Self {
        Self {
            db,
            replication: true,
            missing_record_policy: MissingRecordPolicy::default(),
        }
    }

    pub fn with_replication(mut self, enabled: bool) -> Self {
        self.replication = enabled;
        self
    }

    pub fn with_missing_record_policy(mut self, policy: MissingRecordPolicy) -> Self {
        self.missing_record_policy = policy;
        self
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::new(DbConfig::default())
    }
}

/// 面向用户的错误通道（启动致命错误、同步配置错误）
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &Error);
}

/// 只写日志的 reporter
#[derive(Debug, Clone, Default)]
pub struct LogErrorReporter;

impl ErrorReporter for LogErrorReporter {
    fn report(&self, error: &Error) {
        tracing::error!("❌ {}", error);
    }
}

// ==================== Live 结果集 ====================

struct Registration {
    generation: u64,
    query: Query,
    params: Parameters,
    token: ListenerToken,
    pump: JoinHandle<()>,
}

impl Registration {
    /// 先移除监听，再停止转发任务
    fn release(mut self) {
        self.token.remove();
        self.pump.abort();
        tracing::debug!("📡 Query registration released: generation={}", self.generation);
    }
}

#[derive(Default)]
struct Slot {
    generation: u64,
    active: Option<Registration>,
}

/// 单个结果流：至多一个活跃 live query，结果集以"替换"方式发布
///
/// 替换查询与发布都在同一把锁下进行，旧查询的结果在新查询注册后不会再发布。
pub struct LiveResults<T: Entity> {
    slot: Arc<Mutex<Slot>>,
    tx: Arc<watch::Sender<Vec<T>>>,
    runtime: Handle,
}

impl<T: Entity> LiveResults<T> {
    pub fn new(runtime: Handle) -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self {
            slot: Arc::new(Mutex::new(Slot::default())),
            tx: Arc::new(tx),
            runtime,
        }
    }

    /// 最新结果集 + 之后所有更新
    pub fn subscribe(&self) -> watch::Receiver<Vec<T>> {
        self.tx.subscribe()
    }

    /// 当前发布的结果集
    pub fn current(&self) -> Vec<T> {
        self.tx.borrow().clone()
    }

    /// 替换活跃查询
    ///
    /// 旧注册先完全释放；注册失败时不留下任何监听。
    pub fn replace(&self, store: &LocalStore, query: Query, params: Parameters) -> Result<u64> {
        let mut slot = self.slot.lock();

        if let Some(old) = slot.active.take() {
            old.release();
        }
        slot.generation += 1;
        let generation = slot.generation;

        let _guard = self.runtime.enter();
        let live = store.subscribe(&query, params.clone())?;
        let (mut changes, token) = live.into_parts();

        let slot_ref = self.slot.clone();
        let tx = self.tx.clone();
        let pump = self.runtime.spawn(async move {
            while let Some(change) = changes.next().await {
                let rows = match change {
                    Ok(rows) => rows,
                    Err(e) => {
                        tracing::warn!("Live query failed (generation={}): {}", generation, e);
                        continue;
                    }
                };

                let records = decode_rows::<T>(&rows);

                let slot = slot_ref.lock();
                let current = slot.active.as_ref().map(|r| r.generation);
                if current != Some(generation) {
                    return;
                }
                tracing::debug!(
                    "📡 Publishing {} {} records (generation={})",
                    records.len(),
                    T::KIND,
                    generation
                );
                tx.send_replace(records);
            }
        });

        tracing::debug!("📡 Query registered: generation={} {}", generation, query);
        slot.active = Some(Registration {
            generation,
            query,
            params,
            token,
            pump,
        });

        Ok(generation)
    }

    /// 释放活跃查询（幂等）
    pub fn release(&self) {
        let mut slot = self.slot.lock();
        if let Some(old) = slot.active.take() {
            old.release();
        }
    }

    /// 活跃查询的代数
    pub fn generation(&self) -> Option<u64> {
        self.slot.lock().active.as_ref().map(|r| r.generation)
    }

    /// 活跃查询
    pub fn active_query(&self) -> Option<(Query, Parameters)> {
        self.slot
            .lock()
            .active
            .as_ref()
            .map(|r| (r.query.clone(), r.params.clone()))
    }
}

impl<T: Entity> Drop for LiveResults<T> {
    fn drop(&mut self) {
        self.release();
    }
}

/// 解码结果行，跳过无法解码的行
pub fn decode_rows<T: Entity>(rows: &[ResultRow]) -> Vec<T> {
    rows.iter()
        .filter_map(|row| match decode::<T>(&row.body) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("跳过无法解码的文档 {}: {}", row.id, e);
                None
            }
        })
        .collect()
}

// ==================== 管理器 ====================

/// 酒店数据库管理器
pub struct DatabaseManager {
    store: Arc<LocalStore>,
    collection: CollectionSpec,
    hotels: LiveResults<Hotel>,
    policy: MissingRecordPolicy,
    reporter: Arc<dyn ErrorReporter>,
    #[cfg(feature = "sync")]
    replicator: Option<Arc<Replicator>>,
    closed: AtomicBool,
}

impl DatabaseManager {
    /// 打开存储并准备 collection 与索引，然后尝试启动同步
    ///
    /// 存储打开失败是致命错误，直接返回；同步配置缺失只上报，存储照常可用。
    /// 需要在 tokio runtime 中调用。
    pub fn open(
        config: ManagerConfig,
        sync: &dyn SyncConfigProvider,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Runtime(format!("DatabaseManager 需要 tokio runtime: {}", e)))?;

        let store = match Self::setup(&config.db) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                reporter.report(&e);
                return Err(e);
            }
        };
        let collection = CollectionSpec::new(INVENTORY_SCOPE, HOTEL_COLLECTION);

        #[cfg(feature = "sync")]
        let replicator = if config.replication {
            Self::start_sync(&store, &collection, sync, reporter.as_ref())
        } else {
            None
        };

        #[cfg(not(feature = "sync"))]
        if config.replication {
            match sync.sync_config() {
                Ok(_) => tracing::warn!("同步功能未编译，忽略同步配置"),
                Err(e) => reporter.report(&e),
            }
        }

        tracing::info!("🚀 DatabaseManager 已就绪: {}", store.name());

        Ok(Self {
            store,
            collection,
            hotels: LiveResults::new(runtime),
            policy: config.missing_record_policy,
            reporter,
            #[cfg(feature = "sync")]
            replicator,
            closed: AtomicBool::new(false),
        })
    }

    /// 打开存储，确保 collection 与全文索引存在（可重复执行）
    fn setup(db: &DbConfig) -> Result<LocalStore> {
        let store = LocalStore::open(db)?;
        let wrap = |e: Error| Error::StoreOpen {
            path: db.path().clone(),
            source: Box::new(e),
        };

        let collection = store
            .create_collection(INVENTORY_SCOPE, HOTEL_COLLECTION)
            .map_err(wrap)?;
        store
            .create_index(
                &collection,
                HOTEL_NAME_INDEX,
                &FullTextIndexConfig::new(["name"], Some("en")),
            )
            .map_err(wrap)?;

        Ok(store)
    }

    #[cfg(feature = "sync")]
    fn start_sync(
        store: &Arc<LocalStore>,
        collection: &CollectionSpec,
        provider: &dyn SyncConfigProvider,
        reporter: &dyn ErrorReporter,
    ) -> Option<Arc<Replicator>> {
        let started = provider
            .sync_config()
            .and_then(|config| Replicator::new(store.clone(), collection.clone(), config))
            .and_then(|replicator| replicator.start().map(|_| replicator));

        match started {
            Ok(replicator) => Some(replicator),
            Err(e) => {
                tracing::warn!("同步未启动，仅使用本地存储: {}", e);
                reporter.report(&e);
                None
            }
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn collection(&self) -> &CollectionSpec {
        &self.collection
    }

    /// 订阅当前酒店列表：立即得到最新值，之后收到每次替换
    pub fn hotels(&self) -> watch::Receiver<Vec<Hotel>> {
        self.hotels.subscribe()
    }

    /// 当前发布的酒店列表
    pub fn current_hotels(&self) -> Vec<Hotel> {
        self.hotels.current()
    }

    // ==================== 查询 ====================

    /// 重新发起酒店列表查询
    ///
    /// 按名称排序；`text_search` 非空时追加名称前缀全文匹配。
    pub fn query_elements(&self, descending: bool, text_search: Option<&str>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return self.logged("query", Err(Error::Runtime("DatabaseManager 已关闭".into())));
        }

        let (query, params) = self.hotel_list_query(descending, text_search);
        let result = self.hotels.replace(&self.store, query, params).map(|_| ());
        self.logged("query", result)
    }

    fn hotel_list_query(&self, descending: bool, text_search: Option<&str>) -> (Query, Parameters) {
        let mut params = Parameters::new();
        params.set_string("type", Hotel::KIND);

        let mut query = Query::select_all(&self.collection).filter(Expr::equal(TYPE_FIELD, param("type")));

        if let Some(expression) = text_search.and_then(prefix_match_expression) {
            params.set_string("match", expression);
            query = query.filter(Expr::matches(HOTEL_NAME_INDEX, param("match")));
        }

        let query = query.order_by("name", Direction::from_descending(descending));
        (query, params)
    }

    /// 当前查询的执行计划
    pub fn explain_current_query(&self) -> Result<String> {
        let (query, params) = self
            .hotels
            .active_query()
            .ok_or_else(|| Error::Query("没有活跃查询".into()))?;
        self.store.explain(&query, &params)
    }

    // ==================== CRUD 操作 ====================

    /// 新增酒店
    pub fn add_new_element(&self, hotel: &Hotel) -> Result<()> {
        let result = encode(hotel).and_then(|body| {
            let mut doc = Document::new(body);
            self.store.save(&self.collection, &mut doc)
        });
        self.logged("add", result)
    }

    /// 用新内容覆盖 id 相同的酒店，返回更新的文档数
    ///
    /// 多个文档匹配时全部更新。
    pub fn update_existing_element(&self, hotel: &Hotel) -> Result<usize> {
        let result = (|| -> Result<usize> {
            let body = encode(hotel)?;
            let matches = self.find_by("id", hotel.id())?;
            self.check_missing(&matches, hotel.id())?;

            for row in &matches {
                let mut doc = Document::with_id(row.id.clone(), body.clone());
                self.store.save(&self.collection, &mut doc)?;
            }
            Ok(matches.len())
        })();
        self.logged("update", result)
    }

    /// 删除 id 相同的酒店，返回删除的文档数
    pub fn delete_element(&self, hotel: &Hotel) -> Result<usize> {
        let result = self.delete_by("id", hotel.id());
        self.logged("delete", result)
    }

    /// 删除所有同名酒店，返回删除的文档数
    pub fn delete_element_with_name(&self, name: &str) -> Result<usize> {
        let result = self.delete_by("name", name);
        self.logged("delete by name", result)
    }

    fn delete_by(&self, field: &str, value: &str) -> Result<usize> {
        let matches = self.find_by(field, value)?;
        self.check_missing(&matches, value)?;

        let mut deleted = 0;
        for row in &matches {
            let doc = Document::with_id(row.id.clone(), serde_json::Value::Null);
            if self.store.delete(&self.collection, &doc)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    fn find_by(&self, field: &str, value: &str) -> Result<Vec<ResultRow>> {
        let query = Query::select_all(&self.collection)
            .filter(Expr::equal(TYPE_FIELD, literal(Hotel::KIND)))
            .filter(Expr::equal(field, literal(value)));
        self.store.execute(&query, &Parameters::new())
    }

    fn check_missing(&self, matches: &[ResultRow], key: &str) -> Result<()> {
        if !matches.is_empty() {
            return Ok(());
        }
        match self.policy {
            MissingRecordPolicy::Ignore => {
                tracing::debug!("没有匹配的 {}: {}", Hotel::KIND, key);
                Ok(())
            }
            MissingRecordPolicy::Error => Err(Error::NotFound {
                kind: Hotel::KIND,
                key: key.to_string(),
            }),
        }
    }

    fn logged<T>(&self, op: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            tracing::error!("{} 失败: {}", op, e);
        }
        result
    }

    // ==================== 同步 ====================

    /// 同步状态；同步未启动时为 `None`
    pub fn sync_status(&self) -> Option<watch::Receiver<ReplicatorStatus>> {
        #[cfg(feature = "sync")]
        {
            self.replicator.as_ref().map(|r| r.status())
        }
        #[cfg(not(feature = "sync"))]
        {
            None
        }
    }

    /// 错误 reporter
    pub fn reporter(&self) -> &Arc<dyn ErrorReporter> {
        &self.reporter
    }

    // ==================== 生命周期 ====================

    /// 释放活跃查询并停止同步（幂等）
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.hotels.release();

        #[cfg(feature = "sync")]
        if let Some(replicator) = &self.replicator {
            replicator.stop();
        }

        tracing::info!("DatabaseManager 已关闭");
    }

    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for DatabaseManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
