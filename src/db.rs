//! 本地文档存储
//!
//! SQLite 之上的文档集合：按 scope/collection 分区的 JSON 文档、
//! 声明式查询、全文索引和提交后变更通知。

use crate::config::DbConfig;
use crate::error::{Error, Result};
use crate::live::{ChangeFeed, LiveQuery};
use crate::migrations;
use crate::query::{Parameters, Query};
use crate::schema;
use crate::types::{ChangeEvent, ChangeKind, ChangeOrigin, CollectionSpec, Document, ResultRow};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;

/// 本地存储句柄
#[derive(Debug)]
pub struct LocalStore {
    pub(crate) conn: Arc<Mutex<Connection>>,
    pub(crate) feed: ChangeFeed,
    name: String,
}

impl LocalStore {
    /// 打开（或创建）数据库
    ///
    /// 失败时返回 [`Error::StoreOpen`]，调用方应视为致命错误。
    pub fn open(config: &DbConfig) -> Result<Self> {
        Self::open_path(config.path()).map_err(|e| Error::StoreOpen {
            path: config.path().clone(),
            source: Box::new(e),
        })
    }

    fn open_path(path: &Path) -> Result<Self> {
        // 确保目录存在
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("store")
            .to_string();

        let store = Self::init(conn, name)?;
        tracing::info!("数据库已连接: {:?}", path);
        Ok(store)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, "memory".to_string())
    }

    fn init(conn: Connection, name: String) -> Result<Self> {
        // 迁移先于 schema，为老数据库补齐缺失的列
        migrations::run_migrations(&conn)?;

        let full_schema = schema::full_schema();
        conn.execute_batch(&full_schema)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            feed: ChangeFeed::new(),
            name,
        })
    }

    /// 数据库名
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 获取底层连接 (用于测试)
    #[doc(hidden)]
    pub fn connection(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    /// 订阅已提交的变更
    pub fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }

    // ==================== Collection 操作 ====================

    /// 创建 collection（已存在时直接返回）
    pub fn create_collection(&self, scope: &str, name: &str) -> Result<CollectionSpec> {
        validate_collection_name(scope)?;
        validate_collection_name(name)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO collections (scope, name, created_at) VALUES (?1, ?2, ?3)",
            params![scope, name, current_time_ms()],
        )?;

        Ok(CollectionSpec::new(scope, name))
    }

    /// 获取 collection
    pub fn collection(&self, scope: &str, name: &str) -> Result<Option<CollectionSpec>> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM collections WHERE scope = ?1 AND name = ?2",
                params![scope, name],
                |row| row.get(0),
            )
            .optional()?;

        Ok(found.map(|_| CollectionSpec::new(scope, name)))
    }

    /// 所有 collections
    pub fn collections(&self) -> Result<Vec<CollectionSpec>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT scope, name FROM collections ORDER BY scope, name")?;
        let rows = stmt.query_map([], |row| {
            Ok(CollectionSpec {
                scope: row.get(0)?,
                name: row.get(1)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ==================== Document 操作 ====================

    /// 读取文档（已删除视为不存在）
    pub fn document(&self, collection: &CollectionSpec, id: &str) -> Result<Option<Document>> {
        let conn = self.conn.lock();
        let row: Option<(String, String, i64, i64)> = conn
            .query_row(
                r#"
                SELECT doc_id, body, revision, sequence FROM documents
                WHERE scope = ?1 AND collection = ?2 AND doc_id = ?3 AND deleted = 0
                "#,
                params![collection.scope, collection.name, id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        match row {
            Some((id, body, revision, sequence)) => Ok(Some(Document {
                id,
                body: serde_json::from_str(&body)?,
                revision,
                sequence,
            })),
            None => Ok(None),
        }
    }

    /// 保存文档 (插入或更新)
    ///
    /// 单个事务内完成；成功后更新 `doc` 的 revision/sequence 并发出变更事件。
    pub fn save(&self, collection: &CollectionSpec, doc: &mut Document) -> Result<()> {
        let body = serde_json::to_string(&doc.body)?;

        let event = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            ensure_collection(&tx, collection)?;

            let sequence = next_sequence(&tx)?;
            let now = current_time_ms();

            let existing: Option<(i64, bool)> = tx
                .query_row(
                    "SELECT revision, deleted FROM documents WHERE doc_id = ?1 AND scope = ?2 AND collection = ?3",
                    params![doc.id, collection.scope, collection.name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let (revision, kind) = match existing {
                Some((revision, deleted)) => {
                    tx.execute(
                        r#"
                        UPDATE documents SET body = ?1, revision = ?2, sequence = ?3,
                            deleted = 0, synced = 0, updated_at = ?4
                        WHERE doc_id = ?5
                        "#,
                        params![body, revision + 1, sequence, now, doc.id],
                    )?;
                    let kind = if deleted { ChangeKind::Insert } else { ChangeKind::Update };
                    (revision + 1, kind)
                }
                None => {
                    tx.execute(
                        r#"
                        INSERT INTO documents (doc_id, scope, collection, body, revision, sequence, deleted, synced, updated_at)
                        VALUES (?1, ?2, ?3, ?4, 1, ?5, 0, 0, ?6)
                        "#,
                        params![doc.id, collection.scope, collection.name, body, sequence, now],
                    )?;
                    (1, ChangeKind::Insert)
                }
            };

            tx.commit()?;

            doc.revision = revision;
            doc.sequence = sequence;

            ChangeEvent {
                sequence,
                doc_id: doc.id.clone(),
                scope: collection.scope.clone(),
                collection: collection.name.clone(),
                kind,
                origin: ChangeOrigin::Local,
            }
        };

        self.feed.publish(event);
        Ok(())
    }

    /// 删除文档（保留墓碑用于同步）
    ///
    /// 返回是否真的删除了文档。
    pub fn delete(&self, collection: &CollectionSpec, doc: &Document) -> Result<bool> {
        let event = {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let sequence = next_sequence(&tx)?;

            let affected = tx.execute(
                r#"
                UPDATE documents SET deleted = 1, body = '{}', revision = revision + 1,
                    sequence = ?1, synced = 0, updated_at = ?2
                WHERE doc_id = ?3 AND scope = ?4 AND collection = ?5 AND deleted = 0
                "#,
                params![sequence, current_time_ms(), doc.id, collection.scope, collection.name],
            )?;
            tx.commit()?;

            if affected == 0 {
                return Ok(false);
            }

            ChangeEvent {
                sequence,
                doc_id: doc.id.clone(),
                scope: collection.scope.clone(),
                collection: collection.name.clone(),
                kind: ChangeKind::Delete,
                origin: ChangeOrigin::Local,
            }
        };

        self.feed.publish(event);
        Ok(true)
    }

    /// collection 中未删除的文档数
    pub fn count(&self, collection: &CollectionSpec) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE scope = ?1 AND collection = ?2 AND deleted = 0",
            params![collection.scope, collection.name],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    // ==================== 查询 ====================

    /// 一次性执行查询
    pub fn execute(&self, query: &Query, params: &Parameters) -> Result<Vec<ResultRow>> {
        let compiled = query.compile(params)?;
        let conn = self.conn.lock();
        execute_compiled(&conn, &compiled.sql, &compiled.params)
    }

    /// 查询计划（EXPLAIN QUERY PLAN）
    pub fn explain(&self, query: &Query, params: &Parameters) -> Result<String> {
        let compiled = query.compile(params)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("EXPLAIN QUERY PLAN {}", compiled.sql))?;
        let rows = stmt.query_map(params_from_iter(compiled.params.iter()), |row| {
            row.get::<_, String>(3)
        })?;

        let lines = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(format!("{}\n{}", compiled.sql, lines.join("\n")))
    }

    /// 注册 live query
    ///
    /// 查询在注册时编译并校验（SQL prepare），失败直接返回错误，不会留下监听。
    /// 需要在 tokio runtime 中调用。
    pub fn subscribe(&self, query: &Query, params: Parameters) -> Result<LiveQuery> {
        let compiled = query.compile(&params)?;
        {
            let conn = self.conn.lock();
            conn.prepare(&compiled.sql)?;
        }

        LiveQuery::spawn(
            self.conn.clone(),
            self.feed.subscribe(),
            query.collection().clone(),
            compiled,
        )
    }
}

/// 执行已编译的查询
pub(crate) fn execute_compiled(
    conn: &Connection,
    sql: &str,
    binds: &[rusqlite::types::Value],
) -> Result<Vec<ResultRow>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params_from_iter(binds.iter()), |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut results = Vec::new();
    for row in rows {
        let (id, body) = row?;
        // body 由 save 写入，总是合法 JSON；外部直接写坏的行按 Null 处理，交给上层解码跳过
        let body = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
        results.push(ResultRow { id, body });
    }

    Ok(results)
}

/// 下一个全库变更序号
pub(crate) fn next_sequence(tx: &Transaction<'_>) -> Result<i64> {
    let max: i64 = tx.query_row(
        "SELECT COALESCE(MAX(sequence), 0) FROM documents",
        [],
        |row| row.get(0),
    )?;
    Ok(max + 1)
}

pub(crate) fn ensure_collection(tx: &Transaction<'_>, collection: &CollectionSpec) -> Result<()> {
    let exists: Option<i64> = tx
        .query_row(
            "SELECT 1 FROM collections WHERE scope = ?1 AND name = ?2",
            params![collection.scope, collection.name],
            |row| row.get(0),
        )
        .optional()?;

    if exists.is_none() {
        return Err(Error::Config(format!("collection 不存在: {}", collection)));
    }
    Ok(())
}

fn validate_collection_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 251
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '%'));

    if !valid {
        return Err(Error::Config(format!("非法 scope/collection 名: {:?}", name)));
    }
    Ok(())
}

/// 获取当前时间戳 (毫秒)
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hotels(store: &LocalStore) -> CollectionSpec {
        store.create_collection("inventory", "hotel").unwrap()
    }

    #[test]
    fn test_create_collection_idempotent() {
        let store = LocalStore::open_in_memory().unwrap();
        let a = store.create_collection("inventory", "hotel").unwrap();
        let b = store.create_collection("inventory", "hotel").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.collections().unwrap().len(), 1);
        assert!(store.collection("inventory", "airline").unwrap().is_none());
    }

    #[test]
    fn test_invalid_collection_name() {
        let store = LocalStore::open_in_memory().unwrap();
        assert!(store.create_collection("inventory", "ho tel").is_err());
        assert!(store.create_collection("", "hotel").is_err());
    }

    #[test]
    fn test_save_assigns_revision_and_sequence() {
        let store = LocalStore::open_in_memory().unwrap();
        let c = hotels(&store);

        let mut doc = Document::new(json!({"type": "hotel", "name": "A"}));
        assert!(doc.is_new());
        store.save(&c, &mut doc).unwrap();
        assert_eq!(doc.revision, 1);
        let first_seq = doc.sequence;

        doc.set_body(json!({"type": "hotel", "name": "B"}));
        store.save(&c, &mut doc).unwrap();
        assert_eq!(doc.revision, 2);
        assert!(doc.sequence > first_seq);

        let loaded = store.document(&c, &doc.id).unwrap().unwrap();
        assert_eq!(loaded.body["name"], "B");
        assert_eq!(loaded.revision, 2);
    }

    #[test]
    fn test_save_into_missing_collection_fails() {
        let store = LocalStore::open_in_memory().unwrap();
        let c = CollectionSpec::new("inventory", "hotel");
        let mut doc = Document::new(json!({}));
        assert!(matches!(store.save(&c, &mut doc), Err(Error::Config(_))));
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let store = LocalStore::open_in_memory().unwrap();
        let c = hotels(&store);

        let mut doc = Document::new(json!({"type": "hotel", "name": "A"}));
        store.save(&c, &mut doc).unwrap();
        assert_eq!(store.count(&c).unwrap(), 1);

        assert!(store.delete(&c, &doc).unwrap());
        assert_eq!(store.count(&c).unwrap(), 0);
        assert!(store.document(&c, &doc.id).unwrap().is_none());

        // 第二次删除是 no-op
        assert!(!store.delete(&c, &doc).unwrap());

        let tombstones: i64 = store
            .connection()
            .lock()
            .query_row("SELECT COUNT(*) FROM documents WHERE deleted = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(tombstones, 1);
    }

    #[test]
    fn test_change_events_after_commit() {
        let store = LocalStore::open_in_memory().unwrap();
        let c = hotels(&store);
        let mut rx = store.changes();

        let mut doc = Document::new(json!({"name": "A"}));
        store.save(&c, &mut doc).unwrap();
        store.save(&c, &mut doc).unwrap();
        store.delete(&c, &doc).unwrap();

        let kinds: Vec<ChangeKind> = (0..3).map(|_| rx.try_recv().unwrap().kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]);
    }
}
