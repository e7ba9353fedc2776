//! 数据库 Schema 定义

/// 核心 Schema SQL
pub const SCHEMA_SQL: &str = r#"
-- Collections 注册表 (scope + name)
CREATE TABLE IF NOT EXISTS collections (
    scope TEXT NOT NULL,
    name TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000),
    PRIMARY KEY (scope, name)
);

-- Documents 表 (JSON body，按 scope/collection 分区)
CREATE TABLE IF NOT EXISTS documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    doc_id TEXT NOT NULL UNIQUE,      -- 存储内部 ID (uuid)
    scope TEXT NOT NULL,
    collection TEXT NOT NULL,
    body TEXT NOT NULL,               -- JSON
    revision INTEGER NOT NULL DEFAULT 1,
    sequence INTEGER NOT NULL,        -- 全库单调递增的变更序号
    deleted INTEGER NOT NULL DEFAULT 0,
    synced INTEGER NOT NULL DEFAULT 0, -- 0 = 待推送
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now') * 1000)
);

-- 索引
CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(scope, collection, deleted);
CREATE INDEX IF NOT EXISTS idx_documents_sequence ON documents(sequence);
CREATE INDEX IF NOT EXISTS idx_documents_pending ON documents(scope, collection, sequence) WHERE synced = 0;
"#;

/// 全文索引注册表 Schema (索引本身由 search 模块按需创建)
pub const FTS_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS fts_indexes (
    name TEXT PRIMARY KEY,
    scope TEXT NOT NULL,
    collection TEXT NOT NULL,
    fields TEXT NOT NULL,     -- JSON 数组
    language TEXT,
    ignore_accents INTEGER NOT NULL DEFAULT 0
);
"#;

/// 同步检查点 Schema
pub const REPLICATION_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS replication_checkpoints (
    endpoint TEXT PRIMARY KEY,
    pull_since TEXT,
    updated_at INTEGER NOT NULL
);
"#;

/// 获取完整 Schema
pub fn full_schema() -> String {
    [SCHEMA_SQL, FTS_SCHEMA_SQL, REPLICATION_SCHEMA_SQL].concat()
}
