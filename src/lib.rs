//! travel-sample-db - 酒店示例数据库
//!
//! 本地文档存储 + live query + 持续双向同步，外加一个酒店列表门面。
//!
//! # 核心功能
//!
//! - **文档存储**: 按 scope/collection 分区的 JSON 文档，事务化 CRUD
//! - **声明式查询**: 等值过滤、全文匹配、排序、命名参数
//! - **全文搜索**: FTS5 索引，支持前缀匹配
//! - **Live Query**: 结果集变化时重新投递完整结果集
//! - **同步**: 推送本地变更、拉取远端变更、冲突解决
//!
//! # Feature Flags
//!
//! - `sync` (默认): HTTP 同步器 [`sync::Replicator`]
//!
//! # 架构
//!
//! [`DatabaseManager`] 持有唯一的 [`LocalStore`] 与同步器，维护当前酒店查询，
//! 把结果集以"替换"方式发布到 `watch` 通道。

pub mod config;
pub mod db;
pub mod entity;
pub mod error;
pub mod live;
pub mod manager;
pub mod migrations;
pub mod query;
pub mod schema;
pub mod search;
pub mod sync;
pub mod types;

// Re-exports
pub use config::DbConfig;
pub use db::LocalStore;
pub use entity::{decode, encode, Entity, Hotel};
pub use error::{Error, Result};
pub use live::{ChangeFeed, ListenerToken, LiveQuery, QueryChange, QueryChanges};
pub use manager::{
    DatabaseManager, ErrorReporter, LiveResults, LogErrorReporter, ManagerConfig,
    MissingRecordPolicy,
};
pub use query::{literal, param, Direction, Expr, Operand, Parameters, Query};
pub use search::{prefix_match_expression, FullTextIndexConfig};
pub use sync::{
    ActivityLevel, EnvSyncConfig, FileSyncConfig, ReplicatorStatus, ReplicatorType, SyncConfig,
    SyncConfigProvider,
};
pub use types::*;

#[cfg(feature = "sync")]
pub use sync::Replicator;
