//! 错误类型定义

use std::path::PathBuf;
use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 本地存储无法打开/创建（启动期致命错误，无降级模式）
    #[error("无法打开数据库 {path:?}: {source}")]
    StoreOpen {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    /// 配置错误（可恢复：同步不启动，存储继续可用）
    #[error("配置错误: {0}")]
    Config(String),

    /// 查询编译错误
    #[error("查询错误: {0}")]
    Query(String),

    /// 单行解码失败
    #[error("无法解码 {kind}: {reason}")]
    Decode { kind: &'static str, reason: String },

    /// 记录不存在 (仅在 MissingRecordPolicy::Error 下产生)
    #[error("{kind} 不存在: {key}")]
    NotFound { kind: &'static str, key: String },

    /// 没有可用的 tokio runtime
    #[error("运行时错误: {0}")]
    Runtime(String),

    /// 同步错误
    #[error("同步错误: {0}")]
    Sync(String),

    /// HTTP 错误
    #[cfg(feature = "sync")]
    #[error("HTTP 错误: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// 是否为启动期致命错误
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::StoreOpen { .. })
    }
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
