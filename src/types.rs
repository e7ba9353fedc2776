//! 数据类型定义

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Collection 标识 (scope + name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub scope: String,
    pub name: String,
}

impl CollectionSpec {
    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CollectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.scope, self.name)
    }
}

/// 存储中的文档
///
/// `revision == 0` 表示尚未保存的新文档。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// 存储内部 ID
    pub id: String,
    /// JSON body
    pub body: Value,
    /// 修订号，每次保存递增
    pub revision: i64,
    /// 最近一次写入的全库序号
    pub sequence: i64,
}

impl Document {
    /// 新文档（生成内部 ID）
    pub fn new(body: Value) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), body)
    }

    /// 指定内部 ID 的新文档
    pub fn with_id(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
            revision: 0,
            sequence: 0,
        }
    }

    /// 替换 body，保留内部 ID 与修订链
    pub fn set_body(&mut self, body: Value) {
        self.body = body;
    }

    pub fn is_new(&self) -> bool {
        self.revision == 0
    }
}

/// 查询结果行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    /// 文档内部 ID
    pub id: String,
    /// 文档 body
    pub body: Value,
}

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// 变更来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOrigin {
    /// 本地 CRUD
    Local,
    /// 同步拉取
    Remote,
}

/// 已提交的变更事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub sequence: i64,
    pub doc_id: String,
    pub scope: String,
    pub collection: String,
    pub kind: ChangeKind,
    pub origin: ChangeOrigin,
}

impl ChangeEvent {
    /// 是否属于指定 collection
    pub fn affects(&self, collection: &CollectionSpec) -> bool {
        self.scope == collection.scope && self.collection == collection.name
    }
}
