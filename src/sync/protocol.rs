//! 同步线协议
//!
//! JSON over HTTP，basic auth：
//!
//! - `POST {endpoint}/push`  请求 [`PushRequest`]，响应 [`PushResponse`]
//! - `GET  {endpoint}/changes?since=<checkpoint>&limit=N`  响应 [`ChangesResponse`]

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 线上的文档表示
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    /// 存储内部 ID
    pub id: String,
    pub scope: String,
    pub collection: String,
    pub revision: i64,
    #[serde(default)]
    pub deleted: bool,
    /// 删除时为 null
    #[serde(default)]
    pub body: Value,
}

impl RemoteDocument {
    /// 是否属于指定 collection
    pub fn belongs_to(&self, collection: &crate::types::CollectionSpec) -> bool {
        self.scope == collection.scope && self.collection == collection.name
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub docs: Vec<RemoteDocument>,
}

/// 推送响应：远端接受的文档 ID
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushResponse {
    #[serde(default)]
    pub accepted: Vec<String>,
}

/// 变更拉取响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesResponse {
    #[serde(default)]
    pub results: Vec<RemoteDocument>,
    /// 下一次拉取的起点，数字或字符串
    #[serde(default)]
    pub last_seq: Value,
}

impl ChangesResponse {
    /// 规整为字符串形式的检查点
    pub fn checkpoint(&self) -> Option<String> {
        match &self.last_seq {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }
}
