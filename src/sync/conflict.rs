//! 冲突解决
//!
//! 规则：
//! 1. 修订号高者胜
//! 2. 修订号相同：删除胜
//! 3. 仍相同：远端胜，除非本地副本尚未推送且内容不同，此时本地胜并保持待推送

use serde_json::Value;

use super::protocol::RemoteDocument;

/// 本地副本状态
#[derive(Debug, Clone, PartialEq)]
pub struct LocalState {
    pub revision: i64,
    pub deleted: bool,
    pub synced: bool,
    pub body: Value,
}

/// 解决结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// 写入远端副本
    AcceptRemote,
    /// 保留本地副本，重新标记为待推送
    KeepLocal,
    /// 无需处理
    Skip,
}

pub fn resolve(local: Option<&LocalState>, remote: &RemoteDocument) -> Resolution {
    let local = match local {
        Some(local) => local,
        // 本地没见过的文档被删除，没有可删的
        None if remote.deleted => return Resolution::Skip,
        None => return Resolution::AcceptRemote,
    };

    if remote.revision > local.revision {
        return Resolution::AcceptRemote;
    }
    if remote.revision < local.revision {
        return Resolution::Skip;
    }

    match (local.deleted, remote.deleted) {
        (true, true) => Resolution::Skip,
        (false, true) => Resolution::AcceptRemote,
        (true, false) => Resolution::KeepLocal,
        (false, false) if local.body == remote.body => Resolution::Skip,
        (false, false) if !local.synced => Resolution::KeepLocal,
        (false, false) => Resolution::AcceptRemote,
    }
}
