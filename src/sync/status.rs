//! 同步状态

use serde::Serialize;

/// 同步活动级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    /// 未启动或已停止
    #[default]
    Stopped,
    /// 上一轮失败，等待重试
    Offline,
    /// 首轮同步进行中
    Connecting,
    /// 已追平，等待变更
    Idle,
    /// 正在传输
    Busy,
}

/// 同步状态快照
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ReplicatorStatus {
    pub activity: ActivityLevel,
    /// 累计推送文档数
    pub pushed: u64,
    /// 累计拉取并应用的文档数
    pub pulled: u64,
    /// 最近一次错误
    pub last_error: Option<String>,
}

impl ReplicatorStatus {
    pub fn is_running(&self) -> bool {
        self.activity != ActivityLevel::Stopped
    }
}
