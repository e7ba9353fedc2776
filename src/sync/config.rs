//! 同步配置
//!
//! 配置来自外部 provider；缺失是可恢复错误（同步不启动，存储照常可用）。

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// 同步方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicatorType {
    /// 双向
    #[default]
    PushAndPull,
    /// 只推送本地变更
    Push,
    /// 只拉取远端变更
    Pull,
}

impl ReplicatorType {
    pub fn pushes(&self) -> bool {
        matches!(self, ReplicatorType::PushAndPull | ReplicatorType::Push)
    }

    pub fn pulls(&self) -> bool {
        matches!(self, ReplicatorType::PushAndPull | ReplicatorType::Pull)
    }
}

/// 失败重试退避
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryConfig {
    /// 第 `attempt` 次失败后的等待时间（指数退避，封顶 max_delay）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

/// 同步配置
#[derive(Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// 远端地址 (http/https)
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub replicator_type: ReplicatorType,
    /// 持续同步；false 时同步一轮后停止
    pub continuous: bool,
    /// 空闲时拉取间隔
    pub poll_interval: Duration,
    /// 请求超时
    pub timeout: Duration,
    /// 单批文档数
    pub batch_size: usize,
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// 持续、双向同步
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            replicator_type: ReplicatorType::PushAndPull,
            continuous: true,
            poll_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
            batch_size: 100,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_replicator_type(mut self, replicator_type: ReplicatorType) -> Self {
        self.replicator_type = replicator_type;
        self
    }

    pub fn with_continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// 校验地址与凭据
    pub fn validate(&self) -> Result<()> {
        let scheme = self
            .endpoint
            .split_once("://")
            .map(|(scheme, rest)| (scheme, rest.is_empty()));

        match scheme {
            Some(("http", false)) | Some(("https", false)) => {}
            _ => {
                return Err(Error::Config(format!(
                    "同步地址必须是 http(s) URL: {:?}",
                    self.endpoint
                )))
            }
        }

        if self.username.is_empty() {
            return Err(Error::Config("同步用户名为空".into()));
        }

        Ok(())
    }
}

// 不打印密码
impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"***")
            .field("replicator_type", &self.replicator_type)
            .field("continuous", &self.continuous)
            .field("poll_interval", &self.poll_interval)
            .field("timeout", &self.timeout)
            .field("batch_size", &self.batch_size)
            .field("retry", &self.retry)
            .finish()
    }
}

/// 同步配置来源
pub trait SyncConfigProvider: Send + Sync {
    /// 读取配置；缺失时返回 [`Error::Config`]
    fn sync_config(&self) -> Result<SyncConfig>;
}

impl SyncConfigProvider for Option<SyncConfig> {
    fn sync_config(&self) -> Result<SyncConfig> {
        self.clone()
            .ok_or_else(|| Error::Config("未提供同步配置".into()))
    }
}

/// 环境变量配置
///
/// - `TRAVEL_SAMPLE_SYNC_URL`
/// - `TRAVEL_SAMPLE_SYNC_USERNAME`
/// - `TRAVEL_SAMPLE_SYNC_PASSWORD`
#[derive(Debug, Clone, Default)]
pub struct EnvSyncConfig;

impl SyncConfigProvider for EnvSyncConfig {
    fn sync_config(&self) -> Result<SyncConfig> {
        let var = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| Error::Config(format!("缺少环境变量 {}", name)))
        };

        Ok(SyncConfig::new(
            var("TRAVEL_SAMPLE_SYNC_URL")?,
            var("TRAVEL_SAMPLE_SYNC_USERNAME")?,
            var("TRAVEL_SAMPLE_SYNC_PASSWORD")?,
        ))
    }
}

/// JSON 文件配置
///
/// ```json
/// { "endpointURL": "https://sync.example.com/travel", "username": "demo", "password": "secret" }
/// ```
///
/// `capellaEndpointURL` 作为 `endpointURL` 的别名接受。
#[derive(Debug, Clone)]
pub struct FileSyncConfig {
    path: PathBuf,
}

#[derive(Deserialize)]
struct FileConfigModel {
    #[serde(rename = "endpointURL", alias = "capellaEndpointURL")]
    endpoint_url: String,
    username: String,
    password: String,
}

impl FileSyncConfig {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// 默认位置: `<config_dir>/travel-sample/sync.json`
    pub fn default_location() -> Option<Self> {
        dirs::config_dir().map(|d| Self::new(d.join("travel-sample").join("sync.json")))
    }
}

impl SyncConfigProvider for FileSyncConfig {
    fn sync_config(&self) -> Result<SyncConfig> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::Config(format!("无法读取同步配置 {:?}: {}", self.path, e))
        })?;
        let model: FileConfigModel = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("同步配置格式错误 {:?}: {}", self.path, e)))?;

        Ok(SyncConfig::new(model.endpoint_url, model.username, model.password))
    }
}
