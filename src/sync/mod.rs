//! 同步代理
//!
//! 本地存储与远端端点之间的持续双向复制。

pub mod config;
pub mod conflict;
pub mod protocol;
pub mod status;
mod store;

#[cfg(feature = "sync")]
mod replicator;

pub use config::{EnvSyncConfig, FileSyncConfig, ReplicatorType, RetryConfig, SyncConfig, SyncConfigProvider};
pub use conflict::{LocalState, Resolution};
pub use protocol::{ChangesResponse, PushRequest, PushResponse, RemoteDocument};
pub use status::{ActivityLevel, ReplicatorStatus};
pub use store::PendingChange;

#[cfg(feature = "sync")]
pub use replicator::Replicator;
