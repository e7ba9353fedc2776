//! hotel-agent - 无界面的酒店列表消费者
//!
//! 打开数据库、发起酒店查询、打印每次发布的列表和同步状态，Ctrl-C 退出。
//!
//! 用法: `hotel-agent [--desc] [搜索词]`

use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use travel_sample_db::{DatabaseManager, EnvSyncConfig, LogErrorReporter, ManagerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("travel_sample_db=debug".parse()?))
        .init();

    tracing::info!("🚀 hotel-agent v{}", env!("CARGO_PKG_VERSION"));

    let mut descending = false;
    let mut search = Vec::new();
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--desc" => descending = true,
            _ => search.push(arg),
        }
    }
    let search = search.join(" ");

    let manager = match DatabaseManager::open(
        ManagerConfig::default(),
        &EnvSyncConfig,
        Arc::new(LogErrorReporter),
    ) {
        Ok(manager) => manager,
        Err(e) => {
            tracing::error!("❌ 无法启动: {}", e);
            std::process::exit(1);
        }
    };

    let mut hotels = manager.hotels();
    manager.query_elements(descending, Some(search.as_str()).filter(|s| !s.is_empty()))?;

    let mut sync_status = manager.sync_status();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = hotels.changed() => {
                if changed.is_err() {
                    break;
                }
                let list = hotels.borrow_and_update().clone();
                tracing::info!("🏨 {} hotels", list.len());
                for hotel in &list {
                    tracing::info!(
                        "  {} ({}{})",
                        hotel.name,
                        hotel.city.as_deref().map(|c| format!("{}, ", c)).unwrap_or_default(),
                        hotel.country
                    );
                }
            }
            status = async {
                match sync_status.as_mut() {
                    Some(rx) => rx.changed().await.map(|_| rx.borrow_and_update().clone()),
                    None => std::future::pending().await,
                }
            } => {
                match status {
                    Ok(status) => tracing::info!(
                        "🔄 sync {:?}: pushed={} pulled={}{}",
                        status.activity,
                        status.pushed,
                        status.pulled,
                        status.last_error.as_ref().map(|e| format!(" error={}", e)).unwrap_or_default()
                    ),
                    Err(_) => sync_status = None,
                }
            }
        }
    }

    manager.shutdown();
    tracing::info!("👋 hotel-agent exiting");
    Ok(())
}
