//! 数据库配置

use std::path::PathBuf;

/// 默认数据库名
pub const DEFAULT_DB_NAME: &str = "travel-sample";

/// 本地存储配置
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// SQLite 文件路径
    pub path: PathBuf,
}

impl DbConfig {
    /// 指定文件路径
    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// 按名称定位数据库: `<data_dir>/travel-sample/<name>.db`
    pub fn named(name: &str) -> Self {
        let base = dirs::data_dir()
            .or_else(dirs::home_dir)
            .map(|d| d.join("travel-sample"))
            .unwrap_or_else(|| PathBuf::from("."));

        Self::local(base.join(format!("{}.db", name)))
    }

    /// 从环境变量或默认路径创建配置
    pub fn from_env() -> Self {
        if let Ok(path) = std::env::var("TRAVEL_SAMPLE_DB_PATH") {
            if !path.trim().is_empty() {
                return Self::local(path);
            }
        }

        Self::named(DEFAULT_DB_NAME)
    }

    /// 数据库文件路径
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_config_uses_db_extension() {
        let config = DbConfig::named("travel-sample");
        let file = config.path().file_name().unwrap().to_str().unwrap();
        assert_eq!(file, "travel-sample.db");
        assert!(config
            .path()
            .parent()
            .unwrap()
            .ends_with("travel-sample"));
    }

    #[test]
    fn test_local_config_keeps_path() {
        let config = DbConfig::local("/tmp/hotels/test.db");
        assert_eq!(config.path(), &PathBuf::from("/tmp/hotels/test.db"));
    }
}
