//! 数据库迁移模块

use rusqlite::{Connection, Result as SqliteResult};
use tracing::{info, warn};

/// 迁移版本
const MIGRATION_VERSION: i64 = 2;

/// 初始化迁移系统
pub fn initialize_migrations(conn: &Connection) -> SqliteResult<()> {
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )
        "#,
        [],
    )?;

    Ok(())
}

/// 获取当前数据库版本
fn get_current_version(conn: &Connection) -> SqliteResult<i64> {
    let version: SqliteResult<Option<i64>> =
        conn.query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
            row.get(0)
        });

    match version {
        Ok(v) => Ok(v.unwrap_or(0)),
        Err(_) => Ok(0),
    }
}

/// 记录迁移版本
fn record_migration(conn: &Connection, version: i64) -> SqliteResult<()> {
    let now = chrono::Utc::now().timestamp_millis();

    conn.execute(
        "INSERT OR REPLACE INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
        [version, now],
    )?;

    Ok(())
}

/// 检查表是否存在
fn table_exists(conn: &Connection, table: &str) -> SqliteResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// 检查列是否存在
fn column_exists(conn: &Connection, table: &str, column: &str) -> SqliteResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let columns = stmt.query_map([], |row| {
        let col_name: String = row.get(1)?;
        Ok(col_name)
    })?;

    for col_name in columns.flatten() {
        if col_name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

/// 迁移 1: documents 表添加同步标记
///
/// 同步功能之前创建的库没有 `synced` 列，已有文档一律视为待推送。
fn migration_001_add_synced_flag(conn: &Connection) -> SqliteResult<()> {
    info!("Running migration 001: Add synced flag");

    // 表不存在时跳过（schema 会创建完整表）
    if !table_exists(conn, "documents")? {
        return Ok(());
    }

    if !column_exists(conn, "documents", "synced")? {
        info!("Adding synced column");
        conn.execute(
            "ALTER TABLE documents ADD COLUMN synced INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }

    Ok(())
}

/// 迁移 2: fts_indexes 添加 ignore_accents
fn migration_002_add_ignore_accents(conn: &Connection) -> SqliteResult<()> {
    info!("Running migration 002: Add ignore_accents to fts_indexes");

    if !table_exists(conn, "fts_indexes")? {
        return Ok(());
    }

    if !column_exists(conn, "fts_indexes", "ignore_accents")? {
        conn.execute(
            "ALTER TABLE fts_indexes ADD COLUMN ignore_accents INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }

    Ok(())
}

/// 执行所有待应用的迁移
pub fn run_migrations(conn: &Connection) -> SqliteResult<()> {
    initialize_migrations(conn)?;

    let current_version = get_current_version(conn)?;

    if current_version >= MIGRATION_VERSION {
        tracing::debug!("Database is up to date (version {})", current_version);
        return Ok(());
    }

    // 事务保证原子性
    let tx = conn.unchecked_transaction()?;

    if current_version < 1 {
        if let Err(e) = migration_001_add_synced_flag(&tx) {
            warn!("Migration 1 failed: {}", e);
            return Err(e);
        }
        record_migration(&tx, 1)?;
    }

    if current_version < 2 {
        if let Err(e) = migration_002_add_ignore_accents(&tx) {
            warn!("Migration 2 failed: {}", e);
            return Err(e);
        }
        record_migration(&tx, 2)?;
    }

    tx.commit()?;

    info!("Migrations applied, current version: {}", MIGRATION_VERSION);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_migrations() {
        let conn = Connection::open_in_memory().unwrap();

        // 模拟同步功能之前的老版本数据库
        conn.execute_batch(
            r#"
            CREATE TABLE documents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                doc_id TEXT NOT NULL UNIQUE,
                scope TEXT NOT NULL,
                collection TEXT NOT NULL,
                body TEXT NOT NULL,
                revision INTEGER NOT NULL DEFAULT 1,
                sequence INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE fts_indexes (
                name TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                collection TEXT NOT NULL,
                fields TEXT NOT NULL,
                language TEXT
            );
            "#,
        )
        .unwrap();

        run_migrations(&conn).unwrap();

        assert!(column_exists(&conn, "documents", "synced").unwrap());
        assert!(column_exists(&conn, "fts_indexes", "ignore_accents").unwrap());
        assert_eq!(get_current_version(&conn).unwrap(), 2);

        // 再次运行应该是幂等的
        run_migrations(&conn).unwrap();
        assert_eq!(get_current_version(&conn).unwrap(), 2);
    }

    #[test]
    fn test_migrations_on_fresh_database() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        assert!(!table_exists(&conn, "documents").unwrap());
        assert_eq!(get_current_version(&conn).unwrap(), 2);
    }
}
