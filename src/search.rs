//! 全文索引
//!
//! 每个索引是一张 FTS5 虚拟表 `fts_<name>`，由 documents 表上的触发器维护，
//! 只收录所属 collection 中未删除的文档。

use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use crate::db::LocalStore;
use crate::error::{Error, Result};
use crate::query::json_path;
use crate::types::CollectionSpec;

/// 全文索引配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullTextIndexConfig {
    /// 被索引的字段
    pub fields: Vec<String>,
    /// 语言 ("en" 启用 porter 词干)
    pub language: Option<String>,
    /// 忽略变音符号
    pub ignore_accents: bool,
}

impl FullTextIndexConfig {
    pub fn new<I, S>(fields: I, language: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            language: language.map(str::to_string),
            ignore_accents: false,
        }
    }

    pub fn with_ignore_accents(mut self, ignore: bool) -> Self {
        self.ignore_accents = ignore;
        self
    }

    fn tokenizer(&self) -> String {
        let diacritics = if self.ignore_accents { 2 } else { 0 };
        match self.language.as_deref() {
            Some("en") => format!("porter unicode61 remove_diacritics {}", diacritics),
            _ => format!("unicode61 remove_diacritics {}", diacritics),
        }
    }
}

/// 索引名 → FTS5 表名
pub(crate) fn fts_table_name(index: &str) -> Result<String> {
    let valid = !index.is_empty()
        && index
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');

    if !valid {
        return Err(Error::Query(format!("非法索引名: {:?}", index)));
    }

    Ok(format!("fts_{}", index))
}

/// 把用户输入转成 FTS5 前缀匹配表达式
///
/// 每个词用双引号包裹（FTS5 特殊字符 `- . * " ( ) ^ + :` 因此按字面处理），
/// 词之间为 AND，最后一个词追加 `*` 做前缀匹配。空输入返回 `None`。
pub fn prefix_match_expression(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split_whitespace()
        .map(|word| format!("\"{}\"", word.replace('"', "\"\"")))
        .collect();

    if terms.is_empty() {
        return None;
    }

    Some(format!("{}*", terms.join(" ")))
}

fn sql_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn drop_fts_objects(tx: &Transaction<'_>, table: &str) -> Result<()> {
    tx.execute_batch(&format!(
        r#"
        DROP TRIGGER IF EXISTS "{table}_ai";
        DROP TRIGGER IF EXISTS "{table}_ad";
        DROP TRIGGER IF EXISTS "{table}_au";
        DROP TABLE IF EXISTS "{table}";
        "#
    ))?;
    Ok(())
}

/// 生成 FTS 表 + 触发器 DDL
fn fts_ddl(table: &str, collection: &CollectionSpec, config: &FullTextIndexConfig) -> Result<String> {
    let paths = config
        .fields
        .iter()
        .map(|f| json_path(f).map(|p| sql_literal(&p)))
        .collect::<Result<Vec<_>>>()?;

    let columns: Vec<String> = (0..paths.len()).map(|i| format!("c{}", i)).collect();
    let column_list = columns.join(", ");
    let new_values = paths
        .iter()
        .map(|p| format!("json_extract(new.body, {})", p))
        .collect::<Vec<_>>()
        .join(", ");

    let scope = sql_literal(&collection.scope);
    let name = sql_literal(&collection.name);
    let tokenizer = sql_literal(&config.tokenizer());

    Ok(format!(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS "{table}" USING fts5({column_list}, tokenize={tokenizer});

        CREATE TRIGGER IF NOT EXISTS "{table}_ai" AFTER INSERT ON documents
        WHEN new.scope = {scope} AND new.collection = {name} AND new.deleted = 0 BEGIN
            INSERT INTO "{table}"(rowid, {column_list}) VALUES (new.id, {new_values});
        END;

        CREATE TRIGGER IF NOT EXISTS "{table}_ad" AFTER DELETE ON documents
        WHEN old.scope = {scope} AND old.collection = {name} BEGIN
            DELETE FROM "{table}" WHERE rowid = old.id;
        END;

        CREATE TRIGGER IF NOT EXISTS "{table}_au" AFTER UPDATE ON documents
        WHEN new.scope = {scope} AND new.collection = {name} BEGIN
            DELETE FROM "{table}" WHERE rowid = old.id;
            INSERT INTO "{table}"(rowid, {column_list}) SELECT new.id, {new_values} WHERE new.deleted = 0;
        END;
        "#
    ))
}

impl LocalStore {
    /// 创建全文索引
    ///
    /// 同名同定义时为 no-op；定义变化时重建索引。
    pub fn create_index(
        &self,
        collection: &CollectionSpec,
        name: &str,
        config: &FullTextIndexConfig,
    ) -> Result<()> {
        let table = fts_table_name(name)?;
        if config.fields.is_empty() {
            return Err(Error::Config(format!("索引 {} 没有字段", name)));
        }
        let ddl = fts_ddl(&table, collection, config)?;
        let fields_json = serde_json::to_string(&config.fields)?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let existing: Option<(String, String, String, Option<String>, bool)> = tx
            .query_row(
                "SELECT scope, collection, fields, language, ignore_accents FROM fts_indexes WHERE name = ?1",
                params![name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;

        if let Some(existing) = existing {
            let unchanged = existing
                == (
                    collection.scope.clone(),
                    collection.name.clone(),
                    fields_json.clone(),
                    config.language.clone(),
                    config.ignore_accents,
                );
            if unchanged {
                tracing::debug!("Index {} already exists on {}", name, collection);
                return Ok(());
            }

            tracing::info!("Index {} definition changed, rebuilding", name);
            drop_fts_objects(&tx, &table)?;
        }

        tx.execute_batch(&ddl)?;

        // 回填已有文档
        let paths = config
            .fields
            .iter()
            .map(|f| json_path(f).map(|p| format!("json_extract(body, {})", sql_literal(&p))))
            .collect::<Result<Vec<_>>>()?
            .join(", ");
        let columns = (0..config.fields.len())
            .map(|i| format!("c{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        tx.execute(
            &format!(
                r#"INSERT INTO "{table}"(rowid, {columns})
                   SELECT id, {paths} FROM documents
                   WHERE scope = ?1 AND collection = ?2 AND deleted = 0"#
            ),
            params![collection.scope, collection.name],
        )?;

        tx.execute(
            r#"
            INSERT OR REPLACE INTO fts_indexes (name, scope, collection, fields, language, ignore_accents)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                name,
                collection.scope,
                collection.name,
                fields_json,
                config.language,
                config.ignore_accents,
            ],
        )?;

        tx.commit()?;
        tracing::info!("Full-text index {} created on {}", name, collection);
        Ok(())
    }

    /// 删除全文索引
    pub fn delete_index(&self, name: &str) -> Result<()> {
        let table = fts_table_name(name)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        drop_fts_objects(&tx, &table)?;
        tx.execute("DELETE FROM fts_indexes WHERE name = ?1", params![name])?;
        tx.commit()?;
        Ok(())
    }

    /// 列出 collection 上的索引名
    pub fn indexes(&self, collection: &CollectionSpec) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name FROM fts_indexes WHERE scope = ?1 AND collection = ?2 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![collection.scope, collection.name], |row| row.get(0))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_match_single_word() {
        assert_eq!(prefix_match_expression("Beach"), Some("\"Beach\"*".to_string()));
    }

    #[test]
    fn test_prefix_match_multiple_words() {
        assert_eq!(
            prefix_match_expression("  grand   hot "),
            Some("\"grand\" \"hot\"*".to_string())
        );
    }

    #[test]
    fn test_prefix_match_special_characters() {
        assert_eq!(
            prefix_match_expression("say\"hi\""),
            Some("\"say\"\"hi\"\"\"*".to_string())
        );
        assert_eq!(
            prefix_match_expression("st-tropez"),
            Some("\"st-tropez\"*".to_string())
        );
    }

    #[test]
    fn test_prefix_match_empty() {
        assert_eq!(prefix_match_expression(""), None);
        assert_eq!(prefix_match_expression("   "), None);
    }

    #[test]
    fn test_fts_table_name_validation() {
        assert_eq!(fts_table_name("hotelNameIndex").unwrap(), "fts_hotelNameIndex");
        assert!(fts_table_name("bad name").is_err());
        assert!(fts_table_name("x\";DROP").is_err());
        assert!(fts_table_name("").is_err());
    }

    #[test]
    fn test_tokenizer_by_language() {
        let en = FullTextIndexConfig::new(["name"], Some("en"));
        assert_eq!(en.tokenizer(), "porter unicode61 remove_diacritics 0");

        let fr = FullTextIndexConfig::new(["name"], Some("fr")).with_ignore_accents(true);
        assert_eq!(fr.tokenizer(), "unicode61 remove_diacritics 2");
    }
}
