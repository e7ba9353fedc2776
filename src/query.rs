//! 声明式查询
//!
//! 用类型化的 builder 描述 "过滤 + 排序"，编译为带绑定参数的 SQL：
//!
//! ```rust,ignore
//! let query = Query::select_all(&hotels)
//!     .filter(Expr::equal("type", param("type")))
//!     .filter(Expr::matches("hotelNameIndex", param("match")))
//!     .order_by("name", Direction::Asc);
//! ```

use std::collections::BTreeMap;
use std::fmt;

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::search::fts_table_name;
use crate::types::CollectionSpec;

/// 操作数：字面量或命名参数 (`$name`)
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Param(String),
}

/// 命名参数
pub fn param(name: &str) -> Operand {
    Operand::Param(name.to_string())
}

/// 字面量
pub fn literal(value: impl Into<Value>) -> Operand {
    Operand::Literal(value.into())
}

/// 过滤表达式（多个表达式之间为 AND）
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// body 字段等值比较
    Eq { field: String, value: Operand },
    /// 全文索引匹配
    Match { index: String, expr: Operand },
}

impl Expr {
    pub fn equal(field: &str, value: Operand) -> Self {
        Expr::Eq {
            field: field.to_string(),
            value,
        }
    }

    pub fn matches(index: &str, expr: Operand) -> Self {
        Expr::Match {
            index: index.to_string(),
            expr,
        }
    }
}

/// 排序方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    pub fn from_descending(descending: bool) -> Self {
        if descending {
            Direction::Desc
        } else {
            Direction::Asc
        }
    }

    fn as_sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// 绑定参数
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    values: BTreeMap<String, Value>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_string(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.values
            .insert(name.to_string(), Value::String(value.into()));
        self
    }

    pub fn set_value(&mut self, name: &str, value: Value) -> &mut Self {
        self.values.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }
}

/// 查询定义
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    collection: CollectionSpec,
    filters: Vec<Expr>,
    order: Vec<(String, Direction)>,
    limit: Option<u64>,
}

/// 编译后的查询
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Query {
    /// `SELECT * FROM scope.collection`
    pub fn select_all(collection: &CollectionSpec) -> Self {
        Self {
            collection: collection.clone(),
            filters: Vec::new(),
            order: Vec::new(),
            limit: None,
        }
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        self.filters.push(expr);
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order.push((field.to_string(), direction));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn collection(&self) -> &CollectionSpec {
        &self.collection
    }

    /// 编译为 SQL
    pub fn compile(&self, params: &Parameters) -> Result<CompiledQuery> {
        let mut binds: Vec<SqlValue> = vec![
            SqlValue::Text(self.collection.scope.clone()),
            SqlValue::Text(self.collection.name.clone()),
        ];

        let mut sql = String::from(
            "SELECT d.doc_id, d.body FROM documents d \
             WHERE d.scope = ?1 AND d.collection = ?2 AND d.deleted = 0",
        );

        for expr in &self.filters {
            match expr {
                Expr::Eq { field, value } => {
                    binds.push(SqlValue::Text(json_path(field)?));
                    let path_idx = binds.len();
                    binds.push(to_sql_value(resolve(value, params)?)?);
                    sql.push_str(&format!(
                        " AND json_extract(d.body, ?{}) IS ?{}",
                        path_idx,
                        binds.len()
                    ));
                }
                Expr::Match { index, expr } => {
                    let table = fts_table_name(index)?;
                    let expression = match resolve(expr, params)? {
                        Value::String(s) => s.clone(),
                        other => {
                            return Err(Error::Query(format!(
                                "MATCH 表达式必须是字符串: {}",
                                other
                            )))
                        }
                    };
                    binds.push(SqlValue::Text(expression));
                    sql.push_str(&format!(
                        " AND d.id IN (SELECT rowid FROM \"{table}\" WHERE \"{table}\" MATCH ?{})",
                        binds.len()
                    ));
                }
            }
        }

        sql.push_str(" ORDER BY ");
        for (field, direction) in &self.order {
            binds.push(SqlValue::Text(json_path(field)?));
            sql.push_str(&format!(
                "json_extract(d.body, ?{}) {}, ",
                binds.len(),
                direction.as_sql()
            ));
        }
        // 同名时按内部 ID 排序，保证结果稳定
        sql.push_str("d.doc_id ASC");

        if let Some(limit) = self.limit {
            binds.push(SqlValue::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", binds.len()));
        }

        Ok(CompiledQuery { sql, params: binds })
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT * FROM {}", self.collection)?;

        for (i, expr) in self.filters.iter().enumerate() {
            f.write_str(if i == 0 { " WHERE " } else { " AND " })?;
            match expr {
                Expr::Eq { field, value } => write!(f, "{} = {}", field, DisplayOperand(value))?,
                Expr::Match { index, expr } => {
                    write!(f, "MATCH({}, {})", index, DisplayOperand(expr))?
                }
            }
        }

        for (i, (field, direction)) in self.order.iter().enumerate() {
            f.write_str(if i == 0 { " ORDER BY " } else { ", " })?;
            write!(f, "{} {}", field, direction.as_sql())?;
        }

        if let Some(limit) = self.limit {
            write!(f, " LIMIT {}", limit)?;
        }

        Ok(())
    }
}

struct DisplayOperand<'a>(&'a Operand);

impl fmt::Display for DisplayOperand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Operand::Literal(v) => write!(f, "{}", v),
            Operand::Param(name) => write!(f, "${}", name),
        }
    }
}

fn resolve<'a>(operand: &'a Operand, params: &'a Parameters) -> Result<&'a Value> {
    match operand {
        Operand::Literal(v) => Ok(v),
        Operand::Param(name) => params
            .get(name)
            .ok_or_else(|| Error::Query(format!("参数未绑定: ${}", name))),
    }
}

/// 字段名 → JSON path (`name` → `$.name`, `geo.lat` → `$.geo.lat`)
pub(crate) fn json_path(field: &str) -> Result<String> {
    let valid = !field.is_empty()
        && field.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

    if !valid {
        return Err(Error::Query(format!("非法字段名: {:?}", field)));
    }

    Ok(format!("$.{}", field))
}

/// JSON 值 → SQLite 值 (json_extract 对布尔返回 0/1)
fn to_sql_value(value: &Value) -> Result<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or_default())
            }
        }
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => {
            return Err(Error::Query(format!("不支持的比较值: {}", value)))
        }
    })
}
