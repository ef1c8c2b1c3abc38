//! SQLite-backed query engine.
//!
//! SQL fields run as prepared statements with named (`:name`) parameters.
//! Aggregate descriptors are rendered to SQL with quoted identifiers; only the
//! optional filter is author-supplied SQL, and it sees the same bound
//! parameters.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::types::{ToSql, Value as SqlValue};
use rusqlite::Connection;

use super::{
    AggregateQuery, BoundParameters, ProviderError, ProviderResult, QueryEngine, QueryRequest,
};
use crate::model::{AggregateFunction, Row, Value};

pub struct SqliteQueryEngine {
    conn: Mutex<Connection>,
}

impl SqliteQueryEngine {
    pub fn open(path: impl AsRef<Path>) -> ProviderResult<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open(path)?),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> ProviderResult<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    /// Run a batch of statements, e.g. schema and seed data.
    pub fn execute_batch(&self, sql: &str) -> ProviderResult<()> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }

    fn lock(&self) -> ProviderResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ProviderError::Query("connection lock poisoned".to_string()))
    }

    fn run(&self, sql: &str, params: &BoundParameters) -> ProviderResult<Vec<Row>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;

        // Every placeholder in the statement must be bound; SQLite would
        // otherwise read a missing one as NULL.
        for i in 1..=stmt.parameter_count() {
            if let Some(name) = stmt.parameter_name(i) {
                let bare = name.trim_start_matches(&[':', '@', '$'][..]);
                if !params.contains_key(bare) {
                    return Err(ProviderError::Query(format!(
                        "parameter '{}' is not bound",
                        bare
                    )));
                }
            }
        }

        let mut named: Vec<(String, SqlValue)> = Vec::with_capacity(params.len());
        for (name, value) in params {
            let placeholder = format!(":{}", name);
            if stmt.parameter_index(&placeholder)?.is_some() {
                named.push((placeholder, to_sql_value(value)?));
            }
        }
        let bound: Vec<(&str, &dyn ToSql)> = named
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
            .collect();

        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt.query(bound.as_slice())?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Row::new();
            for (i, column) in columns.iter().enumerate() {
                let value: SqlValue = row.get(i)?;
                record.insert(column.clone(), from_sql_value(value));
            }
            out.push(record);
        }
        Ok(out)
    }
}

#[async_trait]
impl QueryEngine for SqliteQueryEngine {
    async fn execute(
        &self,
        request: &QueryRequest,
        params: &BoundParameters,
    ) -> ProviderResult<Vec<Row>> {
        match request {
            QueryRequest::Sql(sql) => self.run(sql, params),
            QueryRequest::Aggregate(agg) => self.run(&aggregate_sql(agg), params),
        }
    }
}

/// Render an aggregate descriptor to SQL.
pub fn aggregate_sql(agg: &AggregateQuery) -> String {
    let target = match (&agg.column, agg.function) {
        (Some(column), AggregateFunction::CountDistinct) => {
            format!("DISTINCT {}", quote_ident(column))
        }
        (Some(column), _) => quote_ident(column),
        (None, _) => "*".to_string(),
    };

    let mut select: Vec<String> = agg.group_by.iter().map(|c| quote_ident(c)).collect();
    select.push(format!(
        "{}({}) AS {}",
        agg.function.as_sql(),
        target,
        quote_ident(AggregateQuery::VALUE_COLUMN)
    ));

    let mut sql = format!("SELECT {} FROM {}", select.join(", "), quote_ident(&agg.table));
    if let Some(filter) = &agg.filter {
        sql.push_str(&format!(" WHERE ({})", filter));
    }
    if !agg.group_by.is_empty() {
        let groups: Vec<String> = agg.group_by.iter().map(|c| quote_ident(c)).collect();
        sql.push_str(&format!(
            " GROUP BY {} ORDER BY {}",
            groups.join(", "),
            groups.join(", ")
        ));
    }
    sql
}

/// Quote a possibly schema-qualified identifier.
fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

fn to_sql_value(value: &Value) -> ProviderResult<SqlValue> {
    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::List(_) | Value::Object(_) => SqlValue::Text(serde_json::to_string(value)?),
    })
}

fn from_sql_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Int(i),
        SqlValue::Real(f) => Value::Float(f),
        SqlValue::Text(s) => Value::Text(s),
        SqlValue::Blob(b) => Value::Text(String::from_utf8_lossy(&b).into_owned()),
    }
}
