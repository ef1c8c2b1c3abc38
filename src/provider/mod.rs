//! Collaborators the engine consumes.
//!
//! The resolver never talks to a database or document store directly. It goes
//! through these traits:
//!
//! - [`EntityStore`] answers dot-path lookups on one entity.
//! - [`QueryEngine`] runs SQL fragments and aggregate descriptors with bound
//!   named parameters.
//! - [`OutputRenderer`] turns assembled rows into a delivered output.
//!
//! In-memory implementations live in [`memory`]; [`sqlite`] backs the query
//! engine with rusqlite.

pub mod memory;
pub mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{
    AggregateFunction, OutputFormat, OutputReference, OutputSpec, ReportTemplate, ResolvedRow,
    Row, Value,
};

pub use memory::{MemoryEntityStore, MemoryQueryEngine};
pub use sqlite::SqliteQueryEngine;

/// Errors raised by collaborators.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("entity '{0}' not found")]
    EntityNotFound(String),

    /// `segment` is the zero-based index of the first missing path segment.
    #[error("path '{path}' not found on entity '{entity_id}' (segment {segment})")]
    PathNotFound {
        entity_id: String,
        path: String,
        segment: usize,
    },

    #[error("query failed: {0}")]
    Query(String),

    #[error("render failed: {0}")]
    Render(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Named parameters bound to a query. Values are always passed to the engine
/// as bound values, never spliced into the query text.
pub type BoundParameters = BTreeMap<String, Value>;

/// Entity/attribute access.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Look up a dot path (`customer.address.city`) on an entity.
    async fn get(&self, entity_id: &str, path: &str) -> ProviderResult<Value>;
}

/// Aggregate over one table, rendered to SQL by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateQuery {
    pub function: AggregateFunction,
    pub table: String,
    /// `None` aggregates over `*` (only meaningful for `count`).
    pub column: Option<String>,
    /// SQL predicate; may reference bound `:name` parameters.
    pub filter: Option<String>,
    pub group_by: Vec<String>,
}

impl AggregateQuery {
    /// Column the aggregate value is returned under.
    pub const VALUE_COLUMN: &'static str = "value";
}

/// What the query engine is asked to run.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryRequest {
    Sql(String),
    Aggregate(AggregateQuery),
}

impl QueryRequest {
    /// Short description used in logs and error messages.
    pub fn describe(&self) -> String {
        match self {
            QueryRequest::Sql(sql) => sql.clone(),
            QueryRequest::Aggregate(agg) => format!(
                "{}({}) on {}",
                agg.function.as_sql(),
                agg.column.as_deref().unwrap_or("*"),
                agg.table
            ),
        }
    }
}

/// Query execution.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn execute(
        &self,
        request: &QueryRequest,
        params: &BoundParameters,
    ) -> ProviderResult<Vec<Row>>;
}

/// Everything a renderer gets for one execution.
#[derive(Debug, Clone, Copy)]
pub struct RenderInput<'a> {
    pub execution_id: &'a str,
    pub template: &'a ReportTemplate,
    pub rows: &'a [ResolvedRow],
    /// The execution failed and the rows are incomplete.
    pub partial: bool,
}

/// Output rendering and delivery.
#[async_trait]
pub trait OutputRenderer: Send + Sync {
    fn format(&self) -> OutputFormat;

    async fn render(
        &self,
        input: RenderInput<'_>,
        output: &OutputSpec,
    ) -> ProviderResult<OutputReference>;
}
