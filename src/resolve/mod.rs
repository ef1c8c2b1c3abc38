//! Field resolution.
//!
//! [`FieldResolver`] turns one [`FieldSpec`] into a [`Value`] for one execution.
//! It reads three things: the execution context (entity id and parameters),
//! the values of fields resolved earlier in the evaluation order, and the
//! collaborators it was built with. It keeps no state between calls.

mod bindings;

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::trace;

use crate::formula::{Formula, FormulaError};
use crate::model::{ExecutionContext, FieldKind, FieldSpec, ResultShape, Row, Value};
use crate::provider::{AggregateQuery, EntityStore, ProviderError, QueryEngine, QueryRequest};

pub use bindings::ResolvedBindings;

/// Errors raised while resolving a single field.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("source path '{path}' not found (missing segment {segment})")]
    SourcePath { path: String, segment: usize },

    #[error("source path '{0}' needs an entity but the execution has none")]
    NoEntity(String),

    #[error("formula evaluation failed: {0}")]
    FormulaEvaluation(#[from] FormulaError),

    #[error("missing required parameter '{0}'")]
    MissingRequiredParameter(String),

    #[error("query parameter '{0}' has no value to bind")]
    UnboundParameter(String),

    #[error("query result does not fit a scalar: {0}")]
    Shape(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

pub type ResolveResult<T> = Result<T, ResolveError>;

/// Already-resolved field values, keyed by field name.
pub type Resolved = BTreeMap<String, Value>;

/// Resolves single fields against the entity store and query engine.
#[derive(Clone)]
pub struct FieldResolver {
    entities: Arc<dyn EntityStore>,
    queries: Arc<dyn QueryEngine>,
}

impl FieldResolver {
    pub fn new(entities: Arc<dyn EntityStore>, queries: Arc<dyn QueryEngine>) -> Self {
        Self { entities, queries }
    }

    pub fn queries(&self) -> &Arc<dyn QueryEngine> {
        &self.queries
    }

    /// Resolve one field. Calculated formulas are parsed on every call; use
    /// [`FieldResolver::resolve_prepared`] to reuse a parsed formula.
    pub async fn resolve(
        &self,
        field: &FieldSpec,
        ctx: &ExecutionContext,
        resolved: &Resolved,
    ) -> ResolveResult<Value> {
        self.resolve_prepared(field, None, ctx, resolved).await
    }

    /// Resolve one field, evaluating `prepared` instead of re-parsing the
    /// field's formula when it is calculated.
    pub async fn resolve_prepared(
        &self,
        field: &FieldSpec,
        prepared: Option<&Formula>,
        ctx: &ExecutionContext,
        resolved: &Resolved,
    ) -> ResolveResult<Value> {
        trace!(field = %field.name, kind = field.kind.as_str(), "resolving field");

        match &field.kind {
            FieldKind::Source { path, optional } => self.resolve_source(path, *optional, ctx).await,

            FieldKind::Calculated { formula, .. } => {
                let parsed;
                let formula = match prepared {
                    Some(f) => f,
                    None => {
                        parsed = Formula::parse(formula)?;
                        &parsed
                    }
                };
                Ok(formula.evaluate(&ResolvedBindings::new(resolved))?)
            }

            FieldKind::Parameter {
                parameter,
                default,
                required,
            } => {
                let name = parameter.as_deref().unwrap_or(&field.name);
                match (ctx.parameters.get(name), default) {
                    (Some(value), _) => Ok(value.clone()),
                    (None, Some(default)) => Ok(default.clone()),
                    (None, None) if *required => {
                        Err(ResolveError::MissingRequiredParameter(name.to_string()))
                    }
                    (None, None) => Ok(Value::Null),
                }
            }

            FieldKind::Sql {
                query,
                bindings,
                shape,
            } => {
                let params = self.bind(bindings, query, ctx, resolved).await?;
                let rows = self
                    .queries
                    .execute(&QueryRequest::Sql(query.clone()), &params)
                    .await?;
                shape_rows(rows, *shape)
            }

            FieldKind::Aggregate {
                function,
                table,
                column,
                filter,
                group_by,
                bindings,
            } => {
                let filter_text = filter.as_deref().unwrap_or_default();
                let params = self.bind(bindings, filter_text, ctx, resolved).await?;
                let request = QueryRequest::Aggregate(AggregateQuery {
                    function: *function,
                    table: table.clone(),
                    column: column.clone(),
                    filter: filter.clone(),
                    group_by: group_by.clone(),
                });
                let rows = self.queries.execute(&request, &params).await?;
                let shape = if group_by.is_empty() {
                    ResultShape::Scalar
                } else {
                    ResultShape::Rows
                };
                shape_rows(rows, shape)
            }
        }
    }

    async fn resolve_source(
        &self,
        path: &str,
        optional: bool,
        ctx: &ExecutionContext,
    ) -> ResolveResult<Value> {
        let entity_id = ctx
            .entity_id
            .as_deref()
            .ok_or_else(|| ResolveError::NoEntity(path.to_string()))?;

        match self.entities.get(entity_id, path).await {
            Ok(value) => Ok(value),
            Err(ProviderError::PathNotFound { .. }) if optional => Ok(Value::Null),
            Err(ProviderError::PathNotFound { path, segment, .. }) => {
                Err(ResolveError::SourcePath { path, segment })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Reduce query rows to the value a field produces.
///
/// A scalar is read from a single-column row, or from the `value` column when
/// the row has several. No rows yields null.
fn shape_rows(mut rows: Vec<Row>, shape: ResultShape) -> ResolveResult<Value> {
    match shape {
        ResultShape::Rows => Ok(Value::rows(rows)),
        ResultShape::Row => Ok(if rows.is_empty() {
            Value::Null
        } else {
            Value::Object(rows.swap_remove(0))
        }),
        ResultShape::Scalar => {
            if rows.is_empty() {
                return Ok(Value::Null);
            }
            let mut first = rows.swap_remove(0);
            if first.len() == 1 {
                return Ok(first.into_values().next().unwrap_or_default());
            }
            first
                .remove(AggregateQuery::VALUE_COLUMN)
                .ok_or_else(|| {
                    ResolveError::Shape(format!(
                        "{} columns and none named '{}'",
                        first.len(),
                        AggregateQuery::VALUE_COLUMN
                    ))
                })
        }
    }
}
