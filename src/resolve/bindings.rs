//! Query parameter binding and formula bindings over resolved fields.

use std::collections::BTreeMap;

use super::{FieldResolver, Resolved, ResolveError, ResolveResult};
use crate::formula::Bindings;
use crate::model::{placeholders, Binding, ExecutionContext, Value};
use crate::provider::BoundParameters;

impl FieldResolver {
    /// Build the bound parameters for a query field.
    ///
    /// Explicit bindings win. Without any, each placeholder in `query_text`
    /// is bound from the resolved field of the same name, then from the
    /// execution parameter of the same name.
    pub(super) async fn bind(
        &self,
        bindings: &BTreeMap<String, Binding>,
        query_text: &str,
        ctx: &ExecutionContext,
        resolved: &Resolved,
    ) -> ResolveResult<BoundParameters> {
        let mut params = BoundParameters::new();

        if bindings.is_empty() {
            for name in placeholders(query_text) {
                let value = resolved
                    .get(&name)
                    .or_else(|| ctx.parameters.get(&name))
                    .cloned()
                    .ok_or_else(|| ResolveError::UnboundParameter(name.clone()))?;
                params.insert(name, value);
            }
            return Ok(params);
        }

        for (name, binding) in bindings {
            let value = match binding {
                Binding::Field(field) => resolved
                    .get(field)
                    .cloned()
                    .ok_or_else(|| ResolveError::UnboundParameter(name.clone()))?,
                Binding::Parameter(param) => ctx
                    .parameters
                    .get(param)
                    .cloned()
                    .ok_or_else(|| ResolveError::MissingRequiredParameter(param.clone()))?,
                Binding::Entity(path) => self.resolve_source(path, false, ctx).await?,
                Binding::Literal(value) => value.clone(),
            };
            params.insert(name.clone(), value);
        }
        Ok(params)
    }
}

/// Formula bindings over resolved fields.
///
/// A dotted identifier such as `best.category` reads the `category` key of
/// the resolved `best` field when no field carries the full dotted name.
pub struct ResolvedBindings<'a> {
    resolved: &'a Resolved,
}

impl<'a> ResolvedBindings<'a> {
    pub fn new(resolved: &'a Resolved) -> Self {
        Self { resolved }
    }
}

impl Bindings for ResolvedBindings<'_> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        if let Some(value) = self.resolved.get(name) {
            return Some(value);
        }
        let (head, rest) = name.split_once('.')?;
        self.resolved.get(head)?.get_path(rest).ok()
    }
}
