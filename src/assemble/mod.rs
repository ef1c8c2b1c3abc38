//! Report assembly.
//!
//! The assembler validates a template once, caches its evaluation order and
//! parsed formulas, then resolves every field of one execution in that order.
//! The cache is keyed by template id and checked against a fingerprint of the
//! field set, so an edited template is re-prepared on its next run while
//! concurrent runs of an unchanged template share one `Arc`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::dependency::EvaluationOrder;
use crate::formula::Formula;
use crate::model::{ExecutionContext, FieldKind, FieldWarning, ReportTemplate, ResolvedRow, Value};
use crate::resolve::{FieldResolver, ResolveError, Resolved};
use crate::validation::{validate_template, ValidationError};

#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("template '{template}' is invalid: {}", errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    InvalidTemplate {
        template: String,
        errors: Vec<ValidationError>,
    },

    /// A field that is not best-effort failed. `partial` holds the visible
    /// fields resolved before it.
    #[error("field '{field}' could not be resolved: {source}")]
    FieldResolution {
        field: String,
        source: ResolveError,
        partial: Box<ResolvedRow>,
    },

    #[error("execution canceled")]
    Canceled,

    #[error("could not fingerprint template: {0}")]
    Fingerprint(#[from] serde_json::Error),
}

pub type AssembleResult<T> = Result<T, AssembleError>;

/// Shared cancellation flag, checked between fields.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Validated, ordered form of a template's field set.
#[derive(Debug)]
pub struct PreparedTemplate {
    fingerprint: String,
    order: EvaluationOrder,
    /// Parsed formulas of calculated fields, by field index.
    formulas: HashMap<usize, Formula>,
    /// Whether each field contributes to the output, directly or through a
    /// visible dependent.
    needed: Vec<bool>,
}

impl PreparedTemplate {
    fn build(template: &ReportTemplate, fingerprint: String) -> AssembleResult<Self> {
        let order = validate_template(template).into_result().map_err(|errors| {
            AssembleError::InvalidTemplate {
                template: template.id.clone(),
                errors,
            }
        })?;

        let mut formulas = HashMap::new();
        for (idx, field) in template.fields.iter().enumerate() {
            if let FieldKind::Calculated { formula, .. } = &field.kind {
                // Syntax was checked by validation.
                if let Ok(parsed) = Formula::parse(formula) {
                    formulas.insert(idx, parsed);
                }
            }
        }

        Ok(Self {
            fingerprint,
            order,
            formulas,
            needed: needed_fields(template),
        })
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn order(&self) -> &EvaluationOrder {
        &self.order
    }
}

/// Mark visible fields and everything they read, transitively. Placeholders
/// of auto-bound queries count as reads of same-named fields.
fn needed_fields(template: &ReportTemplate) -> Vec<bool> {
    let index: HashMap<&str, usize> = template
        .fields
        .iter()
        .enumerate()
        .map(|(i, f)| (f.name.as_str(), i))
        .collect();

    let mut needed = vec![false; template.fields.len()];
    let mut stack: Vec<usize> = template
        .fields
        .iter()
        .enumerate()
        .filter(|(_, f)| f.visible)
        .map(|(i, _)| i)
        .collect();

    while let Some(i) = stack.pop() {
        if needed[i] {
            continue;
        }
        needed[i] = true;

        let field = &template.fields[i];
        let mut reads: Vec<String> = field.dependencies().into_iter().map(String::from).collect();
        reads.extend(field.implicit_reads());
        stack.extend(reads.iter().filter_map(|name| index.get(name.as_str()).copied()));
    }
    needed
}

/// Output of one assembler pass.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledReport {
    pub row: ResolvedRow,
    /// Best-effort fields that degraded to null.
    pub warnings: Vec<FieldWarning>,
}

/// Drives the field resolver over a whole template.
pub struct ReportAssembler {
    resolver: FieldResolver,
    prepared: DashMap<String, Arc<PreparedTemplate>>,
}

impl ReportAssembler {
    pub fn new(resolver: FieldResolver) -> Self {
        Self {
            resolver,
            prepared: DashMap::new(),
        }
    }

    pub fn resolver(&self) -> &FieldResolver {
        &self.resolver
    }

    /// Validate and order a template, reusing the cached result while the
    /// field set is unchanged.
    pub fn prepare(&self, template: &ReportTemplate) -> AssembleResult<Arc<PreparedTemplate>> {
        let fingerprint = template.fields_fingerprint()?;

        if let Some(cached) = self.prepared.get(&template.id) {
            if cached.fingerprint == fingerprint {
                debug!(template = %template.id, "using cached evaluation order");
                return Ok(Arc::clone(&cached));
            }
        }

        let prepared = Arc::new(PreparedTemplate::build(template, fingerprint)?);
        debug!(
            template = %template.id,
            order = ?prepared.order.names(),
            "computed evaluation order"
        );
        self.prepared
            .insert(template.id.clone(), Arc::clone(&prepared));
        Ok(prepared)
    }

    /// Drop the cached order of a template.
    pub fn invalidate(&self, template_id: &str) {
        self.prepared.remove(template_id);
    }

    pub fn is_cached(&self, template_id: &str) -> bool {
        self.prepared.contains_key(template_id)
    }

    /// Resolve every needed field of `template` for one execution.
    pub async fn assemble(
        &self,
        template: &ReportTemplate,
        ctx: &ExecutionContext,
        cancel: &CancellationFlag,
    ) -> AssembleResult<AssembledReport> {
        let prepared = self.prepare(template)?;

        let mut resolved = Resolved::new();
        let mut row = ResolvedRow::new();
        let mut warnings = Vec::new();

        for &idx in prepared.order.steps() {
            if cancel.is_canceled() {
                info!(execution_id = %ctx.execution_id, "execution canceled between fields");
                return Err(AssembleError::Canceled);
            }

            let field = &template.fields[idx];
            if !prepared.needed[idx] {
                debug!(field = %field.name, "skipping hidden field nothing reads");
                continue;
            }

            let result = self
                .resolver
                .resolve_prepared(field, prepared.formulas.get(&idx), ctx, &resolved)
                .await;

            let value = match result {
                Ok(value) => value,
                Err(err) if field.best_effort => {
                    warn!(field = %field.name, error = %err, "best-effort field degraded to null");
                    warnings.push(FieldWarning {
                        field: field.name.clone(),
                        message: err.to_string(),
                    });
                    Value::Null
                }
                Err(source) => {
                    return Err(AssembleError::FieldResolution {
                        field: field.name.clone(),
                        source,
                        partial: Box::new(row),
                    });
                }
            };

            debug!(field = %field.name, value = %value, "resolved field");
            if field.visible {
                row.insert(field.name.clone(), value.clone());
            }
            resolved.insert(field.name.clone(), value);
        }

        Ok(AssembledReport { row, warnings })
    }
}
