//! Validation of report templates.
//!
//! Runs every authoring check without executing anything: unique names, field
//! references, dependency cycles, formula syntax, and trigger configuration.
//! All problems are collected rather than stopping at the first.

use std::collections::HashSet;

use chrono::Utc;
use thiserror::Error;

use crate::dependency::{DependencyGraph, EvaluationOrder, OrderError};
use crate::formula::{Formula, FormulaError};
use crate::model::{FieldKind, ReportTemplate, TriggerKind};
use crate::trigger::{CronError, CronSchedule};

/// Validation error.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// Duplicate field, unknown reference, or cycle.
    #[error(transparent)]
    Order(#[from] OrderError),

    #[error("field '{field}' has an invalid formula: {source}")]
    Formula { field: String, source: FormulaError },

    #[error("field '{field}' formula reads '{reference}', which is not a declared dependency")]
    UndeclaredReference { field: String, reference: String },

    #[error("field '{0}' has an empty query")]
    EmptyQuery(String),

    #[error("duplicate trigger name '{0}'")]
    DuplicateTrigger(String),

    #[error("trigger '{trigger}' has an invalid cron expression: {source}")]
    Cron { trigger: String, source: CronError },

    #[error("trigger '{0}' has a schedule that never fires")]
    CronNeverFires(String),

    #[error("trigger '{trigger}' has an invalid event filter: {source}")]
    EventFilter {
        trigger: String,
        source: FormulaError,
    },

    #[error("trigger '{0}' has an empty event type")]
    EmptyEventType(String),

    #[error("trigger '{0}' has an empty condition")]
    EmptyCondition(String),

    #[error("trigger '{0}' has a zero check interval")]
    ZeroCheckInterval(String),
}

/// Outcome of validating one template.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    /// Evaluation order, present when the field set has no ordering errors.
    pub order: Option<EvaluationOrder>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Every field named in a reported cycle.
    pub fn cycles(&self) -> Vec<&[String]> {
        self.errors
            .iter()
            .filter_map(|e| match e {
                ValidationError::Order(OrderError::CyclicDependency { fields }) => {
                    Some(fields.as_slice())
                }
                _ => None,
            })
            .collect()
    }

    pub fn into_result(self) -> Result<EvaluationOrder, Vec<ValidationError>> {
        match (self.errors.is_empty(), self.order) {
            (true, Some(order)) => Ok(order),
            _ => Err(self.errors),
        }
    }
}

/// Validate a report template.
pub fn validate_template(template: &ReportTemplate) -> ValidationResult {
    let mut errors = Vec::new();

    let order = validate_fields(template, &mut errors);
    validate_formulas(template, &mut errors);
    validate_triggers(template, &mut errors);

    ValidationResult { errors, order }
}

fn validate_fields(
    template: &ReportTemplate,
    errors: &mut Vec<ValidationError>,
) -> Option<EvaluationOrder> {
    let (graph, order_errors) = DependencyGraph::build_lenient(&template.fields);
    let clean = order_errors.is_empty();
    errors.extend(order_errors.into_iter().map(ValidationError::from));

    let cycles = graph.cycles();
    let acyclic = cycles.is_empty();
    errors.extend(
        cycles
            .into_iter()
            .map(|fields| ValidationError::Order(OrderError::CyclicDependency { fields })),
    );

    for field in &template.fields {
        if let FieldKind::Sql { query, .. } = &field.kind {
            if query.trim().is_empty() {
                errors.push(ValidationError::EmptyQuery(field.name.clone()));
            }
        }
    }

    if clean && acyclic {
        graph.evaluation_order().ok()
    } else {
        None
    }
}

fn validate_formulas(template: &ReportTemplate, errors: &mut Vec<ValidationError>) {
    for field in &template.fields {
        let FieldKind::Calculated {
            formula,
            dependencies,
        } = &field.kind
        else {
            continue;
        };

        let parsed = match Formula::parse(formula) {
            Ok(parsed) => parsed,
            Err(source) => {
                errors.push(ValidationError::Formula {
                    field: field.name.clone(),
                    source,
                });
                continue;
            }
        };

        // `best.category` reads the declared dependency `best`.
        for reference in parsed.references() {
            let head = reference.split('.').next().unwrap_or(&reference);
            if !dependencies.contains(&reference) && !dependencies.contains(head) {
                errors.push(ValidationError::UndeclaredReference {
                    field: field.name.clone(),
                    reference,
                });
            }
        }
    }
}

fn validate_triggers(template: &ReportTemplate, errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for trigger in &template.triggers {
        if !seen.insert(trigger.name.as_str()) {
            errors.push(ValidationError::DuplicateTrigger(trigger.name.clone()));
        }

        match &trigger.kind {
            TriggerKind::Schedule { cron } => match CronSchedule::parse(cron) {
                // e.g. `0 0 31 2 *`
                Ok(schedule) if schedule.next_after(Utc::now()).is_none() => {
                    errors.push(ValidationError::CronNeverFires(trigger.name.clone()));
                }
                Ok(_) => {}
                Err(source) => errors.push(ValidationError::Cron {
                    trigger: trigger.name.clone(),
                    source,
                }),
            },
            TriggerKind::Event { event_type, filter } => {
                if event_type.trim().is_empty() {
                    errors.push(ValidationError::EmptyEventType(trigger.name.clone()));
                }
                if let Some(Err(source)) = filter.as_deref().map(Formula::parse) {
                    errors.push(ValidationError::EventFilter {
                        trigger: trigger.name.clone(),
                        source,
                    });
                }
            }
            TriggerKind::Query {
                condition,
                check_interval_secs,
            } => {
                if condition.trim().is_empty() {
                    errors.push(ValidationError::EmptyCondition(trigger.name.clone()));
                }
                if *check_interval_secs == Some(0) {
                    errors.push(ValidationError::ZeroCheckInterval(trigger.name.clone()));
                }
            }
            TriggerKind::Api { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldSpec, TriggerSpec};

    fn margin_template() -> ReportTemplate {
        ReportTemplate::new("sales", "Sales")
            .with_field(FieldSpec::source("total_revenue", "revenue"))
            .with_field(FieldSpec::sql("total_cost", "SELECT 150"))
            .with_field(FieldSpec::calculated(
                "margin",
                "(total_revenue - total_cost) / total_revenue",
                ["total_revenue", "total_cost"],
            ))
            .with_trigger(TriggerSpec::schedule("nightly", "0 2 * * *"))
    }

    #[test]
    fn test_valid_template() {
        let result = validate_template(&margin_template());
        assert!(result.is_valid(), "{:?}", result.errors);
        let order = result.into_result().unwrap();
        assert_eq!(order.names(), &["total_revenue", "total_cost", "margin"]);
    }

    #[test]
    fn test_two_field_cycle() {
        let template = ReportTemplate::new("t", "T")
            .with_field(FieldSpec::calculated("a", "b + 1", ["b"]))
            .with_field(FieldSpec::calculated("b", "a + 1", ["a"]));
        let result = validate_template(&template);
        assert_eq!(
            result.errors,
            vec![ValidationError::Order(OrderError::CyclicDependency {
                fields: vec!["a".into(), "b".into()]
            })]
        );
        assert!(result.order.is_none());
    }

    #[test]
    fn test_every_cycle_reported() {
        let template = ReportTemplate::new("t", "T")
            .with_field(FieldSpec::calculated("a", "b", ["b"]))
            .with_field(FieldSpec::calculated("b", "a", ["a"]))
            .with_field(FieldSpec::calculated("c", "c + 1", ["c"]));
        let result = validate_template(&template);
        assert_eq!(result.cycles().len(), 2);
        assert_eq!(result.cycles()[1], &["c".to_string()]);
    }

    #[test]
    fn test_unknown_reference_and_duplicates() {
        let template = ReportTemplate::new("t", "T")
            .with_field(FieldSpec::source("a", "a"))
            .with_field(FieldSpec::source("a", "b"))
            .with_field(FieldSpec::calculated("c", "ghost + 1", ["ghost"]));
        let result = validate_template(&template);
        assert!(result
            .errors
            .contains(&ValidationError::Order(OrderError::DuplicateField("a".into()))));
        assert!(result.errors.contains(&ValidationError::Order(
            OrderError::UnknownFieldReference {
                field: "c".into(),
                reference: "ghost".into()
            }
        )));
        assert!(result.order.is_none());
    }

    #[test]
    fn test_formula_checks() {
        let template = ReportTemplate::new("t", "T")
            .with_field(FieldSpec::source("a", "a"))
            .with_field(FieldSpec::source("b", "b"))
            .with_field(FieldSpec::calculated("bad_syntax", "a +", ["a"]))
            .with_field(FieldSpec::calculated("undeclared", "a + b", ["a"]));
        let result = validate_template(&template);
        assert_eq!(result.errors.len(), 2, "{:?}", result.errors);
        assert!(matches!(
            &result.errors[0],
            ValidationError::Formula { field, .. } if field == "bad_syntax"
        ));
        assert_eq!(
            result.errors[1],
            ValidationError::UndeclaredReference {
                field: "undeclared".into(),
                reference: "b".into()
            }
        );
        // Ordering itself is fine, so the order is still reported.
        assert!(result.order.is_some());
    }

    #[test]
    fn test_trigger_checks() {
        let template = margin_template()
            .with_trigger(TriggerSpec::schedule("nightly", "0 3 * * *"))
            .with_trigger(TriggerSpec::schedule("broken", "0 25 * * *"))
            .with_trigger(TriggerSpec::event("blank", " ", Some("total >")))
            .with_trigger(TriggerSpec::query("never", "SELECT 1", 0));
        let result = validate_template(&template);
        let messages: Vec<String> = result.errors.iter().map(|e| e.to_string()).collect();
        assert_eq!(result.errors.len(), 5, "{:?}", messages);
        assert!(result.errors.contains(&ValidationError::DuplicateTrigger("nightly".into())));
        assert!(result.errors.contains(&ValidationError::EmptyEventType("blank".into())));
        assert!(result.errors.contains(&ValidationError::ZeroCheckInterval("never".into())));
        assert!(messages.iter().any(|m| m.contains("'broken'")));
        assert!(messages.iter().any(|m| m.contains("event filter")));
    }

    #[test]
    fn test_schedule_that_never_fires() {
        let template = margin_template()
            .with_trigger(TriggerSpec::schedule("feb_31", "0 0 31 2 *"))
            .with_trigger(TriggerSpec::schedule("leap_day", "0 0 29 2 *"));
        let result = validate_template(&template);
        assert_eq!(
            result.errors,
            vec![ValidationError::CronNeverFires("feb_31".into())]
        );
    }
}
