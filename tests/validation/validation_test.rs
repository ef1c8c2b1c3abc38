use std::sync::Arc;

use tally::dependency::OrderError;
use tally::engine::ReportEngine;
use tally::model::{FieldSpec, ReportTemplate, TriggerSpec};
use tally::provider::{MemoryEntityStore, MemoryQueryEngine};
use tally::store::{MemoryStore, TemplateStore};
use tally::trigger::EvaluatorConfig;
use tally::validation::{validate_template, ValidationError};

#[test]
fn test_two_field_cycle_is_reported() {
    let template = ReportTemplate::new("loop", "Loop")
        .with_field(FieldSpec::calculated("a", "b + 1", ["b"]))
        .with_field(FieldSpec::calculated("b", "a + 1", ["a"]));

    let result = validate_template(&template);
    assert!(!result.is_valid());
    assert_eq!(
        result.errors,
        vec![ValidationError::Order(OrderError::CyclicDependency {
            fields: vec!["a".to_string(), "b".to_string()],
        })]
    );
}

#[test]
fn test_cycle_members_only() {
    // `c` feeds the cycle but is not part of it.
    let template = ReportTemplate::new("t", "T")
        .with_field(FieldSpec::parameter("c", None, false))
        .with_field(FieldSpec::calculated("x", "y + c", ["y", "c"]))
        .with_field(FieldSpec::calculated("y", "z", ["z"]))
        .with_field(FieldSpec::calculated("z", "x", ["x"]));

    let result = validate_template(&template);
    let cycles = result.cycles();
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0], ["x", "y", "z"]);
}

#[test]
fn test_validation_error_display() {
    let error = ValidationError::UndeclaredReference {
        field: "margin".to_string(),
        reference: "discount".to_string(),
    };

    let message = error.to_string();
    assert!(message.contains("margin"));
    assert!(message.contains("discount"));
}

#[test]
fn test_template_from_toml_validates() {
    let template = ReportTemplate::from_toml(
        r#"
        id = "stock"
        name = "Stock levels"

        [[fields]]
        name = "on_hand"
        kind = "source"
        path = "inventory.on_hand"

        [[fields]]
        name = "reorder"
        kind = "calculated"
        formula = "on_hand < 10"
        dependencies = ["on_hand"]

        [[triggers]]
        name = "hourly"
        kind = "schedule"
        cron = "0 * * * *"

        [[triggers]]
        name = "restock"
        kind = "event"
        event_type = "inventory.changed"
        filter = "on_hand <"
        "#,
    )
    .unwrap();

    let result = validate_template(&template);
    assert_eq!(result.errors.len(), 1, "{:?}", result.errors);
    assert!(matches!(
        &result.errors[0],
        ValidationError::EventFilter { trigger, .. } if trigger == "restock"
    ));
}

#[tokio::test]
async fn test_round_trip_keeps_evaluation_order() {
    let template = ReportTemplate::new("sales", "Sales")
        .with_field(FieldSpec::calculated(
            "margin",
            "(total_revenue - total_cost) / total_revenue",
            ["total_revenue", "total_cost"],
        ))
        .with_field(FieldSpec::sql("total_cost", "SELECT 150 AS value"))
        .with_field(FieldSpec::source("total_revenue", "revenue"))
        .with_trigger(TriggerSpec::schedule("nightly", "0 2 * * *"));

    let store = Arc::new(MemoryStore::new());
    let engine = ReportEngine::new(
        tally::resolve::FieldResolver::new(
            Arc::new(MemoryEntityStore::new()),
            Arc::new(MemoryQueryEngine::new()),
        ),
        store.clone(),
        store.clone(),
        EvaluatorConfig::default(),
    );

    let saved_order = engine.save_template(&template).await.unwrap();
    let loaded = store.load_template("sales").await.unwrap().unwrap();
    let reloaded_order = validate_template(&loaded).into_result().unwrap();

    assert_eq!(saved_order, reloaded_order);
    assert_eq!(
        reloaded_order.names(),
        &["total_cost", "total_revenue", "margin"]
    );
}
