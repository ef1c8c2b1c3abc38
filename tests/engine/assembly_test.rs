use std::collections::BTreeMap;
use std::sync::Arc;

use tally::assemble::{AssembleError, CancellationFlag, ReportAssembler};
use tally::model::{
    Binding, ExecutionContext, ExecutionStatus, FieldSpec, ReportTemplate, ResultShape, Row, Value,
};
use tally::engine::ReportEngine;
use tally::provider::{MemoryEntityStore, MemoryQueryEngine};
use tally::resolve::{FieldResolver, ResolveError};
use tally::trigger::EvaluatorConfig;

const COST_SQL: &str = "SELECT SUM(cost) AS value FROM costs WHERE region = :region";

fn margin_template() -> ReportTemplate {
    ReportTemplate::new("sales-margin", "Sales margin")
        .with_field(FieldSpec::source("total_revenue", "totals.revenue"))
        .with_field(
            FieldSpec::sql("total_cost", COST_SQL)
                .with_binding("region", Binding::Parameter("region".into())),
        )
        .with_field(FieldSpec::calculated(
            "margin",
            "(total_revenue - total_cost) / total_revenue",
            ["total_revenue", "total_cost"],
        ))
}

fn entities(revenue: Value) -> MemoryEntityStore {
    MemoryEntityStore::new().with_entity(
        "acme",
        Value::object([("totals", Value::object([("revenue", revenue)]))]),
    )
}

fn context() -> ExecutionContext {
    ExecutionContext::manual(
        "sales-margin",
        BTreeMap::from([("region".to_string(), Value::from("emea"))]),
    )
    .with_entity(Some("acme".into()))
}

fn assembler(revenue: Value) -> ReportAssembler {
    let queries = MemoryQueryEngine::new().with_scalar(COST_SQL, 150);
    ReportAssembler::new(FieldResolver::new(
        Arc::new(entities(revenue)),
        Arc::new(queries),
    ))
}

#[tokio::test]
async fn test_margin_scenario() {
    let report = assembler(Value::Int(200))
        .assemble(&margin_template(), &context(), &CancellationFlag::new())
        .await
        .unwrap();

    assert_eq!(report.row.get("margin"), Some(&Value::Float(0.25)));
    assert_eq!(
        report.row.names().collect::<Vec<_>>(),
        vec!["total_revenue", "total_cost", "margin"]
    );
    assert!(report.warnings.is_empty());
}

#[tokio::test]
async fn test_zero_revenue_yields_null_and_completes() {
    let queries = MemoryQueryEngine::new().with_scalar(COST_SQL, 150);
    let engine = ReportEngine::in_memory(
        Arc::new(entities(Value::Int(0))),
        Arc::new(queries),
        EvaluatorConfig::default(),
    );
    engine.save_template(&margin_template()).await.unwrap();

    let ctx = context();
    let record = engine.execute_context(ctx).await.unwrap();
    assert_eq!(record.result.status, ExecutionStatus::Completed);
    assert!(record.result.error_detail.is_none());
}

#[tokio::test]
async fn test_null_operand_yields_null_even_for_best_effort() {
    let template = ReportTemplate::new("t", "T")
        .with_field(FieldSpec::optional_source("revenue", "totals.missing"))
        .with_field(FieldSpec::calculated("double", "revenue * 2", ["revenue"]).best_effort())
        .with_field(FieldSpec::calculated("ratio", "10 / revenue", ["revenue"]));

    let report = assembler(Value::Int(1))
        .assemble(
            &template,
            &ExecutionContext::manual("t", BTreeMap::new()).with_entity(Some("acme".into())),
            &CancellationFlag::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.row.get("double"), Some(&Value::Null));
    assert_eq!(report.row.get("ratio"), Some(&Value::Null));
    // Null propagation is not a failure, so nothing degraded.
    assert!(report.warnings.is_empty());
}

#[tokio::test]
async fn test_missing_parameter_reports_failing_field() {
    let ctx = ExecutionContext::manual("sales-margin", BTreeMap::new())
        .with_entity(Some("acme".into()));
    let err = assembler(Value::Int(200))
        .assemble(&margin_template(), &ctx, &CancellationFlag::new())
        .await
        .unwrap_err();

    match err {
        AssembleError::FieldResolution {
            field,
            source,
            partial,
        } => {
            assert_eq!(field, "total_cost");
            assert!(matches!(source, ResolveError::MissingRequiredParameter(p) if p == "region"));
            assert_eq!(partial.get("total_revenue"), Some(&Value::Int(200)));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_assemble_is_idempotent() {
    let top_sql = "SELECT category, revenue FROM top_categories";
    let rows: Vec<Row> = ["tools", "toys"]
        .iter()
        .enumerate()
        .map(|(i, category)| {
            Row::from([
                ("category".to_string(), Value::from(*category)),
                ("revenue".to_string(), Value::Int(100 - i as i64 * 10)),
            ])
        })
        .collect();
    let queries = MemoryQueryEngine::new()
        .with_scalar(COST_SQL, 150)
        .with_rows(top_sql, rows);
    let assembler = ReportAssembler::new(FieldResolver::new(
        Arc::new(entities(Value::Int(200))),
        Arc::new(queries),
    ));
    let template = margin_template()
        .with_field(FieldSpec::sql("top", top_sql).with_shape(ResultShape::Rows));

    let ctx = context();
    let cancel = CancellationFlag::new();
    let first = assembler.assemble(&template, &ctx, &cancel).await.unwrap();
    let second = assembler.assemble(&template, &ctx, &cancel).await.unwrap();

    assert_eq!(first.row, second.row);
    assert!(first.row.get("top").unwrap().is_row_set());
}

#[tokio::test]
async fn test_evaluation_order_respects_dependencies() {
    let template = ReportTemplate::new("chain", "Chain")
        .with_field(FieldSpec::calculated("d", "c + b", ["c", "b"]))
        .with_field(FieldSpec::calculated("c", "b * 2", ["b"]))
        .with_field(FieldSpec::calculated("b", "a + 1", ["a"]))
        .with_field(FieldSpec::parameter("a", Some(Value::Int(1)), false));

    let prepared = assembler(Value::Int(1)).prepare(&template).unwrap();
    let order = prepared.order();
    for field in &template.fields {
        let at = order.position(&field.name).unwrap();
        for dep in field.dependencies() {
            assert!(order.position(dep).unwrap() < at, "{dep} after {}", field.name);
        }
    }
}

#[tokio::test]
async fn test_placeholder_binds_field_declared_later() {
    let target_sql = "SELECT goal AS value FROM targets WHERE region = :region";
    let queries = Arc::new(MemoryQueryEngine::new().with_scalar(target_sql, 900));
    let assembler = ReportAssembler::new(FieldResolver::new(
        Arc::new(MemoryEntityStore::new().with_entity(
            "acme",
            Value::object([("home_region", Value::from("EU"))]),
        )),
        queries.clone(),
    ));
    let template = ReportTemplate::new("targets", "Targets")
        .with_field(FieldSpec::sql("target", target_sql))
        .with_field(FieldSpec::source("region", "home_region"));
    let ctx = ExecutionContext::manual(
        "targets",
        BTreeMap::from([("region".to_string(), Value::from("US"))]),
    )
    .with_entity(Some("acme".into()));

    let report = assembler
        .assemble(&template, &ctx, &CancellationFlag::new())
        .await
        .unwrap();

    assert_eq!(report.row.get("target"), Some(&Value::Int(900)));
    let calls = queries.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1["region"], Value::from("EU"));
}
