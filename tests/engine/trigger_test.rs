use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tally::engine::ReportEngine;
use tally::model::{ExecutionStatus, FieldSpec, ReportTemplate, TriggerOrigin, TriggerSpec, Value};
use tally::provider::{MemoryEntityStore, MemoryQueryEngine};
use tally::trigger::{
    EvaluatorConfig, Event, FireOutcome, FiringPolicy, TriggerError, TriggerEvaluator,
    TriggerKey, TriggerState,
};

fn at(h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, h, mi, 0).unwrap()
}

fn report(trigger: TriggerSpec) -> ReportTemplate {
    ReportTemplate::new("orders", "Orders")
        .with_field(FieldSpec::parameter("region", Some(Value::from("emea")), false))
        .with_trigger(trigger)
}

#[tokio::test]
async fn test_second_tick_while_firing_is_rejected() {
    let evaluator = TriggerEvaluator::new(EvaluatorConfig::default());
    evaluator
        .register(&report(TriggerSpec::schedule("every_minute", "* * * * *")))
        .unwrap();
    let key = TriggerKey::new("orders", "every_minute");
    assert_eq!(evaluator.state(&key), Some(TriggerState::Idle));

    let first = evaluator.tick(at(9, 0)).await;
    assert_eq!(first.len(), 1);
    let ctx = match &first[0].result {
        Ok(FireOutcome::Started(ctx)) => ctx.clone(),
        other => panic!("expected a started firing, got {other:?}"),
    };
    assert_eq!(ctx.trigger_kind, TriggerOrigin::Schedule);
    assert_eq!(evaluator.state(&key), Some(TriggerState::Firing));

    let second = evaluator.tick(at(9, 1)).await;
    assert_eq!(second.len(), 1);
    assert!(matches!(
        second[0].result,
        Err(TriggerError::ConcurrencyRejected(ref k)) if *k == key
    ));
    assert_eq!(evaluator.running(&key), Some(ctx.execution_id.clone()));

    assert!(evaluator.complete(&key).is_none());
    assert_eq!(evaluator.state(&key), Some(TriggerState::Idle));
}

#[tokio::test]
async fn test_queue_policy_releases_in_order() {
    let evaluator = TriggerEvaluator::new(EvaluatorConfig {
        firing_policy: FiringPolicy::Queue,
        max_queue_depth: 2,
        ..EvaluatorConfig::default()
    });
    evaluator
        .register(&report(TriggerSpec::schedule("every_minute", "* * * * *")))
        .unwrap();
    let key = TriggerKey::new("orders", "every_minute");

    evaluator.tick(at(9, 0)).await;
    let mut queued = Vec::new();
    for minute in 1..=2 {
        match evaluator.tick(at(9, minute)).await.remove(0).result {
            Ok(FireOutcome::Queued { execution_id, position }) => {
                assert_eq!(position, minute as usize);
                queued.push(execution_id);
            }
            other => panic!("expected queued firing, got {other:?}"),
        }
    }
    assert!(matches!(
        evaluator.tick(at(9, 3)).await.remove(0).result,
        Err(TriggerError::QueueFull { depth: 2, .. })
    ));

    assert_eq!(evaluator.complete(&key).unwrap().execution_id, queued[0]);
    assert_eq!(evaluator.complete(&key).unwrap().execution_id, queued[1]);
    assert!(evaluator.complete(&key).is_none());
    assert_eq!(evaluator.state(&key), Some(TriggerState::Idle));
}

fn engine(queries: MemoryQueryEngine, config: EvaluatorConfig) -> ReportEngine {
    let entities = MemoryEntityStore::new()
        .with_entity("acme", Value::object([("name", Value::from("Acme"))]));
    ReportEngine::in_memory(Arc::new(entities), Arc::new(queries), config)
}

#[tokio::test]
async fn test_engine_runs_due_schedule_and_returns_to_idle() {
    let engine = engine(MemoryQueryEngine::new(), EvaluatorConfig::default());
    engine
        .save_template(&report(TriggerSpec::schedule("nightly", "0 2 * * *")))
        .await
        .unwrap();
    let key = TriggerKey::new("orders", "nightly");

    assert!(engine.run_due(at(1, 59)).await.is_empty());
    let records = engine.run_due(at(2, 0)).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].result.status, ExecutionStatus::Completed);
    assert_eq!(records[0].context.triggered_by, "nightly");
    assert_eq!(engine.triggers().state(&key), Some(TriggerState::Idle));

    let history = engine.list_executions("orders").await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_event_trigger_filters_on_payload() {
    let template = ReportTemplate::new("orders", "Orders")
        .with_field(FieldSpec::parameter("event", None, true))
        .with_field(FieldSpec::source("customer", "name"))
        .with_trigger(TriggerSpec::event("big_order", "order.created", Some("total > 1000")));
    let engine = engine(MemoryQueryEngine::new(), EvaluatorConfig::default());
    engine.save_template(&template).await.unwrap();

    let small = Event::new("order.created", Value::object([("total", Value::Int(10))]))
        .for_entity("acme");
    assert!(engine.handle_event(&small, at(9, 0)).await.is_empty());

    let big = Event::new("order.created", Value::object([("total", Value::Int(5000))]))
        .for_entity("acme");
    let records = engine.handle_event(&big, at(9, 1)).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].result.status, ExecutionStatus::Completed);
    assert_eq!(records[0].context.entity_id.as_deref(), Some("acme"));
    assert_eq!(
        records[0].context.parameters.get("event"),
        Some(&Value::object([("total", Value::Int(5000))]))
    );
}

#[tokio::test]
async fn test_query_trigger_fires_when_condition_has_rows() {
    let condition = "SELECT id FROM orders WHERE status = :status";
    let queries = MemoryQueryEngine::new().with_rows(condition, Vec::new());
    let config = EvaluatorConfig::default();
    let queries = Arc::new(queries);
    let entities = Arc::new(MemoryEntityStore::new());
    let engine = ReportEngine::in_memory(entities, queries.clone(), config);

    let template = report(
        TriggerSpec::query("stuck_orders", condition, 300).with_parameter("status", "stuck"),
    );
    engine.save_template(&template).await.unwrap();

    assert!(engine.run_due(at(9, 0)).await.is_empty());

    let row = BTreeMap::from([("id".to_string(), Value::Int(7))]);
    queries.set_rows(condition, vec![row]).await;
    // Interval not elapsed yet.
    assert!(engine.run_due(at(9, 1)).await.is_empty());

    let records = engine.run_due(at(9, 5)).await;
    assert_eq!(records.len(), 1);
    assert!(records[0]
        .context
        .parameters
        .get("condition_rows")
        .is_some_and(Value::is_row_set));

    let (_, bound) = queries.calls().await.remove(0);
    assert_eq!(bound.get("status"), Some(&Value::from("stuck")));
}

#[tokio::test]
async fn test_disabled_trigger_does_not_fire() {
    let engine = engine(MemoryQueryEngine::new(), EvaluatorConfig::default());
    engine
        .save_template(&report(TriggerSpec::schedule("nightly", "0 2 * * *").disabled()))
        .await
        .unwrap();
    let key = TriggerKey::new("orders", "nightly");
    assert_eq!(engine.triggers().state(&key), Some(TriggerState::Disabled));
    assert!(engine.run_due(at(2, 0)).await.is_empty());

    engine.triggers().enable(&key).unwrap();
    assert_eq!(engine.run_due(at(2, 0)).await.len(), 1);
}
