use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tally::engine::ReportEngine;
use tally::model::{ExecutionStatus, FieldSpec, ReportTemplate, TriggerSpec, Value};
use tally::provider::{MemoryEntityStore, MemoryQueryEngine};
use tally::resolve::FieldResolver;
use tally::store::{ExecutionStore, SqliteStore, TemplateStore};
use tally::trigger::{EvaluatorConfig, TriggerKey, TriggerState};

fn temp_db() -> PathBuf {
    std::env::temp_dir()
        .join(format!("tally-sqlite-{}", uuid::Uuid::new_v4()))
        .join("tally.db")
}

fn engine(store: Arc<SqliteStore>) -> ReportEngine {
    let entities = MemoryEntityStore::new().with_entity(
        "acme",
        Value::object([("revenue", Value::Int(200))]),
    );
    let queries = MemoryQueryEngine::new().with_scalar("SELECT 150 AS value", 150);
    ReportEngine::new(
        FieldResolver::new(Arc::new(entities), Arc::new(queries)),
        store.clone(),
        store,
        EvaluatorConfig::default(),
    )
}

fn template() -> ReportTemplate {
    ReportTemplate::new("sales", "Sales")
        .with_field(FieldSpec::source("total_revenue", "revenue"))
        .with_field(FieldSpec::sql("total_cost", "SELECT 150 AS value"))
        .with_field(FieldSpec::calculated(
            "margin",
            "(total_revenue - total_cost) / total_revenue",
            ["total_revenue", "total_cost"],
        ))
        .with_trigger(TriggerSpec::schedule("nightly", "0 2 * * *").with_entity("acme"))
}

#[tokio::test]
async fn test_executions_survive_reopen() {
    let path = temp_db();

    let execution_id = {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let engine = engine(store);
        engine.save_template(&template()).await.unwrap();
        let record = engine
            .execute("sales", BTreeMap::new(), Some("acme".into()))
            .await
            .unwrap();
        assert_eq!(record.result.status, ExecutionStatus::Completed);
        record.context.execution_id
    };

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    assert_eq!(store.list_templates().await.unwrap(), vec!["sales"]);

    let record = store.get_execution(&execution_id).await.unwrap().unwrap();
    assert_eq!(record.result.status, ExecutionStatus::Completed);
    assert_eq!(record.context.entity_id.as_deref(), Some("acme"));
    assert!(record.result.timing.duration_ms().is_some());

    // Triggers of stored templates come back on restore.
    let restored = engine(store);
    assert_eq!(restored.restore().await.unwrap(), 1);
    assert_eq!(
        restored.triggers().state(&TriggerKey::new("sales", "nightly")),
        Some(TriggerState::Idle)
    );

    if let Some(dir) = path.parent() {
        std::fs::remove_dir_all(dir).ok();
    }
}

#[tokio::test]
async fn test_history_is_oldest_first() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let engine = engine(store.clone());
    engine.save_template(&template()).await.unwrap();

    let mut ids = Vec::new();
    for entity in ["acme", "missing"] {
        let record = engine
            .execute("sales", BTreeMap::new(), Some(entity.to_string()))
            .await
            .unwrap();
        ids.push(record.context.execution_id);
    }

    let history = engine.list_executions("sales").await.unwrap();
    let statuses: Vec<_> = history.iter().map(|r| r.result.status).collect();
    assert_eq!(
        history.iter().map(|r| r.context.execution_id.clone()).collect::<Vec<_>>(),
        ids
    );
    assert_eq!(statuses, vec![ExecutionStatus::Completed, ExecutionStatus::Failed]);
    assert!(history[1]
        .result
        .error_detail
        .as_deref()
        .unwrap()
        .contains("missing"));
}

#[tokio::test]
async fn test_delete_template() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    store.save_template(&template()).await.unwrap();
    assert!(store.delete_template("sales").await.unwrap());
    assert!(!store.delete_template("sales").await.unwrap());
    assert!(store.load_template("sales").await.unwrap().is_none());
}
