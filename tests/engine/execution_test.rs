use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tally::engine::{EngineError, ReportEngine};
use tally::model::{
    AggregateFunction, Binding, ExecutionResult, ExecutionStatus, FieldFormat, FieldSpec,
    OutputFormat, ReportTemplate, Row, Value,
};
use tally::provider::{
    BoundParameters, MemoryEntityStore, ProviderResult, QueryEngine, QueryRequest,
    SqliteQueryEngine,
};
use tally::render::JsonRenderer;
use tally::resolve::FieldResolver;
use tally::store::{ExecutionRecord, ExecutionStore, MemoryStore, StoreError, StoreResult};
use tally::trigger::EvaluatorConfig;
use tokio::sync::Notify;

fn regional_template(target: &str) -> ReportTemplate {
    ReportTemplate::new("regional", "Regional sales")
        .with_field(FieldSpec::parameter("region", None, true).hidden())
        .with_field(
            FieldSpec::aggregate("total", AggregateFunction::Sum, "orders", Some("amount"))
                .with_filter("region = :region")
                .with_binding("region", Binding::Parameter("region".into())),
        )
        .with_field(
            FieldSpec::aggregate("all_regions", AggregateFunction::Sum, "orders", Some("amount"))
                .hidden(),
        )
        .with_field(
            FieldSpec::aggregate("by_region", AggregateFunction::Sum, "orders", Some("amount"))
                .with_group_by(["region"]),
        )
        .with_field(
            FieldSpec::calculated("share", "total / all_regions", ["total", "all_regions"])
                .with_format(FieldFormat::Percent { decimals: 1 }),
        )
        .with_output(OutputFormat::Json, Some(target))
}

fn sqlite_engine() -> ReportEngine {
    let queries = SqliteQueryEngine::open_in_memory().unwrap();
    queries
        .execute_batch(
            "CREATE TABLE orders (region TEXT NOT NULL, amount REAL NOT NULL);
             INSERT INTO orders VALUES ('emea', 100.0), ('emea', 50.0), ('apac', 250.0);",
        )
        .unwrap();
    ReportEngine::in_memory(
        Arc::new(MemoryEntityStore::new()),
        Arc::new(queries),
        EvaluatorConfig::default(),
    )
    .with_renderer(Arc::new(JsonRenderer::new()))
}

#[tokio::test]
async fn test_sqlite_aggregates_render_to_file() {
    let dir = std::env::temp_dir().join(format!("tally-exec-{}", uuid::Uuid::new_v4()));
    let target = dir.join("regional.json");
    let engine = sqlite_engine();
    engine
        .save_template(&regional_template(&target.display().to_string()))
        .await
        .unwrap();

    let params = BTreeMap::from([("region".to_string(), Value::from("emea"))]);
    let record = engine.execute("regional", params, None).await.unwrap();
    assert_eq!(
        record.result.status,
        ExecutionStatus::Completed,
        "{:?}",
        record.result.error_detail
    );
    assert_eq!(record.result.output_references[0].location, target.display().to_string());

    let doc: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&target).unwrap()).unwrap();
    let row = &doc["rows"][0];
    assert_eq!(row["total"], 150.0);
    assert_eq!(row["share"], "37.5%");
    assert_eq!(row["by_region"][0]["region"], "apac");
    assert_eq!(row["by_region"][1]["value"], 150.0);
    assert!(row.get("all_regions").is_none());
    assert!(row.get("region").is_none());

    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_missing_required_parameter_fails_execution() {
    let engine = sqlite_engine();
    engine
        .save_template(&regional_template("unused.json"))
        .await
        .unwrap();

    let record = engine
        .execute("regional", BTreeMap::new(), None)
        .await
        .unwrap();
    assert_eq!(record.result.status, ExecutionStatus::Failed);
    assert!(record
        .result
        .error_detail
        .as_deref()
        .unwrap()
        .contains("region"));
    assert!(record.result.output_references.is_empty());

    let stored = engine
        .get_execution_status(&record.context.execution_id)
        .await
        .unwrap();
    assert_eq!(stored, record.result);
}

#[tokio::test]
async fn test_unknown_template() {
    let engine = sqlite_engine();
    assert!(matches!(
        engine.execute("ghost", BTreeMap::new(), None).await,
        Err(EngineError::TemplateNotFound(_))
    ));

    let history = engine.list_executions("ghost").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].result.status, ExecutionStatus::Failed);
    assert!(history[0].result.error_detail.as_deref().unwrap().contains("ghost"));
}

/// Execution store whose n-th `update_execution` call fails once.
struct FlakyStore {
    inner: MemoryStore,
    fail_on: usize,
    updates: AtomicUsize,
}

#[async_trait]
impl ExecutionStore for FlakyStore {
    async fn create_execution(&self, record: &ExecutionRecord) -> StoreResult<()> {
        self.inner.create_execution(record).await
    }

    async fn update_execution(&self, result: &ExecutionResult) -> StoreResult<()> {
        if self.updates.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.inner.update_execution(result).await
    }

    async fn get_execution(&self, execution_id: &str) -> StoreResult<Option<ExecutionRecord>> {
        self.inner.get_execution(execution_id).await
    }

    async fn list_executions(&self, template_id: &str) -> StoreResult<Vec<ExecutionRecord>> {
        self.inner.list_executions(template_id).await
    }
}

#[tokio::test]
async fn test_store_write_failure_still_ends_failed() {
    // First update marks the run in progress, the second records its outcome.
    for fail_on in [1, 2] {
        let executions = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail_on,
            updates: AtomicUsize::new(0),
        });
        let engine = ReportEngine::new(
            FieldResolver::new(
                Arc::new(MemoryEntityStore::new()),
                Arc::new(SqliteQueryEngine::open_in_memory().unwrap()),
            ),
            Arc::new(MemoryStore::new()),
            executions.clone(),
            EvaluatorConfig::default(),
        );
        let template = ReportTemplate::new("plain", "Plain")
            .with_field(FieldSpec::parameter("region", Some(Value::from("emea")), false));
        engine.save_template(&template).await.unwrap();

        let outcome = engine.execute("plain", BTreeMap::new(), None).await;
        assert!(matches!(outcome, Err(EngineError::Store(_))), "fail_on={}", fail_on);

        let history = engine.list_executions("plain").await.unwrap();
        assert_eq!(history.len(), 1);
        let result = &history[0].result;
        assert_eq!(result.status, ExecutionStatus::Failed, "fail_on={}", fail_on);
        assert!(result.error_detail.as_deref().unwrap().contains("disk full"));
        assert!(result.timing.finished_at.is_some());
    }
}

/// Query engine that blocks until released.
#[derive(Default)]
struct GateEngine {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl QueryEngine for GateEngine {
    async fn execute(
        &self,
        _request: &QueryRequest,
        _params: &BoundParameters,
    ) -> ProviderResult<Vec<Row>> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(vec![Row::from([("value".to_string(), Value::Int(21))])])
    }
}

#[tokio::test]
async fn test_cancel_stops_before_next_field() {
    let gate = Arc::new(GateEngine::default());
    let engine = Arc::new(ReportEngine::in_memory(
        Arc::new(MemoryEntityStore::new()),
        gate.clone(),
        EvaluatorConfig::default(),
    ));
    let template = ReportTemplate::new("slow", "Slow")
        .with_field(FieldSpec::sql("base", "SELECT 21 AS value"))
        .with_field(FieldSpec::calculated("double", "base * 2", ["base"]));
    engine.save_template(&template).await.unwrap();

    let handle = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.execute("slow", BTreeMap::new(), None).await }
    });

    gate.started.notified().await;
    let running = engine.running_executions();
    assert_eq!(running.len(), 1);
    let status = engine.get_execution_status(&running[0]).await.unwrap();
    assert_eq!(status.status, ExecutionStatus::InProgress);

    assert!(engine.cancel(&running[0]).await.unwrap());
    gate.release.notify_one();

    let record = handle.await.unwrap().unwrap();
    assert_eq!(record.result.status, ExecutionStatus::Canceled);
    assert!(record.result.timing.finished_at.is_some());
    assert!(engine.running_executions().is_empty());
    assert!(!engine.cancel(&running[0]).await.unwrap());
}

#[tokio::test]
async fn test_cancel_during_last_field_ends_canceled() {
    let gate = Arc::new(GateEngine::default());
    let engine = Arc::new(ReportEngine::in_memory(
        Arc::new(MemoryEntityStore::new()),
        gate.clone(),
        EvaluatorConfig::default(),
    ));
    let template = ReportTemplate::new("single", "Single")
        .with_field(FieldSpec::sql("base", "SELECT 21 AS value"));
    engine.save_template(&template).await.unwrap();

    let handle = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.execute("single", BTreeMap::new(), None).await }
    });

    gate.started.notified().await;
    let running = engine.running_executions();
    assert!(engine.cancel(&running[0]).await.unwrap());
    gate.release.notify_one();

    let record = handle.await.unwrap().unwrap();
    assert_eq!(record.result.status, ExecutionStatus::Canceled);
    assert_eq!(record.result.row_count, 0);
}
