//! In-memory collaborators for tests, demos and the CLI.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::{
    BoundParameters, EntityStore, ProviderError, ProviderResult, QueryEngine, QueryRequest,
};
use crate::model::{Row, Value};

/// Entity documents held in memory, addressed by id.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    entities: RwLock<HashMap<String, Value>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>, document: Value) -> Self {
        self.entities.get_mut().insert(entity_id.into(), document);
        self
    }

    /// Load every top-level key of a JSON object as one entity.
    pub fn from_json(source: &str) -> ProviderResult<Self> {
        let documents: HashMap<String, Value> = serde_json::from_str(source)?;
        Ok(Self {
            entities: RwLock::new(documents),
        })
    }

    pub async fn insert(&self, entity_id: impl Into<String>, document: Value) {
        self.entities.write().await.insert(entity_id.into(), document);
    }

    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn get(&self, entity_id: &str, path: &str) -> ProviderResult<Value> {
        let entities = self.entities.read().await;
        let document = entities
            .get(entity_id)
            .ok_or_else(|| ProviderError::EntityNotFound(entity_id.to_string()))?;
        document
            .get_path(path)
            .cloned()
            .map_err(|segment| ProviderError::PathNotFound {
                entity_id: entity_id.to_string(),
                path: path.to_string(),
                segment,
            })
    }
}

/// Canned response for one request.
#[derive(Debug, Clone)]
enum Response {
    Rows(Vec<Row>),
    Failure(String),
}

/// Query engine answering from canned responses.
///
/// SQL requests are matched on their trimmed text, aggregate requests on their
/// table name. Every call is recorded with its bound parameters so tests can
/// check what the resolver bound.
#[derive(Debug, Default)]
pub struct MemoryQueryEngine {
    sql: RwLock<HashMap<String, Response>>,
    aggregates: RwLock<HashMap<String, Response>>,
    calls: Mutex<Vec<(QueryRequest, BoundParameters)>>,
}

impl MemoryQueryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, sql: &str, rows: Vec<Row>) -> Self {
        self.sql
            .get_mut()
            .insert(sql.trim().to_string(), Response::Rows(rows));
        self
    }

    /// Single-row, single-column response.
    pub fn with_scalar(self, sql: &str, value: impl Into<Value>) -> Self {
        let row = Row::from([("value".to_string(), value.into())]);
        self.with_rows(sql, vec![row])
    }

    pub fn with_failure(mut self, sql: &str, message: impl Into<String>) -> Self {
        self.sql
            .get_mut()
            .insert(sql.trim().to_string(), Response::Failure(message.into()));
        self
    }

    pub fn with_aggregate(mut self, table: &str, rows: Vec<Row>) -> Self {
        self.aggregates
            .get_mut()
            .insert(table.to_string(), Response::Rows(rows));
        self
    }

    /// Replace the response for a SQL request while the engine is shared.
    pub async fn set_rows(&self, sql: &str, rows: Vec<Row>) {
        self.sql
            .write()
            .await
            .insert(sql.trim().to_string(), Response::Rows(rows));
    }

    /// Every request seen so far, in call order.
    pub async fn calls(&self) -> Vec<(QueryRequest, BoundParameters)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl QueryEngine for MemoryQueryEngine {
    async fn execute(
        &self,
        request: &QueryRequest,
        params: &BoundParameters,
    ) -> ProviderResult<Vec<Row>> {
        self.calls.lock().await.push((request.clone(), params.clone()));

        let response = match request {
            QueryRequest::Sql(sql) => self.sql.read().await.get(sql.trim()).cloned(),
            QueryRequest::Aggregate(agg) => self.aggregates.read().await.get(&agg.table).cloned(),
        };

        match response {
            Some(Response::Rows(rows)) => Ok(rows),
            Some(Response::Failure(message)) => Err(ProviderError::Query(message)),
            None => Err(ProviderError::Query(format!(
                "no response configured for '{}'",
                request.describe()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entity_path_lookup() {
        let store = MemoryEntityStore::new().with_entity(
            "c1",
            Value::object([(
                "customer",
                Value::object([("address", Value::object([("city", Value::from("Lyon"))]))]),
            )]),
        );

        assert_eq!(
            store.get("c1", "customer.address.city").await.unwrap(),
            Value::from("Lyon")
        );

        match store.get("c1", "customer.phone").await {
            Err(ProviderError::PathNotFound { segment, .. }) => assert_eq!(segment, 1),
            other => panic!("expected PathNotFound, got {:?}", other),
        }

        assert!(matches!(
            store.get("c2", "customer").await,
            Err(ProviderError::EntityNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_entities_from_json() {
        let store =
            MemoryEntityStore::from_json(r#"{"acme": {"revenue": 200, "tags": ["a", "b"]}}"#)
                .unwrap();
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get("acme", "tags.1").await.unwrap(), Value::from("b"));
    }

    #[tokio::test]
    async fn test_canned_query_records_calls() {
        let engine = MemoryQueryEngine::new()
            .with_scalar("SELECT 150", 150i64)
            .with_failure("SELECT boom", "relation does not exist");

        let params = BoundParameters::from([("region".to_string(), Value::from("EU"))]);
        let rows = engine
            .execute(&QueryRequest::Sql("  SELECT 150 ".into()), &params)
            .await
            .unwrap();
        assert_eq!(rows[0]["value"], Value::Int(150));

        assert!(engine
            .execute(&QueryRequest::Sql("SELECT boom".into()), &params)
            .await
            .is_err());
        assert!(engine
            .execute(&QueryRequest::Sql("SELECT 2".into()), &params)
            .await
            .is_err());

        let calls = engine.calls().await;
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].1, params);
    }
}
