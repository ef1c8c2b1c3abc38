//! Persistence of templates and execution records.
//!
//! Two implementations ship with the crate: [`MemoryStore`] for tests and
//! single-process use, and [`SqliteStore`], which keeps JSON documents in a
//! versioned SQLite schema.

mod memory;
mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ExecutionContext, ExecutionResult, ReportTemplate};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("execution '{0}' not found")]
    ExecutionNotFound(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store lock poisoned")]
    Poisoned,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One execution: the immutable context plus its current result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub context: ExecutionContext,
    pub result: ExecutionResult,
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Insert or replace a template.
    async fn save_template(&self, template: &ReportTemplate) -> StoreResult<()>;

    async fn load_template(&self, id: &str) -> StoreResult<Option<ReportTemplate>>;

    /// Ids of every stored template, sorted.
    async fn list_templates(&self) -> StoreResult<Vec<String>>;

    /// Returns true if a template was deleted.
    async fn delete_template(&self, id: &str) -> StoreResult<bool>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn create_execution(&self, record: &ExecutionRecord) -> StoreResult<()>;

    /// Replace the result of an existing execution.
    async fn update_execution(&self, result: &ExecutionResult) -> StoreResult<()>;

    async fn get_execution(&self, execution_id: &str) -> StoreResult<Option<ExecutionRecord>>;

    /// Executions of a template, oldest first.
    async fn list_executions(&self, template_id: &str) -> StoreResult<Vec<ExecutionRecord>>;
}
