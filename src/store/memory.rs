use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ExecutionRecord, ExecutionStore, StoreError, StoreResult, TemplateStore};
use crate::model::{ExecutionResult, ReportTemplate};

#[derive(Debug, Default)]
struct Executions {
    /// Creation order.
    records: Vec<ExecutionRecord>,
    by_id: HashMap<String, usize>,
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    templates: RwLock<BTreeMap<String, ReportTemplate>>,
    executions: RwLock<Executions>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TemplateStore for MemoryStore {
    async fn save_template(&self, template: &ReportTemplate) -> StoreResult<()> {
        self.templates
            .write()
            .await
            .insert(template.id.clone(), template.clone());
        Ok(())
    }

    async fn load_template(&self, id: &str) -> StoreResult<Option<ReportTemplate>> {
        Ok(self.templates.read().await.get(id).cloned())
    }

    async fn list_templates(&self) -> StoreResult<Vec<String>> {
        Ok(self.templates.read().await.keys().cloned().collect())
    }

    async fn delete_template(&self, id: &str) -> StoreResult<bool> {
        Ok(self.templates.write().await.remove(id).is_some())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_execution(&self, record: &ExecutionRecord) -> StoreResult<()> {
        let mut guard = self.executions.write().await;
        let executions = &mut *guard;
        let id = record.context.execution_id.clone();
        match executions.by_id.get(&id).copied() {
            Some(idx) => executions.records[idx] = record.clone(),
            None => {
                let idx = executions.records.len();
                executions.records.push(record.clone());
                executions.by_id.insert(id, idx);
            }
        }
        Ok(())
    }

    async fn update_execution(&self, result: &ExecutionResult) -> StoreResult<()> {
        let mut executions = self.executions.write().await;
        let idx = *executions
            .by_id
            .get(&result.execution_id)
            .ok_or_else(|| StoreError::ExecutionNotFound(result.execution_id.clone()))?;
        executions.records[idx].result = result.clone();
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> StoreResult<Option<ExecutionRecord>> {
        let executions = self.executions.read().await;
        Ok(executions
            .by_id
            .get(execution_id)
            .map(|&idx| executions.records[idx].clone()))
    }

    async fn list_executions(&self, template_id: &str) -> StoreResult<Vec<ExecutionRecord>> {
        Ok(self
            .executions
            .read()
            .await
            .records
            .iter()
            .filter(|r| r.context.template_id == template_id)
            .cloned()
            .collect())
    }
}
