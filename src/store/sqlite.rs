//! SQLite-backed store.
//!
//! Templates and executions are stored as JSON documents next to the columns
//! they are queried by. The schema is versioned: on a version mismatch the
//! execution history is dropped and the version rewritten, templates are kept.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::{ExecutionRecord, ExecutionStore, StoreError, StoreResult, TemplateStore};
use crate::model::{ExecutionResult, ReportTemplate};

/// Current schema version. Bump this when the record format changes.
const SCHEMA_VERSION: i32 = 1;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the store database, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        store.init()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init()?;
        Ok(store)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS templates (
                id TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS executions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL UNIQUE,
                template_id TEXT NOT NULL,
                status TEXT NOT NULL,
                context TEXT NOT NULL,
                result TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS executions_by_template
                ON executions (template_id, seq);
            ",
        )?;

        let stored_version: Option<i32> = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                let s: String = row.get(0)?;
                Ok(s.parse().unwrap_or(0))
            })
            .optional()?;

        match stored_version {
            Some(v) if v == SCHEMA_VERSION => {}
            Some(_) => {
                conn.execute("DELETE FROM executions", [])?;
                set_version(&conn)?;
            }
            None => set_version(&conn)?,
        }
        Ok(())
    }
}

fn set_version(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('version', ?)",
        params![SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

fn decode_record(context: String, result: String) -> StoreResult<ExecutionRecord> {
    Ok(ExecutionRecord {
        context: serde_json::from_str(&context)?,
        result: serde_json::from_str(&result)?,
    })
}

#[async_trait]
impl TemplateStore for SqliteStore {
    async fn save_template(&self, template: &ReportTemplate) -> StoreResult<()> {
        let body = serde_json::to_string(template)?;
        self.lock()?.execute(
            "INSERT OR REPLACE INTO templates (id, body, updated_at) VALUES (?, ?, ?)",
            params![template.id, body, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    async fn load_template(&self, id: &str) -> StoreResult<Option<ReportTemplate>> {
        let body: Option<String> = self
            .lock()?
            .query_row(
                "SELECT body FROM templates WHERE id = ?",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        match body {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn list_templates(&self) -> StoreResult<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id FROM templates ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    async fn delete_template(&self, id: &str) -> StoreResult<bool> {
        let rows = self
            .lock()?
            .execute("DELETE FROM templates WHERE id = ?", params![id])?;
        Ok(rows > 0)
    }
}

#[async_trait]
impl ExecutionStore for SqliteStore {
    async fn create_execution(&self, record: &ExecutionRecord) -> StoreResult<()> {
        let context = serde_json::to_string(&record.context)?;
        let result = serde_json::to_string(&record.result)?;
        self.lock()?.execute(
            "INSERT OR REPLACE INTO executions (execution_id, template_id, status, context, result)
             VALUES (?, ?, ?, ?, ?)",
            params![
                record.context.execution_id,
                record.context.template_id,
                record.result.status.as_str(),
                context,
                result
            ],
        )?;
        Ok(())
    }

    async fn update_execution(&self, result: &ExecutionResult) -> StoreResult<()> {
        let body = serde_json::to_string(result)?;
        let rows = self.lock()?.execute(
            "UPDATE executions SET status = ?, result = ? WHERE execution_id = ?",
            params![result.status.as_str(), body, result.execution_id],
        )?;
        if rows == 0 {
            return Err(StoreError::ExecutionNotFound(result.execution_id.clone()));
        }
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> StoreResult<Option<ExecutionRecord>> {
        let row: Option<(String, String)> = self
            .lock()?
            .query_row(
                "SELECT context, result FROM executions WHERE execution_id = ?",
                params![execution_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        row.map(|(context, result)| decode_record(context, result))
            .transpose()
    }

    async fn list_executions(&self, template_id: &str) -> StoreResult<Vec<ExecutionRecord>> {
        let rows = {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(
                "SELECT context, result FROM executions WHERE template_id = ? ORDER BY seq",
            )?;
            let rows = stmt
                .query_map(params![template_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<(String, String)>, _>>()?;
            rows
        };

        rows.into_iter()
            .map(|(context, result)| decode_record(context, result))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::EvaluationOrder;
    use crate::model::{ExecutionContext, ExecutionStatus, FieldSpec};
    use chrono::Utc;

    #[tokio::test]
    async fn test_template_round_trip_keeps_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let template = ReportTemplate::new("sales", "Sales")
            .with_field(FieldSpec::calculated(
                "margin",
                "(total_revenue - total_cost) / total_revenue",
                ["total_revenue", "total_cost"],
            ))
            .with_field(FieldSpec::source("total_revenue", "revenue"))
            .with_field(FieldSpec::sql("total_cost", "SELECT 150"));

        store.save_template(&template).await.unwrap();
        let loaded = store.load_template("sales").await.unwrap().unwrap();
        assert_eq!(loaded, template);
        assert_eq!(
            EvaluationOrder::compute(&loaded.fields).unwrap(),
            EvaluationOrder::compute(&template.fields).unwrap()
        );
        assert_eq!(store.list_templates().await.unwrap(), vec!["sales"]);
    }

    #[tokio::test]
    async fn test_execution_history_in_creation_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let ctx = ExecutionContext::manual("sales", Default::default());
            ids.push(ctx.execution_id.clone());
            store
                .create_execution(&ExecutionRecord {
                    result: ExecutionResult::pending(&ctx.execution_id),
                    context: ctx,
                })
                .await
                .unwrap();
        }

        let mut result = ExecutionResult::pending(&ids[1]);
        result.start(Utc::now());
        result.fail("field 'x' could not be resolved", Utc::now());
        store.update_execution(&result).await.unwrap();

        let listed = store.list_executions("sales").await.unwrap();
        let listed_ids: Vec<_> = listed.iter().map(|r| r.context.execution_id.clone()).collect();
        assert_eq!(listed_ids, ids);
        assert_eq!(listed[1].result.status, ExecutionStatus::Failed);

        let fetched = store.get_execution(&ids[1]).await.unwrap().unwrap();
        assert_eq!(fetched.result, result);
        assert!(store.get_execution("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_creates_parent_directories() {
        let dir = std::env::temp_dir().join(format!("tally-store-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("tally.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .save_template(&ReportTemplate::new("kept", "Kept"))
                .await
                .unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert!(reopened.load_template("kept").await.unwrap().is_some());
        std::fs::remove_dir_all(&dir).ok();
    }
}
