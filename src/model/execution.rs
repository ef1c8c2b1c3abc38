//! Execution records.
//!
//! An `ExecutionContext` is created when a trigger fires or a manual run is
//! requested and never changes afterwards. The matching `ExecutionResult` is
//! mutated as the run proceeds and ends in exactly one terminal state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::trigger::TriggerOrigin;
use super::value::Value;

/// Immutable description of one report run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub template_id: String,
    /// Entity the source fields resolve against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Trigger name, or the requesting principal for manual runs.
    pub triggered_by: String,
    pub trigger_kind: TriggerOrigin,
    pub created_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(
        template_id: impl Into<String>,
        parameters: BTreeMap<String, Value>,
        triggered_by: impl Into<String>,
        trigger_kind: TriggerOrigin,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            template_id: template_id.into(),
            entity_id: None,
            parameters,
            triggered_by: triggered_by.into(),
            trigger_kind,
            created_at,
        }
    }

    /// Manual run requested through the API.
    pub fn manual(template_id: impl Into<String>, parameters: BTreeMap<String, Value>) -> Self {
        Self::new(template_id, parameters, "manual", TriggerOrigin::Manual, Utc::now())
    }

    pub fn with_entity(mut self, entity_id: Option<String>) -> Self {
        self.entity_id = entity_id;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Canceled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::InProgress => "in_progress",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Timing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Timing {
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

/// A best-effort field that degraded to null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldWarning {
    pub field: String,
    pub message: String,
}

/// Link to a rendered output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputReference {
    pub format: String,
    /// Where the output went (path, address, URL) or a delivery receipt.
    pub location: String,
    #[serde(default)]
    pub bytes: usize,
}

/// Mutable status of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub row_count: usize,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default)]
    pub warnings: Vec<FieldWarning>,
    #[serde(default)]
    pub output_references: Vec<OutputReference>,
}

impl ExecutionResult {
    pub fn pending(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            status: ExecutionStatus::Pending,
            row_count: 0,
            timing: Timing::default(),
            error_detail: None,
            warnings: Vec::new(),
            output_references: Vec::new(),
        }
    }

    pub fn start(&mut self, at: DateTime<Utc>) {
        if self.status == ExecutionStatus::Pending {
            self.status = ExecutionStatus::InProgress;
            self.timing.started_at = Some(at);
        }
    }

    /// Move to a terminal state. Returns false if already terminal.
    pub fn finish(&mut self, status: ExecutionStatus, at: DateTime<Utc>) -> bool {
        debug_assert!(status.is_terminal());
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.timing.finished_at = Some(at);
        true
    }

    pub fn fail(&mut self, detail: impl Into<String>, at: DateTime<Utc>) -> bool {
        let changed = self.finish(ExecutionStatus::Failed, at);
        if changed {
            self.error_detail = Some(detail.into());
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_state_is_sticky() {
        let now = Utc::now();
        let mut result = ExecutionResult::pending("exec-1");
        result.start(now);
        assert_eq!(result.status, ExecutionStatus::InProgress);

        assert!(result.finish(ExecutionStatus::Completed, now));
        assert!(!result.fail("late failure", now));
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert!(result.error_detail.is_none());
    }

    #[test]
    fn test_manual_context_has_unique_id() {
        let a = ExecutionContext::manual("t", BTreeMap::new());
        let b = ExecutionContext::manual("t", BTreeMap::new());
        assert_ne!(a.execution_id, b.execution_id);
        assert_eq!(a.trigger_kind, TriggerOrigin::Manual);
    }
}
