//! Trigger evaluation.
//!
//! Every enabled trigger of a registered template has a small state machine:
//!
//! ```text
//!   disabled --enable--> idle --(due condition)--> due --> firing
//!                         ^                                  |
//!                         +------------complete--------------+
//! ```
//!
//! What makes a trigger due depends on its kind: a cron fire time passing
//! (`schedule`), a matching event (`event`), a non-empty condition query
//! checked at an interval (`query`). `api` triggers skip `due` and fire on
//! request. A trigger that becomes due while it is still firing is either
//! rejected or queued, per [`FiringPolicy`].

pub mod cron;
mod evaluator;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::formula::FormulaError;
use crate::model::{ExecutionContext, Value};

pub use cron::{CronError, CronSchedule};
pub use evaluator::{TickOutcome, TriggerEvaluator};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("trigger '{0}' is already firing; new firing rejected")]
    ConcurrencyRejected(TriggerKey),

    #[error("trigger '{key}' queue is full ({depth} pending)")]
    QueueFull { key: TriggerKey, depth: usize },

    #[error("unknown trigger '{0}'")]
    UnknownTrigger(TriggerKey),

    #[error("trigger '{0}' is disabled")]
    Disabled(TriggerKey),

    #[error("trigger '{key}' is not a {expected} trigger")]
    WrongKind {
        key: TriggerKey,
        expected: &'static str,
    },

    #[error("trigger '{key}' requires parameter '{parameter}'")]
    MissingRequiredParameter { key: TriggerKey, parameter: String },

    #[error("trigger '{key}': {source}")]
    Cron { key: TriggerKey, source: CronError },

    #[error("trigger '{key}': {source}")]
    Formula {
        key: TriggerKey,
        source: FormulaError,
    },
}

pub type TriggerResult<T> = Result<T, TriggerError>;

/// Triggers are addressed by template and trigger name. Concurrency control
/// is scoped to this key, never to the whole template.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub template_id: String,
    pub trigger: String,
}

impl TriggerKey {
    pub fn new(template_id: impl Into<String>, trigger: impl Into<String>) -> Self {
        Self {
            template_id: template_id.into(),
            trigger: trigger.into(),
        }
    }

    /// Key of the trigger that produced an execution.
    pub fn of(ctx: &ExecutionContext) -> Self {
        Self::new(&ctx.template_id, &ctx.triggered_by)
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.template_id, self.trigger)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerState {
    Disabled,
    Idle,
    Due,
    Firing,
}

/// What happens when a trigger becomes due while it is already firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FiringPolicy {
    /// Drop the new firing and log it.
    #[default]
    Reject,
    /// Hold the new context and release it when the running one completes.
    Queue,
}

/// Evaluator tuning, read from the `[engine]` settings section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub firing_policy: FiringPolicy,
    /// Bound on queued firings per trigger under [`FiringPolicy::Queue`].
    pub max_queue_depth: usize,
    /// Used by query triggers that declare no interval.
    pub default_check_interval_secs: u64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            firing_policy: FiringPolicy::Reject,
            max_queue_depth: 16,
            default_check_interval_secs: 60,
        }
    }
}

/// A domain event delivered by the host's event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    /// Entity the event concerns; overrides the trigger's own entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            entity_id: None,
        }
    }

    pub fn for_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }
}

/// Result of a successful firing decision.
#[derive(Debug, Clone, PartialEq)]
pub enum FireOutcome {
    /// The trigger moved to `firing`; run this context.
    Started(ExecutionContext),
    /// The trigger was busy; the context runs after the current one.
    Queued {
        execution_id: String,
        position: usize,
    },
}

impl FireOutcome {
    pub fn started(self) -> Option<ExecutionContext> {
        match self {
            FireOutcome::Started(ctx) => Some(ctx),
            FireOutcome::Queued { .. } => None,
        }
    }
}
