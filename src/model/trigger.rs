// src/model/trigger.rs
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::value::Value;

/// A condition or schedule that causes a report execution to be enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    /// Unique within the template.
    pub name: String,
    #[serde(flatten)]
    pub kind: TriggerKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Parameters passed to every execution this trigger fires.
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    /// Entity the fired executions resolve against (events may override it).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Five-field cron expression.
    Schedule { cron: String },
    /// Domain event with an optional filter formula over its payload.
    Event {
        event_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
    /// Fires on external request when all required parameters are present.
    Api {
        #[serde(default)]
        required_parameters: Vec<String>,
    },
    /// Fires when the condition query returns at least one row.
    Query {
        condition: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        check_interval_secs: Option<u64>,
    },
}

impl TriggerKind {
    pub fn origin(&self) -> TriggerOrigin {
        match self {
            TriggerKind::Schedule { .. } => TriggerOrigin::Schedule,
            TriggerKind::Event { .. } => TriggerOrigin::Event,
            TriggerKind::Api { .. } => TriggerOrigin::Api,
            TriggerKind::Query { .. } => TriggerOrigin::Query,
        }
    }
}

/// What caused an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOrigin {
    Manual,
    Schedule,
    Event,
    Api,
    Query,
}

impl TriggerOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerOrigin::Manual => "manual",
            TriggerOrigin::Schedule => "schedule",
            TriggerOrigin::Event => "event",
            TriggerOrigin::Api => "api",
            TriggerOrigin::Query => "query",
        }
    }
}

impl std::fmt::Display for TriggerOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TriggerSpec {
    fn with_kind(name: impl Into<String>, kind: TriggerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: true,
            parameters: BTreeMap::new(),
            entity: None,
        }
    }

    pub fn schedule(name: impl Into<String>, cron: impl Into<String>) -> Self {
        Self::with_kind(name, TriggerKind::Schedule { cron: cron.into() })
    }

    pub fn event(name: impl Into<String>, event_type: impl Into<String>, filter: Option<&str>) -> Self {
        Self::with_kind(
            name,
            TriggerKind::Event {
                event_type: event_type.into(),
                filter: filter.map(str::to_string),
            },
        )
    }

    pub fn api<I, S>(name: impl Into<String>, required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_kind(
            name,
            TriggerKind::Api {
                required_parameters: required.into_iter().map(Into::into).collect(),
            },
        )
    }

    pub fn query(name: impl Into<String>, condition: impl Into<String>, interval_secs: u64) -> Self {
        Self::with_kind(
            name,
            TriggerKind::Query {
                condition: condition.into(),
                check_interval_secs: Some(interval_secs),
            },
        )
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }
}
