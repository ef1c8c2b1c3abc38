// src/model/field.rs
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::value::Value;

/// Quoted spans, `::` casts, and `:name` placeholders. Only the last
/// alternative captures, so names inside string literals are skipped.
static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"'(?:[^']|'')*'|"(?:[^"]|"")*"|::|:([A-Za-z_][A-Za-z0-9_]*)"#).unwrap()
});

/// Named placeholders in a query, in first-use order.
pub fn placeholders(query: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    PLACEHOLDER
        .captures_iter(query)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Declaration of one column/value that appears in or feeds a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Unique within the template.
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<FieldFormat>,
    /// Hidden fields are computed but not emitted in the resolved row.
    #[serde(default = "default_visible")]
    pub visible: bool,
    /// Resolution errors degrade to null plus a warning.
    #[serde(default)]
    pub best_effort: bool,
}

fn default_visible() -> bool {
    true
}

/// Field kind with its kind-specific configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    /// Direct lookup on the entity context: `customer.address.city`.
    Source {
        path: String,
        #[serde(default)]
        optional: bool,
    },
    /// Formula over other fields.
    Calculated {
        formula: String,
        #[serde(default)]
        dependencies: BTreeSet<String>,
    },
    /// Execution parameter.
    Parameter {
        /// Parameter name; defaults to the field name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parameter: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
        #[serde(default)]
        required: bool,
    },
    /// Embedded SQL fragment executed by the query engine.
    Sql {
        query: String,
        #[serde(default)]
        bindings: BTreeMap<String, Binding>,
        #[serde(default)]
        shape: ResultShape,
    },
    /// Aggregate over a table, rendered by the query engine.
    Aggregate {
        function: AggregateFunction,
        table: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        column: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
        #[serde(default)]
        group_by: Vec<String>,
        #[serde(default)]
        bindings: BTreeMap<String, Binding>,
    },
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Source { .. } => "source",
            FieldKind::Calculated { .. } => "calculated",
            FieldKind::Parameter { .. } => "parameter",
            FieldKind::Sql { .. } => "sql",
            FieldKind::Aggregate { .. } => "aggregate",
        }
    }
}

/// Where a bound query parameter takes its value from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding {
    /// A field resolved earlier in the evaluation order.
    Field(String),
    /// An execution parameter.
    Parameter(String),
    /// A dot path on the entity context.
    Entity(String),
    Literal(Value),
}

impl Binding {
    /// The field this binding reads, if any.
    pub fn field_reference(&self) -> Option<&str> {
        match self {
            Binding::Field(name) => Some(name),
            _ => None,
        }
    }
}

/// How query results are handed back for an `sql` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResultShape {
    /// First column of the first row.
    #[default]
    Scalar,
    /// First row as an object.
    Row,
    /// All rows as a nested collection.
    Rows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Sum,
    Avg,
    Count,
    CountDistinct,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Count | AggregateFunction::CountDistinct => "COUNT",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        }
    }
}

/// Display format applied by renderers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum FieldFormat {
    Number {
        #[serde(default)]
        decimals: u8,
    },
    Percent {
        #[serde(default)]
        decimals: u8,
    },
    Currency {
        symbol: String,
        #[serde(default = "default_currency_decimals")]
        decimals: u8,
    },
    Text,
}

fn default_currency_decimals() -> u8 {
    2
}

impl FieldSpec {
    fn with_kind(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            display_name: None,
            format: None,
            visible: true,
            best_effort: false,
        }
    }

    /// Source field reading a dot path from the entity.
    pub fn source(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            FieldKind::Source {
                path: path.into(),
                optional: false,
            },
        )
    }

    /// Optional source field: a missing path yields null.
    pub fn optional_source(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            FieldKind::Source {
                path: path.into(),
                optional: true,
            },
        )
    }

    pub fn calculated<I, S>(name: impl Into<String>, formula: impl Into<String>, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_kind(
            name,
            FieldKind::Calculated {
                formula: formula.into(),
                dependencies: deps.into_iter().map(Into::into).collect(),
            },
        )
    }

    pub fn parameter(name: impl Into<String>, default: Option<Value>, required: bool) -> Self {
        Self::with_kind(
            name,
            FieldKind::Parameter {
                parameter: None,
                default,
                required,
            },
        )
    }

    /// Scalar SQL field with no explicit bindings.
    pub fn sql(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            FieldKind::Sql {
                query: query.into(),
                bindings: BTreeMap::new(),
                shape: ResultShape::Scalar,
            },
        )
    }

    pub fn aggregate(
        name: impl Into<String>,
        function: AggregateFunction,
        table: impl Into<String>,
        column: Option<&str>,
    ) -> Self {
        Self::with_kind(
            name,
            FieldKind::Aggregate {
                function,
                table: table.into(),
                column: column.map(str::to_string),
                filter: None,
                group_by: Vec::new(),
                bindings: BTreeMap::new(),
            },
        )
    }

    pub fn with_binding(mut self, param: impl Into<String>, binding: Binding) -> Self {
        match &mut self.kind {
            FieldKind::Sql { bindings, .. } | FieldKind::Aggregate { bindings, .. } => {
                bindings.insert(param.into(), binding);
            }
            _ => {}
        }
        self
    }

    /// Aggregate filter predicate.
    pub fn with_filter(mut self, predicate: impl Into<String>) -> Self {
        if let FieldKind::Aggregate { filter, .. } = &mut self.kind {
            *filter = Some(predicate.into());
        }
        self
    }

    pub fn with_group_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let FieldKind::Aggregate { group_by, .. } = &mut self.kind {
            *group_by = columns.into_iter().map(Into::into).collect();
        }
        self
    }

    pub fn with_shape(mut self, new_shape: ResultShape) -> Self {
        if let FieldKind::Sql { shape, .. } = &mut self.kind {
            *shape = new_shape;
        }
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_format(mut self, format: FieldFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn is_calculated(&self) -> bool {
        matches!(self.kind, FieldKind::Calculated { .. })
    }

    /// Declared dependencies of a calculated field, plus `field` bindings of
    /// query fields. Empty for every other kind.
    pub fn dependencies(&self) -> Vec<&str> {
        match &self.kind {
            FieldKind::Calculated { dependencies, .. } => {
                dependencies.iter().map(String::as_str).collect()
            }
            FieldKind::Sql { bindings, .. } | FieldKind::Aggregate { bindings, .. } => bindings
                .values()
                .filter_map(Binding::field_reference)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Placeholders of a query field with no explicit bindings. Each one is
    /// bound from the field of the same name when the template has one, so
    /// these count as reads for ordering. A placeholder naming the field
    /// itself is left out and binds the execution parameter.
    pub fn implicit_reads(&self) -> Vec<String> {
        let text = match &self.kind {
            FieldKind::Sql {
                query, bindings, ..
            } if bindings.is_empty() => query.as_str(),
            FieldKind::Aggregate {
                filter: Some(filter),
                bindings,
                ..
            } if bindings.is_empty() => filter.as_str(),
            _ => return Vec::new(),
        };
        placeholders(text)
            .into_iter()
            .filter(|name| *name != self.name)
            .collect()
    }

    /// Label used by renderers.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}
