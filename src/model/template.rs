// src/model/template.rs
use serde::{Deserialize, Serialize};

use super::field::FieldSpec;
use super::trigger::TriggerSpec;
use crate::hash::compute_hash;

/// A report template: the fields it computes, what fires it, and where the
/// assembled rows go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportTemplate {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    /// Deliver partially-populated rows when a field fails.
    #[serde(default)]
    pub partial_tolerant: bool,
}

/// Output destination for assembled rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub format: OutputFormat,
    /// Renderer-specific destination (file path, address, URL).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Pdf,
    Xlsx,
    Email,
    Webhook,
    Json,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Pdf => "pdf",
            OutputFormat::Xlsx => "xlsx",
            OutputFormat::Email => "email",
            OutputFormat::Webhook => "webhook",
            OutputFormat::Json => "json",
        }
    }
}

impl ReportTemplate {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            fields: Vec::new(),
            triggers: Vec::new(),
            outputs: Vec::new(),
            partial_tolerant: false,
        }
    }

    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerSpec) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn with_output(mut self, format: OutputFormat, target: Option<&str>) -> Self {
        self.outputs.push(OutputSpec {
            format,
            target: target.map(str::to_string),
        });
        self
    }

    pub fn partial_tolerant(mut self) -> Self {
        self.partial_tolerant = true;
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn trigger(&self, name: &str) -> Option<&TriggerSpec> {
        self.triggers.iter().find(|t| t.name == name)
    }

    /// Fingerprint of the field set. The cached evaluation order is valid for
    /// as long as this does not change.
    pub fn fields_fingerprint(&self) -> Result<String, serde_json::Error> {
        compute_hash(&self.fields)
    }

    /// Parse a template from TOML.
    pub fn from_toml(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    /// Parse a template from JSON.
    pub fn from_json(source: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(source)
    }
}
