//! Output rendering.
//!
//! [`JsonRenderer`] is the only built-in renderer. It applies each field's
//! [`FieldFormat`] and writes a JSON document either to the output's target
//! path or to an in-process buffer keyed by execution id.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Map};
use tokio::sync::RwLock;
use tracing::debug;

use crate::model::{
    FieldFormat, OutputFormat, OutputReference, OutputSpec, ReportTemplate, ResolvedRow, Value,
};
use crate::provider::{OutputRenderer, ProviderError, ProviderResult, RenderInput};

/// Location reported for outputs kept in memory.
pub const INLINE_LOCATION: &str = "inline";

/// Format a value for display. Nulls and non-numeric values under numeric
/// formats are passed through unchanged.
pub fn format_value(value: &Value, format: Option<&FieldFormat>) -> Value {
    let Some(format) = format else {
        return value.clone();
    };
    if value.is_null() {
        return Value::Null;
    }

    let text = match (format, value.as_f64()) {
        (FieldFormat::Number { decimals }, Some(n)) => fixed(n, *decimals),
        (FieldFormat::Percent { decimals }, Some(n)) => format!("{}%", fixed(n * 100.0, *decimals)),
        (FieldFormat::Currency { symbol, decimals }, Some(n)) => {
            let amount = fixed(n.abs(), *decimals);
            if n < 0.0 {
                format!("-{}{}", symbol, amount)
            } else {
                format!("{}{}", symbol, amount)
            }
        }
        (FieldFormat::Text, _) => value.to_string(),
        (_, None) => return value.clone(),
    };
    Value::Text(text)
}

fn fixed(n: f64, decimals: u8) -> String {
    format!("{:.*}", decimals as usize, n)
}

/// Render one row under the template's labels and formats.
pub fn format_row(template: &ReportTemplate, row: &ResolvedRow) -> Map<String, serde_json::Value> {
    row.iter()
        .map(|(name, value)| {
            let (label, format) = match template.field(name) {
                Some(field) => (field.label().to_string(), field.format.as_ref()),
                None => (name.to_string(), None),
            };
            let formatted = format_value(value, format);
            // Value serialization is infallible: no non-string map keys.
            let json = serde_json::to_value(&formatted).unwrap_or(serde_json::Value::Null);
            (label, json)
        })
        .collect()
}

/// Renders assembled rows as a JSON document.
#[derive(Default)]
pub struct JsonRenderer {
    inline: RwLock<HashMap<String, String>>,
}

impl JsonRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Document rendered in memory for an execution, if any.
    pub async fn inline_output(&self, execution_id: &str) -> Option<String> {
        self.inline.read().await.get(execution_id).cloned()
    }

    fn document(input: &RenderInput<'_>) -> ProviderResult<String> {
        let rows: Vec<_> = input
            .rows
            .iter()
            .map(|row| serde_json::Value::Object(format_row(input.template, row)))
            .collect();
        let document = json!({
            "execution_id": input.execution_id,
            "template_id": input.template.id,
            "template_name": input.template.name,
            "generated_at": Utc::now().to_rfc3339(),
            "partial": input.partial,
            "rows": rows,
        });
        Ok(serde_json::to_string_pretty(&document)?)
    }
}

#[async_trait]
impl OutputRenderer for JsonRenderer {
    fn format(&self) -> OutputFormat {
        OutputFormat::Json
    }

    async fn render(
        &self,
        input: RenderInput<'_>,
        output: &OutputSpec,
    ) -> ProviderResult<OutputReference> {
        let body = Self::document(&input)?;
        let bytes = body.len();

        let location = match &output.target {
            Some(path) => {
                let path = std::path::Path::new(path);
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| ProviderError::Render(e.to_string()))?;
                }
                tokio::fs::write(path, &body)
                    .await
                    .map_err(|e| ProviderError::Render(format!("{}: {}", path.display(), e)))?;
                path.display().to_string()
            }
            None => {
                self.inline
                    .write()
                    .await
                    .insert(input.execution_id.to_string(), body);
                INLINE_LOCATION.to_string()
            }
        };

        debug!(execution_id = input.execution_id, %location, bytes, "rendered json output");
        Ok(OutputReference {
            format: OutputFormat::Json.as_str().to_string(),
            location,
            bytes,
        })
    }
}
