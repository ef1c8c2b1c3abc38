//! Report template types.
//!
//! Templates own their `FieldSpec`s and `TriggerSpec`s. Each field and trigger
//! kind carries its own typed configuration.

pub mod execution;
pub mod field;
pub mod row;
pub mod template;
pub mod trigger;
pub mod value;

pub use execution::{
    ExecutionContext, ExecutionResult, ExecutionStatus, FieldWarning, OutputReference, Timing,
};
pub use field::{
    placeholders, AggregateFunction, Binding, FieldFormat, FieldKind, FieldSpec, ResultShape,
};
pub use row::ResolvedRow;
pub use template::{OutputFormat, OutputSpec, ReportTemplate};
pub use trigger::{TriggerKind, TriggerOrigin, TriggerSpec};
pub use value::{Row, Value};
