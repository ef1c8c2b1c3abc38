//! # Tally
//!
//! Report field resolution and trigger evaluation.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Trigger Evaluator                      │
//! │      (schedule / event / api / query condition)         │
//! └─────────────────────────────────────────────────────────┘
//!                          │ ExecutionContext
//!                          ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Execution Service                      │
//! │   (records, cancellation, output dispatch)              │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [assembler]
//! ┌─────────────────────────────────────────────────────────┐
//! │        Evaluation order (cached per template)           │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [resolver]
//! ┌─────────────────────────────────────────────────────────┐
//! │  EntityStore · QueryEngine · formulas · parameters      │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                  Output renderers                       │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod assemble;
pub mod config;
pub mod dependency;
pub mod engine;
pub mod formula;
pub mod hash;
pub mod model;
pub mod provider;
pub mod render;
pub mod resolve;
pub mod store;
pub mod trigger;
pub mod validation;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::assemble::{AssembleError, CancellationFlag, ReportAssembler};
    pub use crate::dependency::{EvaluationOrder, OrderError};
    pub use crate::engine::{EngineError, ReportEngine};
    pub use crate::model::{
        Binding, ExecutionContext, ExecutionResult, ExecutionStatus, FieldFormat, FieldSpec,
        OutputFormat, ReportTemplate, ResolvedRow, TriggerSpec, Value,
    };
    pub use crate::provider::{EntityStore, OutputRenderer, QueryEngine};
    pub use crate::render::JsonRenderer;
    pub use crate::resolve::FieldResolver;
    pub use crate::store::{ExecutionStore, MemoryStore, SqliteStore, TemplateStore};
    pub use crate::trigger::{Event, FiringPolicy, TriggerEvaluator, TriggerKey};
    pub use crate::validation::{validate_template, ValidationError, ValidationResult};
}
