//! Execution service.
//!
//! [`ReportEngine`] owns the execution lifecycle:
//!
//! ```text
//!   pending --> in_progress --> completed
//!                    |--------> failed
//!                    +--------> canceled
//! ```
//!
//! A context (manual or trigger-produced) is persisted as `pending`, the
//! assembler resolves its fields, outputs are rendered through the renderer
//! registered for each format, and the record is written back in exactly one
//! terminal state. Trigger-produced runs report completion to the evaluator,
//! which may release a queued firing.

mod error;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::assemble::{AssembleError, CancellationFlag, ReportAssembler};
use crate::dependency::EvaluationOrder;
use crate::model::{
    ExecutionContext, ExecutionResult, ExecutionStatus, OutputFormat, OutputReference,
    ReportTemplate, ResolvedRow, Value,
};
use crate::provider::{EntityStore, OutputRenderer, QueryEngine, RenderInput};
use crate::resolve::FieldResolver;
use crate::store::{ExecutionRecord, ExecutionStore, MemoryStore, StoreError, TemplateStore};
use crate::trigger::{
    EvaluatorConfig, Event, FireOutcome, TickOutcome, TriggerEvaluator, TriggerKey,
};
use crate::validation::{validate_template, ValidationResult};

pub use error::{EngineError, EngineResult};

/// Report execution service.
pub struct ReportEngine {
    templates: Arc<dyn TemplateStore>,
    executions: Arc<dyn ExecutionStore>,
    assembler: ReportAssembler,
    triggers: TriggerEvaluator,
    renderers: HashMap<OutputFormat, Arc<dyn OutputRenderer>>,
    /// Cancellation flags of executions currently running, by execution id.
    running: DashMap<String, CancellationFlag>,
}

impl ReportEngine {
    pub fn new(
        resolver: FieldResolver,
        templates: Arc<dyn TemplateStore>,
        executions: Arc<dyn ExecutionStore>,
        config: EvaluatorConfig,
    ) -> Self {
        let triggers =
            TriggerEvaluator::new(config).with_query_engine(Arc::clone(resolver.queries()));
        Self {
            templates,
            executions,
            assembler: ReportAssembler::new(resolver),
            triggers,
            renderers: HashMap::new(),
            running: DashMap::new(),
        }
    }

    /// Engine backed by a [`MemoryStore`].
    pub fn in_memory(
        entities: Arc<dyn EntityStore>,
        queries: Arc<dyn QueryEngine>,
        config: EvaluatorConfig,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(
            FieldResolver::new(entities, queries),
            store.clone(),
            store,
            config,
        )
    }

    /// Register the renderer for its output format, replacing any previous one.
    pub fn with_renderer(mut self, renderer: Arc<dyn OutputRenderer>) -> Self {
        self.renderers.insert(renderer.format(), renderer);
        self
    }

    pub fn triggers(&self) -> &TriggerEvaluator {
        &self.triggers
    }

    pub fn assembler(&self) -> &ReportAssembler {
        &self.assembler
    }

    // === Templates ===

    pub fn validate_template(&self, template: &ReportTemplate) -> ValidationResult {
        validate_template(template)
    }

    /// Validate, persist, and register the triggers of a template.
    ///
    /// Invalid templates are refused. Saving drops the cached evaluation order
    /// so the next run uses the new field set.
    pub async fn save_template(&self, template: &ReportTemplate) -> EngineResult<EvaluationOrder> {
        let order = validate_template(template)
            .into_result()
            .map_err(|errors| EngineError::InvalidTemplate {
                template: template.id.clone(),
                errors,
            })?;

        self.templates.save_template(template).await?;
        self.assembler.invalidate(&template.id);
        let registered = self.triggers.register(template)?;
        info!(
            template = %template.id,
            fields = template.fields.len(),
            triggers = registered,
            "saved template"
        );
        Ok(order)
    }

    pub async fn load_template(&self, id: &str) -> EngineResult<ReportTemplate> {
        self.templates
            .load_template(id)
            .await?
            .ok_or_else(|| EngineError::TemplateNotFound(id.to_string()))
    }

    pub async fn delete_template(&self, id: &str) -> EngineResult<bool> {
        let deleted = self.templates.delete_template(id).await?;
        self.assembler.invalidate(id);
        self.triggers.unregister(id);
        Ok(deleted)
    }

    /// Register the triggers of every stored template. Returns the number of
    /// templates loaded.
    pub async fn restore(&self) -> EngineResult<usize> {
        let ids = self.templates.list_templates().await?;
        for id in &ids {
            let template = self.load_template(id).await?;
            if let Err(err) = self.triggers.register(&template) {
                warn!(template = %id, error = %err, "stored template has invalid triggers");
            }
        }
        Ok(ids.len())
    }

    // === Executions ===

    /// Run a template on request.
    pub async fn execute(
        &self,
        template_id: &str,
        parameters: BTreeMap<String, Value>,
        entity_id: Option<String>,
    ) -> EngineResult<ExecutionRecord> {
        let ctx = ExecutionContext::manual(template_id, parameters).with_entity(entity_id);
        self.execute_context(ctx).await
    }

    /// Run an already-built context to a terminal state.
    ///
    /// A context whose template cannot be loaded is still recorded as
    /// `failed` before the error is returned.
    pub async fn execute_context(&self, ctx: ExecutionContext) -> EngineResult<ExecutionRecord> {
        let template = match self.load_template(&ctx.template_id).await {
            Ok(template) => template,
            Err(err) => {
                self.record_unstarted(&ctx, &err).await;
                return Err(err);
            }
        };

        let cancel = CancellationFlag::new();
        self.running.insert(ctx.execution_id.clone(), cancel.clone());

        let outcome = self.run(&template, &ctx, &cancel).await;
        self.running.remove(&ctx.execution_id);
        let result = outcome?;

        Ok(ExecutionRecord {
            context: ctx,
            result,
        })
    }

    async fn run(
        &self,
        template: &ReportTemplate,
        ctx: &ExecutionContext,
        cancel: &CancellationFlag,
    ) -> EngineResult<ExecutionResult> {
        let mut result = ExecutionResult::pending(&ctx.execution_id);
        self.executions
            .create_execution(&ExecutionRecord {
                context: ctx.clone(),
                result: result.clone(),
            })
            .await?;

        result.start(Utc::now());
        if let Err(err) = self.executions.update_execution(&result).await {
            return Err(self.fail_after_store_error(result, err).await);
        }
        info!(
            execution_id = %ctx.execution_id,
            template = %template.id,
            triggered_by = %ctx.triggered_by,
            "execution started"
        );

        match self.assembler.assemble(template, ctx, cancel).await {
            // Canceled while the last field was resolving.
            Ok(_) if cancel.is_canceled() => {
                result.finish(ExecutionStatus::Canceled, Utc::now());
            }
            Ok(report) => {
                result.row_count = 1;
                result.warnings = report.warnings;
                let rows = [report.row];
                let (references, failure) = self.deliver(template, ctx, &rows, false).await;
                result.output_references = references;
                match failure {
                    Some(detail) => {
                        result.fail(detail, Utc::now());
                    }
                    None => {
                        result.finish(ExecutionStatus::Completed, Utc::now());
                    }
                }
            }
            Err(AssembleError::Canceled) => {
                result.finish(ExecutionStatus::Canceled, Utc::now());
            }
            Err(err) => {
                let detail = err.to_string();
                if let AssembleError::FieldResolution { partial, .. } = err {
                    if template.partial_tolerant {
                        let rows = [*partial];
                        let (references, failure) = self.deliver(template, ctx, &rows, true).await;
                        if let Some(failure) = failure {
                            warn!(execution_id = %ctx.execution_id, error = %failure, "partial output delivery failed");
                        }
                        result.row_count = 1;
                        result.output_references = references;
                    }
                }
                result.fail(detail, Utc::now());
            }
        }

        if let Err(err) = self.executions.update_execution(&result).await {
            return Err(self.fail_after_store_error(result, err).await);
        }
        match result.status {
            ExecutionStatus::Completed => info!(
                execution_id = %ctx.execution_id,
                duration_ms = result.timing.duration_ms(),
                warnings = result.warnings.len(),
                "execution completed"
            ),
            status => warn!(
                execution_id = %ctx.execution_id,
                %status,
                error = result.error_detail.as_deref().unwrap_or(""),
                "execution did not complete"
            ),
        }
        Ok(result)
    }

    /// Persist a `failed` record for a context that never started.
    async fn record_unstarted(&self, ctx: &ExecutionContext, err: &EngineError) {
        let mut result = ExecutionResult::pending(&ctx.execution_id);
        result.fail(err.to_string(), Utc::now());
        let record = ExecutionRecord {
            context: ctx.clone(),
            result,
        };
        match self.executions.create_execution(&record).await {
            Ok(()) => warn!(
                execution_id = %ctx.execution_id,
                template = %ctx.template_id,
                error = %err,
                "execution failed before start"
            ),
            Err(store_err) => error!(
                execution_id = %ctx.execution_id,
                error = %store_err,
                "could not record failed execution"
            ),
        }
    }

    /// Retry the write as `failed` carrying the store error, whatever state
    /// the run reached. Returns the original error.
    async fn fail_after_store_error(
        &self,
        mut result: ExecutionResult,
        err: StoreError,
    ) -> EngineError {
        let now = Utc::now();
        result.status = ExecutionStatus::Failed;
        result.error_detail = Some(format!("execution store write failed: {}", err));
        result.timing.finished_at.get_or_insert(now);
        if let Err(retry) = self.executions.update_execution(&result).await {
            error!(
                execution_id = %result.execution_id,
                error = %retry,
                "execution left without a terminal state"
            );
        }
        EngineError::Store(err)
    }

    /// Render every output of the template. Stops at the first failure and
    /// returns the references delivered so far with the failure detail.
    async fn deliver(
        &self,
        template: &ReportTemplate,
        ctx: &ExecutionContext,
        rows: &[ResolvedRow],
        partial: bool,
    ) -> (Vec<OutputReference>, Option<String>) {
        let mut references = Vec::with_capacity(template.outputs.len());
        for output in &template.outputs {
            let Some(renderer) = self.renderers.get(&output.format) else {
                return (
                    references,
                    Some(format!(
                        "no renderer registered for '{}' output",
                        output.format.as_str()
                    )),
                );
            };
            let input = RenderInput {
                execution_id: &ctx.execution_id,
                template,
                rows,
                partial,
            };
            match renderer.render(input, output).await {
                Ok(reference) => references.push(reference),
                Err(err) => {
                    return (
                        references,
                        Some(format!("{} output failed: {}", output.format.as_str(), err)),
                    );
                }
            }
        }
        (references, None)
    }

    pub async fn get_execution(&self, execution_id: &str) -> EngineResult<ExecutionRecord> {
        self.executions
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))
    }

    pub async fn get_execution_status(&self, execution_id: &str) -> EngineResult<ExecutionResult> {
        Ok(self.get_execution(execution_id).await?.result)
    }

    pub async fn list_executions(&self, template_id: &str) -> EngineResult<Vec<ExecutionRecord>> {
        Ok(self.executions.list_executions(template_id).await?)
    }

    /// Ids of executions currently running.
    pub fn running_executions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Request cancellation of a running execution. It stops before its next
    /// field, or before delivery when the last field is already running. A
    /// request that arrives during delivery is registered but the run still
    /// completes. Returns false if the execution already finished.
    pub async fn cancel(&self, execution_id: &str) -> EngineResult<bool> {
        if let Some(flag) = self.running.get(execution_id) {
            flag.cancel();
            info!(%execution_id, "cancellation requested");
            return Ok(true);
        }
        self.get_execution(execution_id).await?;
        Ok(false)
    }

    // === Triggers ===

    /// Execute a trigger-produced context, report completion to the
    /// evaluator, and run every queued firing it releases.
    pub async fn run_triggered(&self, ctx: ExecutionContext) -> Vec<ExecutionRecord> {
        let key = TriggerKey::of(&ctx);
        let mut records = Vec::new();
        let mut next = Some(ctx);

        while let Some(ctx) = next.take() {
            let execution_id = ctx.execution_id.clone();
            match self.execute_context(ctx).await {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(trigger = %key, %execution_id, error = %err, "triggered execution failed to run");
                }
            }
            next = self.triggers.complete(&key);
        }
        records
    }

    /// Evaluate every trigger at `now` and run the ones that fired.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Vec<ExecutionRecord> {
        let outcomes = self.triggers.tick(now).await;
        self.run_outcomes(outcomes).await
    }

    /// Deliver a domain event and run the triggers it fired.
    pub async fn handle_event(&self, event: &Event, now: DateTime<Utc>) -> Vec<ExecutionRecord> {
        let outcomes = self.triggers.dispatch_event(event, now);
        self.run_outcomes(outcomes).await
    }

    /// Fire an `api` trigger and run it.
    ///
    /// Returns no records when the firing was queued behind a running one.
    pub async fn request(
        &self,
        key: &TriggerKey,
        parameters: BTreeMap<String, Value>,
    ) -> EngineResult<Vec<ExecutionRecord>> {
        match self.triggers.request(key, parameters, Utc::now())? {
            FireOutcome::Started(ctx) => Ok(self.run_triggered(ctx).await),
            FireOutcome::Queued {
                execution_id,
                position,
            } => {
                debug!(trigger = %key, %execution_id, position, "api firing queued");
                Ok(Vec::new())
            }
        }
    }

    async fn run_outcomes(&self, outcomes: Vec<TickOutcome>) -> Vec<ExecutionRecord> {
        let started: Vec<ExecutionContext> = outcomes
            .into_iter()
            .filter_map(|outcome| match outcome.result {
                Ok(fired) => fired.started(),
                Err(err) => {
                    debug!(trigger = %outcome.key, error = %err, "trigger did not start");
                    None
                }
            })
            .collect();

        join_all(started.into_iter().map(|ctx| self.run_triggered(ctx)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }
}
