use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, info, warn};

use super::{
    CronSchedule, Event, EvaluatorConfig, FireOutcome, FiringPolicy, TriggerError, TriggerKey,
    TriggerResult, TriggerState,
};
use crate::formula::Formula;
use crate::model::{
    placeholders, ExecutionContext, ReportTemplate, TriggerKind, TriggerSpec, Value,
};
use crate::provider::{QueryEngine, QueryRequest};

/// Per-kind data prepared once at registration.
#[derive(Debug)]
enum Compiled {
    Schedule(CronSchedule),
    Event {
        event_type: String,
        filter: Option<Formula>,
    },
    Api {
        required: Vec<String>,
    },
    Query {
        condition: String,
        interval: Duration,
    },
}

#[derive(Debug)]
struct TriggerEntry {
    spec: TriggerSpec,
    compiled: Compiled,
    state: TriggerState,
    last_tick: Option<DateTime<Utc>>,
    last_check: Option<DateTime<Utc>>,
    /// Execution id of the running firing.
    running: Option<String>,
    queue: VecDeque<ExecutionContext>,
    /// `disable` arrived while firing; applied on completion.
    disable_pending: bool,
}

impl TriggerEntry {
    fn new(spec: TriggerSpec, compiled: Compiled) -> Self {
        let state = if spec.enabled {
            TriggerState::Idle
        } else {
            TriggerState::Disabled
        };
        Self {
            spec,
            compiled,
            state,
            last_tick: None,
            last_check: None,
            running: None,
            queue: VecDeque::new(),
            disable_pending: false,
        }
    }

    fn build_context(
        &self,
        key: &TriggerKey,
        extra: BTreeMap<String, Value>,
        entity_id: Option<String>,
        now: DateTime<Utc>,
    ) -> ExecutionContext {
        let mut parameters = self.spec.parameters.clone();
        parameters.extend(extra);
        ExecutionContext::new(
            &key.template_id,
            parameters,
            &self.spec.name,
            self.spec.kind.origin(),
            now,
        )
        .with_entity(entity_id.or_else(|| self.spec.entity.clone()))
    }

    /// `due -> firing`, or the firing policy when already firing.
    fn fire(
        &mut self,
        key: &TriggerKey,
        ctx: ExecutionContext,
        config: &EvaluatorConfig,
    ) -> TriggerResult<FireOutcome> {
        match self.state {
            TriggerState::Disabled => Err(TriggerError::Disabled(key.clone())),
            TriggerState::Idle | TriggerState::Due => {
                self.state = TriggerState::Firing;
                self.running = Some(ctx.execution_id.clone());
                info!(trigger = %key, execution_id = %ctx.execution_id, "trigger firing");
                Ok(FireOutcome::Started(ctx))
            }
            TriggerState::Firing => match config.firing_policy {
                FiringPolicy::Reject => {
                    warn!(trigger = %key, "trigger already firing, rejecting new firing");
                    Err(TriggerError::ConcurrencyRejected(key.clone()))
                }
                FiringPolicy::Queue if self.queue.len() >= config.max_queue_depth => {
                    warn!(trigger = %key, depth = self.queue.len(), "trigger queue full");
                    Err(TriggerError::QueueFull {
                        key: key.clone(),
                        depth: self.queue.len(),
                    })
                }
                FiringPolicy::Queue => {
                    let execution_id = ctx.execution_id.clone();
                    self.queue.push_back(ctx);
                    debug!(trigger = %key, position = self.queue.len(), "firing queued");
                    Ok(FireOutcome::Queued {
                        execution_id,
                        position: self.queue.len(),
                    })
                }
            },
        }
    }
}

/// Outcome of one trigger during a tick or event dispatch.
#[derive(Debug)]
pub struct TickOutcome {
    pub key: TriggerKey,
    pub result: TriggerResult<FireOutcome>,
}

/// Decides when registered triggers fire.
///
/// The evaluator only produces [`ExecutionContext`]s; running them is the
/// caller's job. Callers report completion through
/// [`TriggerEvaluator::complete`], which also releases queued firings.
pub struct TriggerEvaluator {
    entries: DashMap<TriggerKey, TriggerEntry>,
    config: EvaluatorConfig,
    queries: Option<Arc<dyn QueryEngine>>,
}

impl TriggerEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            queries: None,
        }
    }

    /// Query engine used to check `query` trigger conditions.
    pub fn with_query_engine(mut self, queries: Arc<dyn QueryEngine>) -> Self {
        self.queries = Some(queries);
        self
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Register every trigger of a template.
    ///
    /// Re-registering keeps the runtime state (firing, queue, last tick) of
    /// triggers that still exist and drops the ones that were removed.
    pub fn register(&self, template: &ReportTemplate) -> TriggerResult<usize> {
        let mut compiled = Vec::with_capacity(template.triggers.len());
        for spec in &template.triggers {
            let key = TriggerKey::new(&template.id, &spec.name);
            compiled.push((key.clone(), spec.clone(), self.compile(&key, spec)?));
        }

        self.entries.retain(|key, _| {
            key.template_id != template.id || template.trigger(&key.trigger).is_some()
        });

        let count = compiled.len();
        for (key, spec, compiled) in compiled {
            match self.entries.get_mut(&key) {
                Some(mut entry) => {
                    match (spec.enabled, entry.state) {
                        (false, TriggerState::Firing) => entry.disable_pending = true,
                        (false, _) => entry.state = TriggerState::Disabled,
                        (true, TriggerState::Disabled) => entry.state = TriggerState::Idle,
                        (true, _) => entry.disable_pending = false,
                    }
                    entry.spec = spec;
                    entry.compiled = compiled;
                }
                None => {
                    self.entries.insert(key, TriggerEntry::new(spec, compiled));
                }
            }
        }
        debug!(template = %template.id, triggers = count, "registered triggers");
        Ok(count)
    }

    fn compile(&self, key: &TriggerKey, spec: &TriggerSpec) -> TriggerResult<Compiled> {
        Ok(match &spec.kind {
            TriggerKind::Schedule { cron } => {
                Compiled::Schedule(CronSchedule::parse(cron).map_err(|source| {
                    TriggerError::Cron {
                        key: key.clone(),
                        source,
                    }
                })?)
            }
            TriggerKind::Event { event_type, filter } => Compiled::Event {
                event_type: event_type.clone(),
                filter: filter
                    .as_deref()
                    .map(Formula::parse)
                    .transpose()
                    .map_err(|source| TriggerError::Formula {
                        key: key.clone(),
                        source,
                    })?,
            },
            TriggerKind::Api {
                required_parameters,
            } => Compiled::Api {
                required: required_parameters.clone(),
            },
            TriggerKind::Query {
                condition,
                check_interval_secs,
            } => {
                let secs = check_interval_secs.unwrap_or(self.config.default_check_interval_secs);
                Compiled::Query {
                    condition: condition.clone(),
                    interval: Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000)),
                }
            }
        })
    }

    /// Drop every trigger of a template.
    pub fn unregister(&self, template_id: &str) {
        self.entries.retain(|key, _| key.template_id != template_id);
    }

    pub fn state(&self, key: &TriggerKey) -> Option<TriggerState> {
        self.entries.get(key).map(|e| e.state)
    }

    /// Number of queued firings waiting behind the running one.
    pub fn queued(&self, key: &TriggerKey) -> usize {
        self.entries.get(key).map(|e| e.queue.len()).unwrap_or(0)
    }

    pub fn keys(&self) -> Vec<TriggerKey> {
        let mut keys: Vec<_> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// `disabled -> idle`.
    pub fn enable(&self, key: &TriggerKey) -> TriggerResult<()> {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| TriggerError::UnknownTrigger(key.clone()))?;
        entry.disable_pending = false;
        if entry.state == TriggerState::Disabled {
            entry.state = TriggerState::Idle;
            entry.last_tick = None;
            entry.last_check = None;
        }
        Ok(())
    }

    /// Disable a trigger. A firing trigger finishes its current run first;
    /// queued firings are dropped.
    pub fn disable(&self, key: &TriggerKey) -> TriggerResult<()> {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| TriggerError::UnknownTrigger(key.clone()))?;
        if !entry.queue.is_empty() {
            warn!(trigger = %key, dropped = entry.queue.len(), "dropping queued firings");
            entry.queue.clear();
        }
        if entry.state == TriggerState::Firing {
            entry.disable_pending = true;
        } else {
            entry.state = TriggerState::Disabled;
        }
        Ok(())
    }

    /// Evaluate time-based triggers at `now`.
    ///
    /// Schedule triggers are due when a cron fire time lies in
    /// `(last tick, now]`; on their first tick, when `now` itself is a fire
    /// time. Query triggers whose check interval has elapsed run their
    /// condition concurrently and are due when it returns any row.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<TickOutcome> {
        let mut outcomes = Vec::new();
        let mut checks = Vec::new();

        for mut item in self.entries.iter_mut() {
            let key = item.key().clone();
            let entry = item.value_mut();
            if entry.state == TriggerState::Disabled {
                continue;
            }

            let schedule_due = match &entry.compiled {
                Compiled::Schedule(cron) => Some(match entry.last_tick {
                    Some(last) => cron.fires_between(last, now),
                    None => cron.matches(now),
                }),
                _ => None,
            };
            if let Some(due) = schedule_due {
                entry.last_tick = Some(now);
                if due {
                    if entry.state == TriggerState::Idle {
                        entry.state = TriggerState::Due;
                    }
                    let ctx = entry.build_context(&key, BTreeMap::new(), None, now);
                    let result = entry.fire(&key, ctx, &self.config);
                    outcomes.push(TickOutcome { key, result });
                }
                continue;
            }

            if let Compiled::Query {
                condition,
                interval,
            } = &entry.compiled
            {
                if entry.last_check.map_or(true, |last| now - last >= *interval) {
                    checks.push((key, condition.clone(), entry.spec.parameters.clone()));
                    entry.last_check = Some(now);
                }
            }
        }

        if checks.is_empty() {
            return outcomes;
        }
        let Some(queries) = self.queries.clone() else {
            warn!(count = checks.len(), "query triggers registered without a query engine");
            return outcomes;
        };

        let results = join_all(checks.into_iter().map(|(key, condition, parameters)| {
            let queries = queries.clone();
            async move {
                let params = placeholders(&condition)
                    .into_iter()
                    .filter_map(|name| parameters.get(&name).map(|v| (name, v.clone())))
                    .collect();
                let result = queries
                    .execute(&QueryRequest::Sql(condition), &params)
                    .await;
                (key, result)
            }
        }))
        .await;

        for (key, result) in results {
            let rows = match result {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(trigger = %key, error = %e, "query trigger condition failed");
                    continue;
                }
            };
            if rows.is_empty() {
                continue;
            }
            let Some(mut entry) = self.entries.get_mut(&key) else {
                continue;
            };
            if entry.state == TriggerState::Disabled {
                continue;
            }
            if entry.state == TriggerState::Idle {
                entry.state = TriggerState::Due;
            }
            let mut extra = BTreeMap::new();
            extra.insert("condition_rows".to_string(), Value::rows(rows));
            let ctx = entry.build_context(&key, extra, None, now);
            let result = entry.fire(&key, ctx, &self.config);
            outcomes.push(TickOutcome { key, result });
        }

        outcomes
    }

    /// Which triggers an event makes due. Reads state only.
    ///
    /// A filter that cannot be evaluated against the payload (for example a
    /// missing field) counts as no match.
    pub fn on_event(&self, event: &Event) -> Vec<TriggerKey> {
        let mut keys: Vec<TriggerKey> = self
            .entries
            .iter()
            .filter(|entry| entry.state != TriggerState::Disabled)
            .filter(|entry| match &entry.compiled {
                Compiled::Event { event_type, filter } => {
                    event_type == &event.event_type
                        && filter.as_ref().map_or(true, |f| {
                            f.evaluate_predicate(&event.payload).unwrap_or_else(|e| {
                                debug!(trigger = %entry.key(), error = %e, "event filter did not evaluate");
                                false
                            })
                        })
                }
                _ => false,
            })
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Fire every trigger the event makes due. The payload is passed to the
    /// execution as the `event` parameter.
    pub fn dispatch_event(&self, event: &Event, now: DateTime<Utc>) -> Vec<TickOutcome> {
        self.on_event(event)
            .into_iter()
            .filter_map(|key| {
                let mut entry = self.entries.get_mut(&key)?;
                if entry.state == TriggerState::Idle {
                    entry.state = TriggerState::Due;
                }
                let mut extra = BTreeMap::new();
                extra.insert("event".to_string(), event.payload.clone());
                let ctx = entry.build_context(&key, extra, event.entity_id.clone(), now);
                let result = entry.fire(&key, ctx, &self.config);
                Some(TickOutcome { key, result })
            })
            .collect()
    }

    /// Fire an `api` trigger on external request.
    pub fn request(
        &self,
        key: &TriggerKey,
        parameters: BTreeMap<String, Value>,
        now: DateTime<Utc>,
    ) -> TriggerResult<FireOutcome> {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| TriggerError::UnknownTrigger(key.clone()))?;

        let Compiled::Api { required } = &entry.compiled else {
            return Err(TriggerError::WrongKind {
                key: key.clone(),
                expected: "api",
            });
        };
        if let Some(missing) = required
            .iter()
            .find(|p| !parameters.contains_key(*p) && !entry.spec.parameters.contains_key(*p))
        {
            return Err(TriggerError::MissingRequiredParameter {
                key: key.clone(),
                parameter: missing.clone(),
            });
        }

        let ctx = entry.build_context(key, parameters, None, now);
        entry.fire(key, ctx, &self.config)
    }

    /// `firing -> idle` once an execution finishes, successfully or not.
    ///
    /// Returns the next queued context, if any; the trigger then stays
    /// `firing` with that context as the running one.
    pub fn complete(&self, key: &TriggerKey) -> Option<ExecutionContext> {
        let mut entry = self.entries.get_mut(key)?;
        if entry.state != TriggerState::Firing {
            return None;
        }

        if let Some(next) = entry.queue.pop_front() {
            entry.running = Some(next.execution_id.clone());
            info!(trigger = %key, execution_id = %next.execution_id, "releasing queued firing");
            return Some(next);
        }

        entry.running = None;
        entry.state = if entry.disable_pending {
            entry.disable_pending = false;
            TriggerState::Disabled
        } else {
            TriggerState::Idle
        };
        debug!(trigger = %key, state = ?entry.state, "trigger completed");
        None
    }

    /// Execution id of the trigger's running firing.
    pub fn running(&self, key: &TriggerKey) -> Option<String> {
        self.entries.get(key).and_then(|e| e.running.clone())
    }
}
