//! Leveled parallel plan execution.
//!
//! Levels run strictly in order. Within a level every subtask is dispatched
//! concurrently from a single loop that also owns the retry queue: a failed
//! attempt is parked with the time it becomes eligible again and re-offered
//! once that time arrives. Executor and selection failures are captured in
//! the [`ExecutionResult`]; only malformed input is rejected up front.

use crate::core::agent::AgentId;
use crate::core::plan::ExecutionPlan;
use crate::core::subtask::{Subtask, SubtaskId};
use crate::error::{Error, Result};
use crate::events::{Event, EventPublisher, Subscription};
use crate::orchestration::balancer::LoadBalancer;
use crate::orchestration::decomposer::Decomposition;
use crate::orchestration::registry::AgentRegistry;
use crate::orchestration::selector::{AgentSelector, ScoreWeights, SelectionCriteria, SelectionStrategy};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Failure reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExecutorError {
    pub message: String,
    /// False skips any remaining retries.
    pub retryable: bool,
}

impl ExecutorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Performs the actual work of a subtask on an agent.
///
/// Supplied by the caller; the engine never constructs executors.
#[async_trait]
pub trait SubtaskExecutor: Send + Sync {
    async fn execute(
        &self,
        agent_id: &AgentId,
        subtask: &Subtask,
    ) -> std::result::Result<serde_json::Value, ExecutorError>;

    /// Attempt to stop an in-flight call. Returns true if it was stopped.
    async fn cancel(&self, _subtask_id: &SubtaskId) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// `delay * retry`
    Linear,
    /// `delay * 2^(retry - 1)`
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionOptions {
    /// Retries after the first attempt.
    pub retry_attempts: u32,
    /// Base delay before the first retry.
    pub retry_delay_ms: u64,
    pub backoff: BackoffKind,
    /// Cap on any single retry delay.
    pub max_retry_delay_ms: u64,
    /// Keep running later levels after a subtask fails.
    pub continue_on_failure: bool,
    /// Most subtasks in flight at once within a level; unlimited when unset.
    pub max_concurrency: Option<usize>,
    /// Strategy used to pick an agent for each subtask.
    pub strategy: SelectionStrategy,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay_ms: 1000,
            backoff: BackoffKind::Exponential,
            max_retry_delay_ms: 30_000,
            continue_on_failure: false,
            max_concurrency: None,
            strategy: SelectionStrategy::Balanced,
        }
    }
}

impl ExecutionOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == Some(0) {
            return Err(Error::Validation(
                "execution.max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1-based).
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let base = self.retry_delay_ms;
        let ms = match self.backoff {
            BackoffKind::Linear => base.saturating_mul(u64::from(retry)),
            BackoffKind::Exponential => {
                base.saturating_mul(2u64.saturating_pow(retry.saturating_sub(1)))
            }
        };
        Duration::from_millis(ms.min(self.max_retry_delay_ms))
    }
}

/// Terminal state of one subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SubtaskOutcome {
    Completed {
        agent_id: AgentId,
        output: serde_json::Value,
        attempts: u32,
    },
    Failed {
        error: String,
        attempts: u32,
        last_agent: Option<AgentId>,
    },
    /// Stopped by cancellation, in flight or not yet started.
    Cancelled { attempts: u32 },
    /// Never started because an earlier level failed.
    Skipped,
}

impl SubtaskOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, SubtaskOutcome::Completed { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            SubtaskOutcome::Completed { attempts, .. }
            | SubtaskOutcome::Failed { attempts, .. }
            | SubtaskOutcome::Cancelled { attempts } => *attempts,
            SubtaskOutcome::Skipped => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskError {
    pub subtask_id: SubtaskId,
    pub message: String,
}

/// Aggregate of one plan run.
///
/// `completed + failed == total_tasks`; skipped and cancelled subtasks are
/// counted in `failed` and itemized separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub results: HashMap<SubtaskId, SubtaskOutcome>,
    pub errors: Vec<SubtaskError>,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn outcome(&self, id: &SubtaskId) -> Option<&SubtaskOutcome> {
        self.results.get(id)
    }
}

/// Events emitted by the execution engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    RunStarted { run_id: Uuid, total_tasks: usize },
    LevelStarted { level: usize, size: usize },
    SubtaskStarted {
        subtask_id: SubtaskId,
        agent_id: AgentId,
        attempt: u32,
    },
    RetryScheduled {
        subtask_id: SubtaskId,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    SubtaskCompleted {
        subtask_id: SubtaskId,
        agent_id: AgentId,
        attempts: u32,
    },
    SubtaskFailed { subtask_id: SubtaskId, error: String },
    SubtaskCancelled { subtask_id: SubtaskId },
    LevelFinished {
        level: usize,
        completed: usize,
        failed: usize,
    },
    RunFinished {
        run_id: Uuid,
        completed: usize,
        failed: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEventKind {
    RunStarted,
    LevelStarted,
    SubtaskStarted,
    RetryScheduled,
    SubtaskCompleted,
    SubtaskFailed,
    SubtaskCancelled,
    LevelFinished,
    RunFinished,
}

impl Event for EngineEvent {
    type Kind = EngineEventKind;

    fn kind(&self) -> EngineEventKind {
        match self {
            EngineEvent::RunStarted { .. } => EngineEventKind::RunStarted,
            EngineEvent::LevelStarted { .. } => EngineEventKind::LevelStarted,
            EngineEvent::SubtaskStarted { .. } => EngineEventKind::SubtaskStarted,
            EngineEvent::RetryScheduled { .. } => EngineEventKind::RetryScheduled,
            EngineEvent::SubtaskCompleted { .. } => EngineEventKind::SubtaskCompleted,
            EngineEvent::SubtaskFailed { .. } => EngineEventKind::SubtaskFailed,
            EngineEvent::SubtaskCancelled { .. } => EngineEventKind::SubtaskCancelled,
            EngineEvent::LevelFinished { .. } => EngineEventKind::LevelFinished,
            EngineEvent::RunFinished { .. } => EngineEventKind::RunFinished,
        }
    }
}

/// Per-subtask retry bookkeeping.
#[derive(Debug, Default)]
struct AttemptState {
    attempts: u32,
    last_agent: Option<AgentId>,
}

/// A failed subtask waiting for its next attempt.
struct Scheduled<'a> {
    at: Instant,
    subtask: &'a Subtask,
}

enum Wake<T> {
    Finished(Option<T>),
    RetryDue,
    Cancelled,
}

pub struct ExecutionEngine {
    selector: AgentSelector,
    registry: Arc<AgentRegistry>,
    balancer: Option<Arc<LoadBalancer>>,
    executor: Arc<dyn SubtaskExecutor>,
    shutdown: Mutex<CancellationToken>,
    events: EventPublisher<EngineEvent>,
}

impl ExecutionEngine {
    /// Engine that selects among the registry's healthy agents.
    pub fn new(registry: Arc<AgentRegistry>, executor: Arc<dyn SubtaskExecutor>) -> Self {
        Self {
            selector: AgentSelector::new(registry.clone()),
            registry,
            balancer: None,
            executor,
            shutdown: Mutex::new(CancellationToken::new()),
            events: EventPublisher::new(),
        }
    }

    /// Engine that selects among the balancer's routable agents and feeds
    /// every outcome back into its circuit breakers.
    pub fn with_balancer(balancer: Arc<LoadBalancer>, executor: Arc<dyn SubtaskExecutor>) -> Self {
        Self {
            selector: AgentSelector::new(balancer.clone()),
            registry: balancer.registry().clone(),
            balancer: Some(balancer),
            executor,
            shutdown: Mutex::new(CancellationToken::new()),
            events: EventPublisher::new(),
        }
    }

    /// Weights used by the balanced strategy.
    pub fn with_score_weights(mut self, weights: ScoreWeights) -> Self {
        self.selector = self.selector.with_default_weights(weights);
        self
    }

    pub fn subscribe(&self, kind: Option<EngineEventKind>) -> Subscription<EngineEvent> {
        self.events.subscribe(kind)
    }

    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.events.unsubscribe(id)
    }

    /// Cancel every run in progress. Later runs are unaffected.
    pub fn cancel(&self) {
        let token = std::mem::replace(&mut *self.shutdown.lock(), CancellationToken::new());
        info!("cancelling in-flight plans");
        token.cancel();
    }

    /// Run a decomposition's precomputed levels.
    pub async fn execute(
        &self,
        decomposition: &Decomposition,
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult> {
        self.execute_plan(&decomposition.levels, &decomposition.subtasks, options)
            .await
    }

    /// Run `plan`, looking subtasks up by id in `subtasks`.
    ///
    /// # Errors
    /// `EmptyPlan`, `UnknownSubtask` for plan ids missing from `subtasks`,
    /// `DuplicateSubtask`, `MisorderedDependency` when a dependency is not
    /// planned in an earlier level, or `Validation` for bad options. Subtask
    /// failures never surface here.
    pub async fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        subtasks: &[Subtask],
        options: &ExecutionOptions,
    ) -> Result<ExecutionResult> {
        let token = self.shutdown.lock().child_token();
        self.execute_plan_with_token(plan, subtasks, options, token)
            .await
    }

    /// Like [`execute_plan`](Self::execute_plan) with a caller-owned
    /// cancellation token.
    pub async fn execute_plan_with_token(
        &self,
        plan: &ExecutionPlan,
        subtasks: &[Subtask],
        options: &ExecutionOptions,
        token: CancellationToken,
    ) -> Result<ExecutionResult> {
        options.validate()?;
        if plan.is_empty() {
            return Err(Error::EmptyPlan);
        }
        let mut lookup: HashMap<&SubtaskId, &Subtask> = HashMap::with_capacity(subtasks.len());
        for subtask in subtasks {
            if lookup.insert(&subtask.id, subtask).is_some() {
                return Err(Error::DuplicateSubtask(subtask.id.clone()));
            }
        }
        if let Some(missing) = plan.subtask_ids().find(|id| !lookup.contains_key(id)) {
            return Err(Error::UnknownSubtask(missing.clone()));
        }
        check_dependency_order(plan, &lookup)?;

        let run_id = Uuid::new_v4();
        let started = std::time::Instant::now();
        let total_tasks = plan.total_subtasks();
        info!(%run_id, total_tasks, levels = plan.level_count(), "plan run started");
        self.events.publish(EngineEvent::RunStarted {
            run_id,
            total_tasks,
        });

        let mut results: HashMap<SubtaskId, SubtaskOutcome> = HashMap::with_capacity(total_tasks);
        let mut halted = false;

        for (level, ids) in plan.levels().iter().enumerate() {
            if token.is_cancelled() {
                for id in ids {
                    self.events.publish(EngineEvent::SubtaskCancelled {
                        subtask_id: id.clone(),
                    });
                    results.insert(id.clone(), SubtaskOutcome::Cancelled { attempts: 0 });
                }
                continue;
            }
            if halted {
                for id in ids {
                    results.insert(id.clone(), SubtaskOutcome::Skipped);
                }
                continue;
            }

            debug!(%run_id, level, size = ids.len(), "level started");
            self.events.publish(EngineEvent::LevelStarted {
                level,
                size: ids.len(),
            });

            let outcomes = self.run_level(ids, &lookup, options, &token).await;
            let completed = outcomes.iter().filter(|(_, o)| o.is_completed()).count();
            let failed = outcomes.len() - completed;
            debug!(%run_id, level, completed, failed, "level finished");
            self.events.publish(EngineEvent::LevelFinished {
                level,
                completed,
                failed,
            });
            results.extend(outcomes);

            if failed > 0 && !options.continue_on_failure {
                warn!(%run_id, level, failed, "halting after failed level");
                halted = true;
            }
        }

        let result = summarize(run_id, plan, results, started.elapsed());
        info!(
            %run_id,
            completed = result.completed,
            failed = result.failed,
            duration_ms = result.duration.as_millis() as u64,
            "plan run finished"
        );
        self.events.publish(EngineEvent::RunFinished {
            run_id,
            completed: result.completed,
            failed: result.failed,
        });
        Ok(result)
    }

    async fn run_level<'a>(
        &self,
        ids: &[SubtaskId],
        lookup: &HashMap<&SubtaskId, &'a Subtask>,
        options: &ExecutionOptions,
        token: &CancellationToken,
    ) -> Vec<(SubtaskId, SubtaskOutcome)> {
        let limit = options.max_concurrency.unwrap_or(usize::MAX).max(1);
        let mut ready: VecDeque<&'a Subtask> =
            ids.iter().filter_map(|id| lookup.get(id).copied()).collect();
        let mut scheduled: Vec<Scheduled<'a>> = Vec::new();
        let mut states: HashMap<SubtaskId, AttemptState> = HashMap::new();
        let mut running: Vec<SubtaskId> = Vec::new();
        let mut in_flight = FuturesUnordered::new();
        let mut finished: Vec<(SubtaskId, SubtaskOutcome)> = Vec::with_capacity(ids.len());

        let cancelled = loop {
            if token.is_cancelled() {
                break true;
            }

            let now = Instant::now();
            let (due, waiting): (Vec<_>, Vec<_>) =
                scheduled.into_iter().partition(|s| s.at <= now);
            scheduled = waiting;
            ready.extend(due.into_iter().map(|s| s.subtask));

            while in_flight.len() < limit {
                let Some(subtask) = ready.pop_front() else {
                    break;
                };
                let state = states.entry(subtask.id.clone()).or_default();
                state.attempts += 1;

                match self.choose_agent(subtask, state.last_agent.as_ref(), options) {
                    Ok(agent_id) => {
                        debug!(
                            subtask_id = %subtask.id,
                            agent_id = %agent_id,
                            attempt = state.attempts,
                            "dispatching subtask"
                        );
                        self.events.publish(EngineEvent::SubtaskStarted {
                            subtask_id: subtask.id.clone(),
                            agent_id: agent_id.clone(),
                            attempt: state.attempts,
                        });
                        state.last_agent = Some(agent_id.clone());
                        running.push(subtask.id.clone());
                        let executor = Arc::clone(&self.executor);
                        in_flight.push(async move {
                            let outcome = executor.execute(&agent_id, subtask).await;
                            (subtask, agent_id, outcome)
                        });
                    }
                    Err(e) => {
                        let message = format!("agent selection failed: {e}");
                        if let Some(outcome) =
                            self.after_failure(subtask, state, message, true, options, &mut scheduled)
                        {
                            finished.push((subtask.id.clone(), outcome));
                        }
                    }
                }
            }

            if in_flight.is_empty() && ready.is_empty() && scheduled.is_empty() {
                break false;
            }

            let next_due = scheduled.iter().map(|s| s.at).min();
            let wake = tokio::select! {
                done = in_flight.next(), if !in_flight.is_empty() => Wake::Finished(done),
                _ = tokio::time::sleep_until(next_due.unwrap_or(now)), if next_due.is_some() => Wake::RetryDue,
                _ = token.cancelled() => Wake::Cancelled,
            };

            match wake {
                Wake::Finished(Some((subtask, agent_id, outcome))) => {
                    running.retain(|id| id != &subtask.id);
                    let state = states.entry(subtask.id.clone()).or_default();
                    match outcome {
                        Ok(output) => {
                            self.record_success(&agent_id);
                            info!(
                                subtask_id = %subtask.id,
                                agent_id = %agent_id,
                                attempts = state.attempts,
                                "subtask completed"
                            );
                            self.events.publish(EngineEvent::SubtaskCompleted {
                                subtask_id: subtask.id.clone(),
                                agent_id: agent_id.clone(),
                                attempts: state.attempts,
                            });
                            finished.push((
                                subtask.id.clone(),
                                SubtaskOutcome::Completed {
                                    agent_id,
                                    output,
                                    attempts: state.attempts,
                                },
                            ));
                        }
                        Err(err) => {
                            self.record_failure(&agent_id);
                            let message = format!("agent {agent_id}: {}", err.message);
                            if let Some(outcome) = self.after_failure(
                                subtask,
                                state,
                                message,
                                err.retryable,
                                options,
                                &mut scheduled,
                            ) {
                                finished.push((subtask.id.clone(), outcome));
                            }
                        }
                    }
                }
                Wake::Finished(None) | Wake::RetryDue => {}
                Wake::Cancelled => break true,
            }
        };

        if cancelled {
            drop(in_flight);
            for id in &running {
                let stopped = self.executor.cancel(id).await;
                debug!(subtask_id = %id, stopped, "in-flight subtask cancelled");
            }
            let pending = running
                .into_iter()
                .chain(ready.into_iter().map(|s| s.id.clone()))
                .chain(scheduled.into_iter().map(|s| s.subtask.id.clone()));
            for id in pending {
                let attempts = states.get(&id).map_or(0, |s| s.attempts);
                self.events.publish(EngineEvent::SubtaskCancelled {
                    subtask_id: id.clone(),
                });
                finished.push((id, SubtaskOutcome::Cancelled { attempts }));
            }
        }
        finished
    }

    /// Schedule a retry, or return the terminal failure when none remain.
    fn after_failure<'a>(
        &self,
        subtask: &'a Subtask,
        state: &AttemptState,
        message: String,
        retryable: bool,
        options: &ExecutionOptions,
        scheduled: &mut Vec<Scheduled<'a>>,
    ) -> Option<SubtaskOutcome> {
        if retryable && state.attempts <= options.retry_attempts {
            let delay = options.retry_delay(state.attempts);
            warn!(
                subtask_id = %subtask.id,
                attempt = state.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "attempt failed, retry scheduled"
            );
            self.events.publish(EngineEvent::RetryScheduled {
                subtask_id: subtask.id.clone(),
                attempt: state.attempts,
                delay,
                error: message,
            });
            scheduled.push(Scheduled {
                at: Instant::now() + delay,
                subtask,
            });
            return None;
        }

        warn!(
            subtask_id = %subtask.id,
            attempts = state.attempts,
            error = %message,
            "subtask failed"
        );
        self.events.publish(EngineEvent::SubtaskFailed {
            subtask_id: subtask.id.clone(),
            error: message.clone(),
        });
        Some(SubtaskOutcome::Failed {
            error: message,
            attempts: state.attempts,
            last_agent: state.last_agent.clone(),
        })
    }

    /// Best agent for the subtask, avoiding the agent that last failed it
    /// when someone else qualifies.
    fn choose_agent(
        &self,
        subtask: &Subtask,
        last_agent: Option<&AgentId>,
        options: &ExecutionOptions,
    ) -> Result<AgentId> {
        let criteria = SelectionCriteria::new(options.strategy)
            .require_skills(subtask.required_capabilities.iter().cloned())
            .prefer_skills(subtask.preferred_capabilities.iter().cloned());
        if let Some(last) = last_agent {
            let avoiding = criteria.clone().excluding(last.clone());
            if let Ok(result) = self.selector.select_agent(&avoiding) {
                return Ok(result.agent.id);
            }
        }
        self.selector
            .select_agent(&criteria)
            .map(|result| result.agent.id)
    }

    fn record_success(&self, agent_id: &AgentId) {
        match &self.balancer {
            Some(balancer) => {
                balancer.record_success(agent_id);
            }
            None => {
                if let Err(e) = self.registry.record_success(agent_id) {
                    debug!(agent_id = %agent_id, error = %e, "success not recorded");
                }
            }
        }
    }

    fn record_failure(&self, agent_id: &AgentId) {
        match &self.balancer {
            Some(balancer) => {
                balancer.record_failure(agent_id);
            }
            None => {
                if let Err(e) = self.registry.record_failure(agent_id) {
                    debug!(agent_id = %agent_id, error = %e, "failure not recorded");
                }
            }
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("selector", &self.selector)
            .field("balanced", &self.balancer.is_some())
            .finish()
    }
}

/// Every dependency of a planned subtask must sit in a strictly earlier level.
fn check_dependency_order(
    plan: &ExecutionPlan,
    lookup: &HashMap<&SubtaskId, &Subtask>,
) -> Result<()> {
    let level_of: HashMap<&SubtaskId, usize> = plan
        .levels()
        .iter()
        .enumerate()
        .flat_map(|(level, ids)| ids.iter().map(move |id| (id, level)))
        .collect();

    for (level, ids) in plan.levels().iter().enumerate() {
        for id in ids {
            let Some(subtask) = lookup.get(id) else {
                continue;
            };
            for dependency in &subtask.dependencies {
                if !level_of.get(dependency).is_some_and(|&dep_level| dep_level < level) {
                    return Err(Error::MisorderedDependency {
                        subtask: id.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn summarize(
    run_id: Uuid,
    plan: &ExecutionPlan,
    results: HashMap<SubtaskId, SubtaskOutcome>,
    duration: Duration,
) -> ExecutionResult {
    let mut summary = ExecutionResult {
        run_id,
        total_tasks: plan.total_subtasks(),
        completed: 0,
        failed: 0,
        skipped: 0,
        cancelled: 0,
        results: HashMap::new(),
        errors: Vec::new(),
        duration,
    };

    // Plan order keeps the error list stable.
    for id in plan.subtask_ids() {
        let Some(outcome) = results.get(id) else {
            continue;
        };
        let message = match outcome {
            SubtaskOutcome::Completed { .. } => {
                summary.completed += 1;
                None
            }
            SubtaskOutcome::Failed { error, .. } => Some(error.clone()),
            SubtaskOutcome::Cancelled { .. } => {
                summary.cancelled += 1;
                Some("cancelled".to_string())
            }
            SubtaskOutcome::Skipped => {
                summary.skipped += 1;
                Some("skipped: an earlier level failed".to_string())
            }
        };
        if let Some(message) = message {
            summary.failed += 1;
            summary.errors.push(SubtaskError {
                subtask_id: id.clone(),
                message,
            });
        }
    }
    summary.results = results;
    summary
}
