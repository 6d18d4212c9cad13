use crate::env::{defaults, reasons};
use crate::task::clock::{Clock, SystemClock};
use crate::task::condition::{ConditionEvaluator, SatisfiedState};
use crate::task::deferred::DeferredActivationManager;
use crate::task::graph::DependencyGraph;
use crate::task::priority::{PriorityCalculator, RankedTask, ScoreBreakdown, ScoringWeights};
use crate::task::registry::TaskRegistry;
use crate::task::supervisor::{RetryTimeoutSupervisor, TimeoutOutcome, deadline_after};
use crate::task::types::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Scheduler configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent_tasks: u32,
    pub default_max_retries: u32,
    pub default_execution_timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Execution failures reported by collaborators consume the retry budget like timeouts
    pub retry_on_execution_failure: bool,
    pub weights: ScoringWeights,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: defaults::MAX_CONCURRENT_TASKS,
            default_max_retries: defaults::MAX_RETRIES,
            default_execution_timeout_ms: defaults::EXECUTION_TIMEOUT_MS,
            backoff_base_ms: defaults::BACKOFF_BASE_MS,
            backoff_cap_ms: defaults::BACKOFF_CAP_MS,
            retry_on_execution_failure: true,
            weights: ScoringWeights::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_concurrent_tasks == 0 {
            return Err(SchedulerError::Validation(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.default_execution_timeout_ms == 0
            || self.default_execution_timeout_ms > defaults::MAX_DELAY_MS
        {
            return Err(SchedulerError::Validation(format!(
                "default_execution_timeout_ms must be between 1 and {}",
                defaults::MAX_DELAY_MS
            )));
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err(SchedulerError::Validation(format!(
                "backoff_cap_ms ({}) is below backoff_base_ms ({})",
                self.backoff_cap_ms, self.backoff_base_ms
            )));
        }
        if self.backoff_cap_ms > defaults::MAX_DELAY_MS {
            return Err(SchedulerError::Validation(format!(
                "backoff_cap_ms ({}) exceeds {}",
                self.backoff_cap_ms,
                defaults::MAX_DELAY_MS
            )));
        }
        self.weights.validate()?;
        let spread = self.weights.max_non_critical_spread();
        if self.weights.system_critical_bonus <= spread {
            return Err(SchedulerError::Validation(format!(
                "system_critical_bonus ({}) must exceed the non-critical score spread ({})",
                self.weights.system_critical_bonus, spread
            )));
        }
        Ok(())
    }
}

/// Counts per status and timer bookkeeping
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SchedulerStatistics {
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub ready_tasks: usize,
    pub running_tasks: usize,
    pub deferred_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub armed_timers: usize,
    /// Retried tasks waiting out their backoff
    pub backoff_tasks: usize,
    pub satisfied_labels: usize,
}

impl SchedulerStatistics {
    /// Nothing running, ready or waiting on a timer; remaining tasks can only move on an
    /// external event
    pub fn is_idle(&self) -> bool {
        self.running_tasks == 0 && self.ready_tasks == 0 && self.backoff_tasks == 0
    }
}

/// What a timer poll did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    /// Timed out and sent back to `pending` for a retry
    pub retried: Vec<TaskId>,
    /// Timed out with no retries left
    pub failed: Vec<TaskId>,
    /// Re-entered the pipeline after their backoff
    pub reinserted: Vec<TaskId>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.retried.is_empty() && self.failed.is_empty() && self.reinserted.is_empty()
    }
}

/// External state merged with labels produced by completed tasks
struct CombinedState<'a> {
    external: &'a BTreeSet<String>,
    produced: &'a BTreeSet<String>,
}

impl SatisfiedState for CombinedState<'_> {
    fn is_satisfied(&self, label: &str) -> bool {
        self.external.contains(label) || self.produced.contains(label)
    }
}

/// Orchestrates submission, ranking, gating, dispatch and failure recovery.
///
/// Every operation is one indivisible step over `&mut self`; hosts that share a scheduler
/// between threads serialize access through a single owner (see `dispatch::Dispatcher`).
pub struct Scheduler {
    config: SchedulerConfig,
    registry: TaskRegistry,
    graph: DependencyGraph,
    calculator: PriorityCalculator,
    deferred: DeferredActivationManager,
    supervisor: RetryTimeoutSupervisor,
    external_state: BTreeSet<String>,
    produced: BTreeSet<String>,
    clock: Arc<dyn Clock>,
    subscribers: Vec<mpsc::UnboundedSender<TaskEvent>>,
}

impl Scheduler {
    /// Create a scheduler on the wall clock.
    ///
    /// The configuration is taken as is; use [`Scheduler::try_new`] for configurations that
    /// have not been through [`SchedulerConfig::validate`].
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Validate `config`, then create a scheduler on the wall clock
    pub fn try_new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self::new(config))
    }

    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        let calculator = PriorityCalculator::new(config.weights.clone());
        let supervisor = RetryTimeoutSupervisor::new(config.backoff_base_ms, config.backoff_cap_ms);

        Self {
            config,
            registry: TaskRegistry::new(),
            graph: DependencyGraph::new(),
            calculator,
            deferred: DeferredActivationManager::new(),
            supervisor,
            external_state: BTreeSet::new(),
            produced: BTreeSet::new(),
            clock,
            subscribers: Vec::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TaskEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Validate and register a task.
    ///
    /// Structural problems are rejected before anything is stored. The new task ends up
    /// `ready` (no condition, prerequisites done), `deferred` (condition unmet) or `pending`
    /// (waiting on prerequisites).
    pub fn submit(&mut self, submission: TaskSubmission) -> Result<TaskId, SchedulerError> {
        let now = self.clock.now();

        match self.register(submission, now) {
            Ok(id) => {
                self.flush_events();
                Ok(id)
            }
            Err(e) => {
                warn!("Rejected task submission: {}", e);
                Err(e)
            }
        }
    }

    fn register(&mut self, submission: TaskSubmission, now: DateTime<Utc>) -> Result<TaskId, SchedulerError> {
        match &submission.query {
            serde_json::Value::Null => {
                return Err(SchedulerError::Validation("missing query".to_string()));
            }
            serde_json::Value::String(s) if s.trim().is_empty() => {
                return Err(SchedulerError::Validation("empty query".to_string()));
            }
            _ => {}
        }

        let priority = submission.priority.resolve()?;

        if let Some(condition) = &submission.condition {
            ConditionEvaluator::validate(condition)?;
        }

        if submission.produces.iter().any(|l| l.trim().is_empty()) {
            return Err(SchedulerError::Validation(
                "produced labels must not be empty".to_string(),
            ));
        }

        let execution_timeout_ms = submission
            .execution_timeout_ms
            .unwrap_or(self.config.default_execution_timeout_ms);
        if execution_timeout_ms == 0 || execution_timeout_ms > defaults::MAX_DELAY_MS {
            return Err(SchedulerError::Validation(format!(
                "execution_timeout_ms must be between 1 and {}",
                defaults::MAX_DELAY_MS
            )));
        }

        let id = self.registry.allocate_id(submission.id)?;

        let mut dependencies = Vec::with_capacity(submission.dependencies.len());
        for dep in submission.dependencies {
            if dep == id {
                return Err(SchedulerError::Validation(format!(
                    "task {} cannot depend on itself",
                    id
                )));
            }
            if !self.registry.contains(dep) {
                return Err(SchedulerError::Validation(format!(
                    "task {} depends on unknown task {}",
                    id, dep
                )));
            }
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }

        let config = TaskConfig {
            priority,
            category: submission.category,
            condition: submission.condition,
            produces: submission.produces,
            max_retries: submission
                .max_retries
                .unwrap_or(self.config.default_max_retries),
            execution_timeout_ms,
        };

        self.graph.add_node(id);
        if let Err(e) = self.graph.add_edges(id, &dependencies) {
            self.graph.discard_isolated(id);
            return Err(e);
        }

        let task = Task::new(id, submission.query, config, now);
        self.registry.submit(task)?;

        self.inherit_priority(id, &dependencies);

        let status = self.route_pending(id, now)?;
        info!("Submitted task {} ({})", id, status);
        Ok(id)
    }

    /// Raise the inherited boost of unfinished prerequisites that rank below `id`
    fn inherit_priority(&mut self, id: TaskId, prerequisites: &[TaskId]) {
        let Ok(task) = self.registry.get(id) else {
            return;
        };
        let dependent_base = self.calculator.base_score(&task.config.priority);

        for &prerequisite in prerequisites {
            let Ok(prereq) = self.registry.get_mut(prerequisite) else {
                continue;
            };
            if prereq.is_terminal() {
                continue;
            }

            let gap = dependent_base - self.calculator.base_score(&prereq.config.priority);
            if gap > 0.0 {
                let boost = &mut prereq.config.priority.inherited_priority_boost;
                let raised = (*boost + gap).min(10.0);
                if raised > *boost {
                    debug!(
                        "Task {} inherits priority boost {:.2} from dependent {}",
                        prerequisite, raised, id
                    );
                    *boost = raised;
                }
            }
        }
    }

    /// Recompute the inherited boost of `id` from its unfinished dependents.
    ///
    /// Called when a dependent leaves the pipeline so a boost it caused does not outlive it.
    fn refresh_inherited(&mut self, id: TaskId) {
        let Ok(task) = self.registry.get(id) else {
            return;
        };
        if task.is_terminal() {
            return;
        }

        let mut own = task.config.priority.clone();
        own.inherited_priority_boost = 0.0;
        let own_base = self.calculator.base_score(&own);

        let strongest = self
            .graph
            .dependents(id)
            .into_iter()
            .filter_map(|d| self.registry.get(d).ok())
            .filter(|d| !d.is_terminal())
            .map(|d| self.calculator.base_score(&d.config.priority) - own_base)
            .fold(0.0_f64, f64::max);
        let boost = task.requested_boost.max(strongest.min(10.0));

        if let Ok(task) = self.registry.get_mut(id) {
            let current = &mut task.config.priority.inherited_priority_boost;
            if *current != boost {
                debug!("Task {} inherited boost {:.2} -> {:.2}", id, *current, boost);
                *current = boost;
            }
        }
    }

    /// Send a `pending` task to `deferred`, `ready`, or leave it waiting on prerequisites
    fn route_pending(&mut self, id: TaskId, now: DateTime<Utc>) -> Result<TaskStatus, SchedulerError> {
        let satisfied = CombinedState {
            external: &self.external_state,
            produced: &self.produced,
        };
        let task = self.registry.get(id)?;
        if task.status != TaskStatus::Pending {
            return Ok(task.status);
        }

        let condition_met = DeferredActivationManager::condition_met(task, &satisfied)?;
        let dependencies_ready = self.graph.is_ready(id, |p| self.registry.status_of(p));

        if !condition_met {
            self.registry.transition(
                id,
                TaskStatus::Deferred,
                Some(reasons::AWAITING_CONDITION.to_string()),
                now,
            )?;
            self.deferred.add_deferred(id);
            Ok(TaskStatus::Deferred)
        } else if dependencies_ready {
            self.registry.transition(
                id,
                TaskStatus::Ready,
                Some(reasons::DEPENDENCIES_MET.to_string()),
                now,
            )?;
            Ok(TaskStatus::Ready)
        } else {
            self.registry.get_mut(id)?.status_reason = Some(reasons::AWAITING_DEPENDENCIES.to_string());
            Ok(TaskStatus::Pending)
        }
    }

    /// Dispatch the highest-scoring `ready` task.
    ///
    /// Returns `None` when nothing is ready or `max_concurrent_tasks` tasks are already
    /// running. Expired timers and due backoffs are processed first.
    pub fn schedule_next_task(&mut self) -> Option<Task> {
        self.tick();
        let now = self.clock.now();

        let running = self.registry.count_by_status(TaskStatus::Running);
        if running >= self.config.max_concurrent_tasks as usize {
            debug!(
                "At capacity ({} running, limit {})",
                running, self.config.max_concurrent_tasks
            );
            return None;
        }

        let selection = self
            .registry
            .list_by_status(TaskStatus::Ready)
            .into_iter()
            .map(|task| RankedTask {
                task_id: task.id,
                score: self.calculator.score(task, now),
                created_at: task.created_at,
            })
            .min_by(|a, b| a.rank_cmp(b))?;

        if let Err(e) = self.dispatch(&selection, now) {
            warn!("Failed to dispatch task {}: {}", selection.task_id, e);
            self.flush_events();
            return None;
        }
        self.flush_events();

        self.registry.get(selection.task_id).ok().cloned()
    }

    /// Dispatch ready tasks until none are left or capacity is reached
    pub fn schedule_ready_tasks(&mut self) -> Vec<Task> {
        let mut dispatched = Vec::new();
        while let Some(task) = self.schedule_next_task() {
            dispatched.push(task);
        }
        dispatched
    }

    fn dispatch(&mut self, selection: &RankedTask, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let id = selection.task_id;
        self.registry.transition(
            id,
            TaskStatus::Running,
            Some(reasons::DISPATCHED.to_string()),
            now,
        )?;

        let task = self.registry.get_mut(id)?;
        task.last_execution_attempt = Some(now);
        let attempt = task.retry_count + 1;
        let timeout_ms = task.config.execution_timeout_ms;

        self.supervisor.arm(id, now, timeout_ms);
        self.registry.push_event(TaskEvent::TaskDispatched {
            task_id: id,
            score: selection.score,
            attempt,
        });

        info!(
            "Dispatched task {} with score {:.2} (attempt {})",
            id, selection.score, attempt
        );
        Ok(())
    }

    fn ensure_running(&self, id: TaskId, to: TaskStatus) -> Result<(), SchedulerError> {
        let status = self.registry.get(id)?.status;
        if status != TaskStatus::Running {
            return Err(SchedulerError::InvalidTransition {
                task_id: id,
                from: status,
                to,
            });
        }
        Ok(())
    }

    /// Record a successful execution and unblock whatever was waiting on it
    pub fn report_completion(&mut self, id: TaskId, result: serde_json::Value) -> Result<(), SchedulerError> {
        self.ensure_running(id, TaskStatus::Completed)?;
        let now = self.clock.now();

        self.supervisor.disarm(id);
        self.registry.transition(
            id,
            TaskStatus::Completed,
            Some(reasons::COMPLETED.to_string()),
            now,
        )?;

        let task = self.registry.get_mut(id)?;
        task.result = Some(result.clone());
        self.produced.insert(task.completion_label());
        self.produced.extend(task.config.produces.iter().cloned());

        self.registry.push_event(TaskEvent::TaskCompleted {
            task_id: id,
            result,
        });
        info!("Task {} completed", id);

        for dependent in self.graph.on_completed(id) {
            if self.registry.status_of(dependent) == Some(TaskStatus::Pending)
                && !self.supervisor.has_reinsertion(dependent)
            {
                if let Err(e) = self.route_pending(dependent, now) {
                    warn!("Could not re-evaluate dependent {}: {}", dependent, e);
                }
            }
        }
        self.reevaluate_deferred(now);

        self.flush_events();
        Ok(())
    }

    /// Record a failed execution.
    ///
    /// `TaskFailure::Cancelled` always fails the task; other failures consume the retry
    /// budget when `retry_on_execution_failure` is set.
    pub fn report_failure(&mut self, id: TaskId, failure: TaskFailure) -> Result<(), SchedulerError> {
        self.ensure_running(id, TaskStatus::Failed)?;
        let now = self.clock.now();
        self.supervisor.disarm(id);

        let outcome = match failure {
            TaskFailure::Cancelled => TimeoutOutcome::Exhausted(TaskFailure::Cancelled),
            _ if self.config.retry_on_execution_failure => {
                let task = self.registry.get(id)?;
                self.supervisor.retry_or_exhaust(task, failure.clone())
            }
            _ => TimeoutOutcome::Exhausted(failure.clone()),
        };

        let result = self.apply_outcome(id, failure, outcome, now);
        self.flush_events();
        result
    }

    /// Shorthand for reporting an execution error message
    pub fn report_error(&mut self, id: TaskId, message: impl Into<String>) -> Result<(), SchedulerError> {
        self.report_failure(
            id,
            TaskFailure::Execution {
                message: message.into(),
            },
        )
    }

    fn apply_outcome(
        &mut self,
        id: TaskId,
        failure: TaskFailure,
        outcome: TimeoutOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        match outcome {
            TimeoutOutcome::Retry {
                retry_count,
                delay_ms,
            } => {
                let task = self.registry.get_mut(id)?;
                task.retry_count = retry_count;
                task.last_error = Some(failure.clone());

                self.registry
                    .transition(id, TaskStatus::Pending, Some(failure.reason_code()), now)?;
                self.supervisor
                    .schedule_reinsertion(id, deadline_after(now, delay_ms));
                self.registry.push_event(TaskEvent::RetryScheduled {
                    task_id: id,
                    retry_count,
                    delay_ms,
                });

                warn!(
                    "Task {} failed ({}); retry {} in {} ms",
                    id, failure, retry_count, delay_ms
                );
                Ok(())
            }
            TimeoutOutcome::Exhausted(final_failure) => self.fail_terminal(id, final_failure, now),
        }
    }

    fn fail_terminal(&mut self, id: TaskId, failure: TaskFailure, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.supervisor.disarm(id);
        self.supervisor.cancel_reinsertion(id);
        self.deferred.remove(id);

        self.registry
            .transition(id, TaskStatus::Failed, Some(failure.reason_code()), now)?;
        self.registry.get_mut(id)?.last_error = Some(failure.clone());
        self.registry.push_event(TaskEvent::TaskFailed {
            task_id: id,
            error: failure.clone(),
        });

        for prerequisite in self.graph.prerequisites(id) {
            self.refresh_inherited(prerequisite);
        }

        warn!("Task {} failed: {}", id, failure);
        Ok(())
    }

    /// Process expired execution timers and due backoff re-insertions
    pub fn tick(&mut self) -> TickReport {
        let now = self.clock.now();
        let mut report = TickReport::default();

        for (id, timer) in self.supervisor.expired(now) {
            let Ok(task) = self.registry.get(id) else {
                continue;
            };
            if task.status != TaskStatus::Running {
                continue;
            }

            warn!("Task {} exceeded its {} ms execution timeout", id, timer.timeout_ms);
            let outcome = self.supervisor.on_timeout(task, timer.timeout_ms);
            let retried = matches!(outcome, TimeoutOutcome::Retry { .. });
            let failure = TaskFailure::Timeout {
                timeout_ms: timer.timeout_ms,
            };

            match self.apply_outcome(id, failure, outcome, now) {
                Ok(()) if retried => report.retried.push(id),
                Ok(()) => report.failed.push(id),
                Err(e) => warn!("Could not apply timeout for task {}: {}", id, e),
            }
        }

        for id in self.supervisor.due_reinsertions(now) {
            if self.registry.status_of(id) != Some(TaskStatus::Pending) {
                continue;
            }
            match self.route_pending(id, now) {
                Ok(status) => {
                    debug!("Task {} re-entered the pipeline as {}", id, status);
                    report.reinserted.push(id);
                }
                Err(e) => warn!("Could not re-insert task {}: {}", id, e),
            }
        }

        if !report.is_empty() {
            self.flush_events();
        }
        report
    }

    /// Replace the external satisfied-state snapshot and re-check deferred tasks.
    /// Returns the activated task ids.
    pub fn on_external_state_change<I, L>(&mut self, satisfied: I) -> Vec<TaskId>
    where
        I: IntoIterator<Item = L>,
        L: Into<String>,
    {
        self.external_state = satisfied.into_iter().map(Into::into).collect();
        let now = self.clock.now();
        let activated = self.reevaluate_deferred(now);
        self.flush_events();
        activated
    }

    /// Mark a single external label satisfied or unsatisfied and re-check deferred tasks
    pub fn update_state_label(&mut self, label: impl Into<String>, satisfied: bool) -> Vec<TaskId> {
        let label = label.into();
        if satisfied {
            self.external_state.insert(label);
        } else {
            self.external_state.remove(&label);
        }
        let now = self.clock.now();
        let activated = self.reevaluate_deferred(now);
        self.flush_events();
        activated
    }

    fn reevaluate_deferred(&mut self, now: DateTime<Utc>) -> Vec<TaskId> {
        if self.deferred.is_empty() {
            return Vec::new();
        }
        let satisfied = CombinedState {
            external: &self.external_state,
            produced: &self.produced,
        };
        self.deferred
            .on_external_state_change(&mut self.registry, &self.graph, &satisfied, now)
    }

    /// Add a prerequisite to an existing, not yet dispatched task.
    ///
    /// A `ready` dependent whose new prerequisite is unfinished goes back to `pending`.
    pub fn add_dependency(&mut self, dependent: TaskId, prerequisite: TaskId) -> Result<(), SchedulerError> {
        let status = self.registry.get(dependent)?.status;
        if !matches!(
            status,
            TaskStatus::Pending | TaskStatus::Ready | TaskStatus::Deferred
        ) {
            return Err(SchedulerError::Validation(format!(
                "cannot add a dependency to {} task {}",
                status, dependent
            )));
        }
        if !self.registry.contains(prerequisite) {
            return Err(SchedulerError::NotFound(prerequisite));
        }

        self.graph.add_edge(dependent, prerequisite)?;
        self.inherit_priority(dependent, &[prerequisite]);

        let prerequisite_done =
            self.registry.status_of(prerequisite) == Some(TaskStatus::Completed);
        if status == TaskStatus::Ready && !prerequisite_done {
            let now = self.clock.now();
            self.registry.transition(
                dependent,
                TaskStatus::Pending,
                Some(reasons::DEPENDENCY_ADDED.to_string()),
                now,
            )?;
        }

        self.flush_events();
        Ok(())
    }

    /// Cancel a task.
    ///
    /// A running task fails with reason `cancelled`, its timer disarmed and slot freed. A
    /// pending, ready or deferred task is dropped from the deferred set and backoff queue and
    /// also ends `failed`/`cancelled`. Dependents are left untouched.
    pub fn cancel(&mut self, id: TaskId) -> Result<(), SchedulerError> {
        let status = self.registry.get(id)?.status;
        if status == TaskStatus::Running {
            return self.report_failure(id, TaskFailure::Cancelled);
        }
        if status.is_terminal() {
            return Err(SchedulerError::InvalidTransition {
                task_id: id,
                from: status,
                to: TaskStatus::Failed,
            });
        }

        let now = self.clock.now();
        let result = self.fail_terminal(id, TaskFailure::Cancelled, now);
        self.flush_events();
        result
    }

    /// Cancel a task and every unfinished task that transitively depends on it.
    /// Returns the cancelled ids.
    pub fn cancel_with_dependents(&mut self, id: TaskId) -> Result<Vec<TaskId>, SchedulerError> {
        let mut cancelled = Vec::new();
        if !self.registry.get(id)?.is_terminal() {
            self.cancel(id)?;
            cancelled.push(id);
        }

        for dependent in self.graph.transitive_dependents(id) {
            if self.registry.get(dependent).is_ok_and(|t| !t.is_terminal()) {
                self.cancel(dependent)?;
                cancelled.push(dependent);
            }
        }
        Ok(cancelled)
    }

    pub fn get_task(&self, id: TaskId) -> Result<&Task, SchedulerError> {
        self.registry.get(id)
    }

    /// Every task in submission order
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.registry.iter()
    }

    pub fn list_by_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.registry.list_by_status(status)
    }

    pub fn dependencies_of(&self, id: TaskId) -> Vec<TaskId> {
        self.graph.prerequisites(id)
    }

    pub fn dependents_of(&self, id: TaskId) -> Vec<TaskId> {
        self.graph.dependents(id)
    }

    pub fn is_dependency_ready(&self, id: TaskId) -> bool {
        self.graph.is_ready(id, |p| self.registry.status_of(p))
    }

    pub fn running_count(&self) -> usize {
        self.registry.count_by_status(TaskStatus::Running)
    }

    pub fn deferred_task_ids(&self) -> &[TaskId] {
        self.deferred.task_ids()
    }

    /// Labels currently satisfied, external and produced
    pub fn satisfied_labels(&self) -> BTreeSet<String> {
        self.external_state.union(&self.produced).cloned().collect()
    }

    /// Current score of a task with per-factor contributions
    pub fn explain(&self, id: TaskId) -> Result<ScoreBreakdown, SchedulerError> {
        let task = self.registry.get(id)?;
        Ok(self.calculator.breakdown(task, self.clock.now()))
    }

    /// Earliest pending timer or backoff deadline
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.supervisor.next_deadline()
    }

    pub fn statistics(&self) -> SchedulerStatistics {
        let count = |status| self.registry.count_by_status(status);
        SchedulerStatistics {
            total_tasks: self.registry.len(),
            pending_tasks: count(TaskStatus::Pending),
            ready_tasks: count(TaskStatus::Ready),
            running_tasks: count(TaskStatus::Running),
            deferred_tasks: count(TaskStatus::Deferred),
            completed_tasks: count(TaskStatus::Completed),
            failed_tasks: count(TaskStatus::Failed),
            armed_timers: self.supervisor.armed_count(),
            backoff_tasks: self.supervisor.reinsertion_count(),
            satisfied_labels: self.external_state.len() + self.produced.len(),
        }
    }

    fn flush_events(&mut self) {
        let events = self.registry.drain_events();
        if events.is_empty() {
            return;
        }

        for event in &events {
            log_event(event);
        }

        self.subscribers.retain(|tx| {
            events.iter().all(|event| tx.send(event.clone()).is_ok())
        });
    }
}

/// Trace a scheduler event at a level matching its severity
pub fn log_event(event: &TaskEvent) {
    match event {
        TaskEvent::TaskSubmitted { task_id, .. } => debug!("Event: task {} submitted", task_id),
        TaskEvent::StatusChanged {
            task_id, from, to, ..
        } => debug!("Event: task {} {} -> {}", task_id, from, to),
        TaskEvent::TaskActivated { task_id } => info!("Event: task {} activated", task_id),
        TaskEvent::TaskDispatched { task_id, .. } => debug!("Event: task {} dispatched", task_id),
        TaskEvent::TaskCompleted { task_id, .. } => debug!("Event: task {} completed", task_id),
        TaskEvent::TaskFailed { task_id, error } => {
            warn!("Event: task {} failed - {}", task_id, error)
        }
        TaskEvent::RetryScheduled {
            task_id,
            retry_count,
            delay_ms,
        } => debug!(
            "Event: task {} retry {} scheduled in {} ms",
            task_id, retry_count, delay_ms
        ),
    }
}
