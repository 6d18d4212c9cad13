use crate::task::condition::{ConditionError, ConditionExpression};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// Unique identifier for tasks; lower ids win score ties
pub type TaskId = u64;

/// Lifecycle state of a task.
///
/// ```text
/// pending -> deferred | ready
/// deferred -> ready            (activation only)
/// ready -> running | pending   (pending when a new prerequisite is attached)
/// running -> completed | pending (retry) | failed
/// ```
///
/// Any non-terminal state may also move to `failed` through cancellation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Deferred,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Deferred,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether the state machine permits `self -> next`
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Deferred)
                | (Pending, Ready)
                | (Deferred, Ready)
                | (Ready, Running)
                | (Ready, Pending)
                | (Running, Completed)
                | (Running, Pending)
                | (Running, Failed)
                | (Pending, Failed)
                | (Deferred, Failed)
                | (Ready, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Deferred => "deferred",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named priority levels accepted in priority expressions
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    Critical = 10,
    High = 8,
    Normal = 5,
    Low = 3,
    Background = 1,
}

impl TaskPriority {
    pub fn value(self) -> f64 {
        self as u8 as f64
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "CRITICAL" => Some(TaskPriority::Critical),
            "HIGH" => Some(TaskPriority::High),
            "NORMAL" | "MEDIUM" => Some(TaskPriority::Normal),
            "LOW" => Some(TaskPriority::Low),
            "BACKGROUND" => Some(TaskPriority::Background),
            _ => None,
        }
    }
}

static PRIORITY_EXPRESSION: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<base>[A-Za-z]+|\d+(?:\.\d+)?)\s*(?:(?P<sign>[+-])\s*(?P<offset>\d+(?:\.\d+)?))?\s*$")
});

/// Parse a user priority expression such as `"HIGH"`, `"LOW+2"` or `"7"`.
///
/// The result is clamped to the `[0, 10]` user priority range.
pub fn parse_priority_expression(expression: &str) -> Result<f64, SchedulerError> {
    let pattern = PRIORITY_EXPRESSION
        .as_ref()
        .map_err(|e| SchedulerError::Validation(format!("priority expression parser: {}", e)))?;

    let captures = pattern.captures(expression).ok_or_else(|| {
        SchedulerError::Validation(format!("malformed priority expression '{}'", expression))
    })?;

    let base_text = &captures["base"];
    let base = match base_text.parse::<f64>() {
        Ok(value) => value,
        Err(_) => TaskPriority::from_name(base_text)
            .ok_or_else(|| {
                SchedulerError::Validation(format!("unknown priority level '{}'", base_text))
            })?
            .value(),
    };

    let offset = match (captures.name("sign"), captures.name("offset")) {
        (Some(sign), Some(offset)) => {
            let magnitude: f64 = offset.as_str().parse().map_err(|_| {
                SchedulerError::Validation(format!("malformed priority offset in '{}'", expression))
            })?;
            if sign.as_str() == "-" { -magnitude } else { magnitude }
        }
        _ => 0.0,
    };

    Ok((base + offset).clamp(0.0, 10.0))
}

/// Scalar inputs to the priority score
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct PriorityFactors {
    /// 0-10
    pub user_priority: f64,
    /// 0-10
    pub urgency: f64,
    /// 0-1
    pub resource_availability: f64,
    /// 0-1
    pub system_load: f64,
    /// 0-10
    pub resource_cost: f64,
    /// 0-10, raised by dependents with higher priority
    pub inherited_priority_boost: f64,
    pub is_system_critical: bool,
}

impl Default for PriorityFactors {
    fn default() -> Self {
        Self {
            user_priority: TaskPriority::Normal.value(),
            urgency: 0.0,
            resource_availability: 1.0,
            system_load: 0.0,
            resource_cost: 0.0,
            inherited_priority_boost: 0.0,
            is_system_critical: false,
        }
    }
}

/// Priority hints as they arrive on a submission; absent fields take defaults
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct PriorityHints {
    #[serde(alias = "userPriority")]
    pub user_priority: Option<f64>,
    #[serde(alias = "userPriorityExpression")]
    pub user_priority_expression: Option<String>,
    pub urgency: Option<f64>,
    #[serde(alias = "resourceAvailability")]
    pub resource_availability: Option<f64>,
    #[serde(alias = "systemLoad")]
    pub system_load: Option<f64>,
    #[serde(alias = "resourceCost")]
    pub resource_cost: Option<f64>,
    #[serde(alias = "inheritedPriorityBoost")]
    pub inherited_priority_boost: Option<f64>,
    #[serde(alias = "isSystemCritical")]
    pub is_system_critical: bool,
}

impl PriorityHints {
    /// Resolve hints into clamped factors.
    ///
    /// `user_priority` and `user_priority_expression` are mutually exclusive.
    pub fn resolve(&self) -> Result<PriorityFactors, SchedulerError> {
        let defaults = PriorityFactors::default();

        let user_priority = match (&self.user_priority, &self.user_priority_expression) {
            (Some(_), Some(_)) => {
                return Err(SchedulerError::Validation(
                    "user_priority and user_priority_expression are mutually exclusive".to_string(),
                ));
            }
            (Some(value), None) => finite("user_priority", *value)?,
            (None, Some(expression)) => parse_priority_expression(expression)?,
            (None, None) => defaults.user_priority,
        };

        let pick = |name: &str, value: Option<f64>, default: f64| -> Result<f64, SchedulerError> {
            value.map(|v| finite(name, v)).unwrap_or(Ok(default))
        };

        Ok(PriorityFactors {
            user_priority: user_priority.clamp(0.0, 10.0),
            urgency: pick("urgency", self.urgency, defaults.urgency)?.clamp(0.0, 10.0),
            resource_availability: pick(
                "resource_availability",
                self.resource_availability,
                defaults.resource_availability,
            )?
            .clamp(0.0, 1.0),
            system_load: pick("system_load", self.system_load, defaults.system_load)?
                .clamp(0.0, 1.0),
            resource_cost: pick("resource_cost", self.resource_cost, defaults.resource_cost)?
                .clamp(0.0, 10.0),
            inherited_priority_boost: pick(
                "inherited_priority_boost",
                self.inherited_priority_boost,
                defaults.inherited_priority_boost,
            )?
            .clamp(0.0, 10.0),
            is_system_critical: self.is_system_critical,
        })
    }
}

fn finite(name: &str, value: f64) -> Result<f64, SchedulerError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(SchedulerError::Validation(format!("{} must be a finite number", name)))
    }
}

/// Per-task scheduling configuration
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TaskConfig {
    pub priority: PriorityFactors,
    pub category: Option<String>,
    pub condition: Option<ConditionExpression>,
    /// Labels added to the satisfied set when the task completes
    pub produces: Vec<String>,
    pub max_retries: u32,
    pub execution_timeout_ms: u64,
}

/// A schedulable unit of work.
///
/// Dependency edges live in the scheduler's dependency graph, not on the task.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Task {
    pub id: TaskId,
    /// Opaque payload handed to the execution collaborator
    pub query: serde_json::Value,
    pub status: TaskStatus,
    pub config: TaskConfig,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_execution_attempt: Option<DateTime<Utc>>,
    pub status_updated_at: DateTime<Utc>,
    pub status_reason: Option<String>,
    pub last_error: Option<TaskFailure>,
    pub result: Option<serde_json::Value>,
    /// Inherited boost given at submission; inheritance never lowers the boost below it
    #[serde(default)]
    pub requested_boost: f64,
}

impl Task {
    pub fn new(id: TaskId, query: serde_json::Value, config: TaskConfig, now: DateTime<Utc>) -> Self {
        let requested_boost = config.priority.inherited_priority_boost;
        Self {
            id,
            query,
            status: TaskStatus::Pending,
            config,
            created_at: now,
            retry_count: 0,
            last_execution_attempt: None,
            status_updated_at: now,
            status_reason: None,
            last_error: None,
            result: None,
            requested_boost,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_running(&self) -> bool {
        self.status == TaskStatus::Running
    }

    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.config.max_retries
    }

    /// Label satisfied by this task's completion
    pub fn completion_label(&self) -> String {
        completion_label(self.id)
    }
}

pub fn completion_label(id: TaskId) -> String {
    format!("task:{}", id)
}

/// Task submission message
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TaskSubmission {
    /// Externally assigned id; a monotonic id is assigned when absent
    #[serde(default)]
    pub id: Option<TaskId>,
    #[serde(default)]
    pub query: serde_json::Value,
    #[serde(default)]
    pub priority: PriorityHints,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub condition: Option<ConditionExpression>,
    #[serde(default)]
    pub produces: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub execution_timeout_ms: Option<u64>,
}

impl TaskSubmission {
    pub fn new(query: impl Into<serde_json::Value>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_user_priority(mut self, priority: f64) -> Self {
        self.priority.user_priority = Some(priority);
        self
    }

    pub fn with_priority_expression(mut self, expression: impl Into<String>) -> Self {
        self.priority.user_priority_expression = Some(expression.into());
        self
    }

    pub fn with_urgency(mut self, urgency: f64) -> Self {
        self.priority.urgency = Some(urgency);
        self
    }

    pub fn with_resource_cost(mut self, cost: f64) -> Self {
        self.priority.resource_cost = Some(cost);
        self
    }

    pub fn system_critical(mut self) -> Self {
        self.priority.is_system_critical = true;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<TaskId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_condition(mut self, condition: ConditionExpression) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_produces(mut self, labels: Vec<String>) -> Self {
        self.produces = labels;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_execution_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.execution_timeout_ms = Some(timeout_ms);
        self
    }
}

/// Runtime failure recorded on a task
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskFailure {
    #[error("execution exceeded {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    #[error("retries exhausted after {attempts} attempts (last: {last})")]
    RetriesExhausted { attempts: u32, last: Box<TaskFailure> },
    #[error("cancelled")]
    Cancelled,
    #[error("{message}")]
    Execution { message: String },
}

impl TaskFailure {
    /// Short code stored in `Task::status_reason`
    pub fn reason_code(&self) -> String {
        match self {
            TaskFailure::Timeout { .. } => crate::env::reasons::TIMEOUT.to_string(),
            TaskFailure::RetriesExhausted { .. } => {
                crate::env::reasons::RETRIES_EXHAUSTED.to_string()
            }
            TaskFailure::Cancelled => crate::env::reasons::CANCELLED.to_string(),
            TaskFailure::Execution { message } => message.clone(),
        }
    }
}

/// Errors surfaced synchronously by scheduler operations
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency cycle: task {dependent} cannot depend on {prerequisite}")]
    DependencyCycle {
        dependent: TaskId,
        prerequisite: TaskId,
    },

    #[error("Condition evaluation error: {0}")]
    ConditionEvaluation(#[from] ConditionError),

    #[error("Task {0} not found")]
    NotFound(TaskId),

    #[error("Invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
}

/// Events produced by the scheduler for observers and execution collaborators
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskSubmitted {
        task_id: TaskId,
        status: TaskStatus,
    },
    StatusChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        reason: Option<String>,
    },
    TaskActivated {
        task_id: TaskId,
    },
    TaskDispatched {
        task_id: TaskId,
        score: f64,
        attempt: u32,
    },
    TaskCompleted {
        task_id: TaskId,
        result: serde_json::Value,
    },
    TaskFailed {
        task_id: TaskId,
        error: TaskFailure,
    },
    RetryScheduled {
        task_id: TaskId,
        retry_count: u32,
        delay_ms: u64,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::TaskSubmitted { task_id, .. }
            | TaskEvent::StatusChanged { task_id, .. }
            | TaskEvent::TaskActivated { task_id }
            | TaskEvent::TaskDispatched { task_id, .. }
            | TaskEvent::TaskCompleted { task_id, .. }
            | TaskEvent::TaskFailed { task_id, .. }
            | TaskEvent::RetryScheduled { task_id, .. } => *task_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_expression_levels() {
        assert_eq!(parse_priority_expression("HIGH").unwrap(), 8.0);
        assert_eq!(parse_priority_expression("low+2").unwrap(), 5.0);
        assert_eq!(parse_priority_expression("Normal - 1").unwrap(), 4.0);
        assert_eq!(parse_priority_expression("7").unwrap(), 7.0);
        assert_eq!(parse_priority_expression("CRITICAL+5").unwrap(), 10.0);
    }

    #[test]
    fn test_priority_expression_rejects_garbage() {
        assert!(matches!(
            parse_priority_expression("URGENT"),
            Err(SchedulerError::Validation(_))
        ));
        assert!(matches!(
            parse_priority_expression("HIGH*2"),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[test]
    fn test_priority_sources_are_mutually_exclusive() {
        let hints = PriorityHints {
            user_priority: Some(4.0),
            user_priority_expression: Some("HIGH".to_string()),
            ..Default::default()
        };
        assert!(matches!(hints.resolve(), Err(SchedulerError::Validation(_))));
    }

    #[test]
    fn test_priority_hints_clamp_and_default() {
        let hints = PriorityHints {
            urgency: Some(42.0),
            system_load: Some(-1.0),
            ..Default::default()
        };
        let factors = hints.resolve().unwrap();

        assert_eq!(factors.user_priority, 5.0);
        assert_eq!(factors.urgency, 10.0);
        assert_eq!(factors.system_load, 0.0);
        assert_eq!(factors.resource_availability, 1.0);

        let nan = PriorityHints {
            urgency: Some(f64::NAN),
            ..Default::default()
        };
        assert!(nan.resolve().is_err());
    }

    #[test]
    fn test_state_machine_table() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Deferred));
        assert!(Deferred.can_transition_to(Ready));
        assert!(Running.can_transition_to(Pending));
        assert!(!Deferred.can_transition_to(Running));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Ready));
        assert!(!Pending.can_transition_to(Running));
    }

    #[test]
    fn test_failure_reason_codes() {
        assert_eq!(TaskFailure::Timeout { timeout_ms: 10 }.reason_code(), "timeout");
        let exhausted = TaskFailure::RetriesExhausted {
            attempts: 2,
            last: Box::new(TaskFailure::Timeout { timeout_ms: 10 }),
        };
        assert_eq!(exhausted.reason_code(), "retries_exhausted");
        assert_eq!(TaskFailure::Cancelled.reason_code(), "cancelled");
    }

    #[test]
    fn test_submission_deserializes_with_defaults() {
        let json = serde_json::json!({
            "query": "summarize topic",
            "dependencies": [1, 2],
            "priority": {"user_priority_expression": "HIGH"}
        });
        let submission: TaskSubmission = serde_json::from_value(json).unwrap();

        assert_eq!(submission.id, None);
        assert_eq!(submission.dependencies, vec![1, 2]);
        assert_eq!(submission.priority.resolve().unwrap().user_priority, 8.0);
        assert!(submission.condition.is_none());
    }
}
