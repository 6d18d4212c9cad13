//! Wire messages exchanged with collaborators.
//!
//! Submissions arrive as loosely-typed JSON (camelCase or snake_case keys, conditions as
//! `{type, ...}` records). Execution results come back through the response protocol and
//! memory notifications through `memory_updated`.

use crate::task::{
    ConditionExpression, PriorityHints, Scheduler, SchedulerError, TaskFailure, TaskId,
    TaskSubmission,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Memory statuses that mark a topic as satisfied
const SATISFIED_STATUSES: &[&str] = &["completed", "complete", "done", "ready", "available", "satisfied"];

/// Task submission as received on the wire
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubmissionMessage {
    pub id: Option<TaskId>,
    pub query: Value,
    #[serde(alias = "priority", alias = "priority_factors")]
    pub priority_factors: PriorityHints,
    pub category: Option<String>,
    pub dependencies: Vec<TaskId>,
    pub condition: Option<Value>,
    pub produces: Vec<String>,
    #[serde(alias = "max_retries")]
    pub max_retries: Option<u32>,
    /// Milliseconds
    #[serde(alias = "executionTimeoutMs", alias = "execution_timeout", alias = "execution_timeout_ms")]
    pub execution_timeout: Option<u64>,
}

impl SubmissionMessage {
    pub fn from_value(value: Value) -> Result<Self, SchedulerError> {
        serde_json::from_value(value)
            .map_err(|e| SchedulerError::Validation(format!("malformed submission: {}", e)))
    }

    /// Convert into a typed submission, parsing the condition tree
    pub fn into_submission(self) -> Result<TaskSubmission, SchedulerError> {
        let condition = match self.condition {
            None | Some(Value::Null) => None,
            Some(raw) => Some(ConditionExpression::from_value(&raw)?),
        };

        Ok(TaskSubmission {
            id: self.id,
            query: self.query,
            priority: self.priority_factors,
            category: self.category,
            dependencies: self.dependencies,
            condition,
            produces: self.produces,
            max_retries: self.max_retries,
            execution_timeout_ms: self.execution_timeout,
        })
    }
}

/// Parse a JSON document holding one submission or an array of them
pub fn parse_submissions(json: &str) -> Result<Vec<SubmissionMessage>> {
    let value: Value = serde_json::from_str(json).context("Submission file is not valid JSON")?;

    let items = match value {
        Value::Array(items) => items,
        single @ Value::Object(_) => vec![single],
        other => anyhow::bail!("Expected a submission object or array, got {}", other),
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            SubmissionMessage::from_value(item)
                .with_context(|| format!("Invalid submission at index {}", i))
        })
        .collect()
}

/// Messages flowing back into the scheduler from collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// A subsystem finished a task
    Response {
        task_id: TaskId,
        #[serde(default)]
        subsystem: Option<String>,
        #[serde(default)]
        result: Value,
    },
    /// A subsystem failed a task
    Error { task_id: TaskId, error: String },
    /// External memory state changed
    MemoryUpdated { topic: String, status: String },
}

impl InboundMessage {
    pub fn response(task_id: TaskId, subsystem: impl Into<String>, result: Value) -> Self {
        InboundMessage::Response {
            task_id,
            subsystem: Some(subsystem.into()),
            result,
        }
    }

    pub fn error(task_id: TaskId, error: impl Into<String>) -> Self {
        InboundMessage::Error {
            task_id,
            error: error.into(),
        }
    }

    pub fn memory_updated(topic: impl Into<String>, status: impl Into<String>) -> Self {
        InboundMessage::MemoryUpdated {
            topic: topic.into(),
            status: status.into(),
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            InboundMessage::Response { task_id, .. } | InboundMessage::Error { task_id, .. } => {
                Some(*task_id)
            }
            InboundMessage::MemoryUpdated { .. } => None,
        }
    }

    /// Feed the message to the scheduler.
    ///
    /// Returns the ids of tasks activated by a memory update; responses and errors return an
    /// empty list.
    pub fn apply(self, scheduler: &mut Scheduler) -> Result<Vec<TaskId>, SchedulerError> {
        match self {
            InboundMessage::Response {
                task_id, result, ..
            } => {
                scheduler.report_completion(task_id, result)?;
                Ok(Vec::new())
            }
            InboundMessage::Error { task_id, error } => {
                scheduler.report_failure(task_id, failure_from_error(error))?;
                Ok(Vec::new())
            }
            InboundMessage::MemoryUpdated { topic, status } => {
                let satisfied = is_satisfied_status(&status);
                Ok(scheduler.update_state_label(topic, satisfied))
            }
        }
    }
}

/// `"cancelled"` is the distinguished cancellation reason; anything else is an execution error
pub fn failure_from_error(error: String) -> TaskFailure {
    if error.eq_ignore_ascii_case(crate::env::reasons::CANCELLED) {
        TaskFailure::Cancelled
    } else {
        TaskFailure::Execution { message: error }
    }
}

pub fn is_satisfied_status(status: &str) -> bool {
    let status = status.trim();
    SATISFIED_STATUSES
        .iter()
        .any(|s| s.eq_ignore_ascii_case(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{SchedulerConfig, TaskStatus};
    use serde_json::json;

    #[test]
    fn test_submission_message_camel_case() {
        let message = SubmissionMessage::from_value(json!({
            "id": 7,
            "query": {"text": "summarize"},
            "priorityFactors": {"userPriority": 8, "urgency": 2},
            "dependencies": [],
            "condition": {"type": "AND", "children": [
                {"type": "leaf", "prerequisite": "memory:a"},
                {"type": "not", "child": {"type": "leaf", "prerequisite": "memory:b"}}
            ]},
            "maxRetries": 1,
            "executionTimeout": 10
        }))
        .unwrap();

        let submission = message.into_submission().unwrap();
        assert_eq!(submission.id, Some(7));
        assert_eq!(submission.priority.user_priority, Some(8.0));
        assert_eq!(submission.max_retries, Some(1));
        assert_eq!(submission.execution_timeout_ms, Some(10));
        assert!(matches!(
            submission.condition,
            Some(ConditionExpression::And { .. })
        ));
    }

    #[test]
    fn test_unknown_condition_tag_rejected() {
        let message = SubmissionMessage::from_value(json!({
            "query": "q",
            "condition": {"type": "xor", "children": []}
        }))
        .unwrap();

        assert!(matches!(
            message.into_submission(),
            Err(SchedulerError::ConditionEvaluation(_))
        ));
    }

    #[test]
    fn test_parse_submissions_accepts_object_or_array() {
        assert_eq!(parse_submissions(r#"{"query": "one"}"#).unwrap().len(), 1);
        assert_eq!(
            parse_submissions(r#"[{"query": "one"}, {"query": "two"}]"#)
                .unwrap()
                .len(),
            2
        );
        assert!(parse_submissions("42").is_err());
        assert!(parse_submissions(r#"[{"query": "q", "dependencies": "x"}]"#).is_err());
    }

    #[test]
    fn test_inbound_message_wire_format() {
        let response: InboundMessage = serde_json::from_value(json!({
            "type": "response",
            "task_id": 3,
            "subsystem": "retrieval",
            "result": {"docs": 2}
        }))
        .unwrap();
        assert_eq!(response.task_id(), Some(3));

        let error: InboundMessage =
            serde_json::from_value(json!({"type": "error", "task_id": 3, "error": "boom"})).unwrap();
        assert_eq!(error, InboundMessage::error(3, "boom"));

        let memory: InboundMessage = serde_json::from_value(
            json!({"type": "memory_updated", "topic": "user:profile", "status": "completed"}),
        )
        .unwrap();
        assert_eq!(memory.task_id(), None);
    }

    #[test]
    fn test_failure_mapping() {
        assert_eq!(failure_from_error("Cancelled".into()), TaskFailure::Cancelled);
        assert_eq!(
            failure_from_error("model unavailable".into()),
            TaskFailure::Execution {
                message: "model unavailable".into()
            }
        );
        assert!(is_satisfied_status(" Completed "));
        assert!(!is_satisfied_status("stale"));
    }

    #[test]
    fn test_apply_messages() {
        let mut scheduler = Scheduler::new(SchedulerConfig::default());
        let a = scheduler.submit(TaskSubmission::new("a")).unwrap();
        let b = scheduler
            .submit(TaskSubmission::new("b").with_condition(ConditionExpression::leaf("user:profile")))
            .unwrap();

        scheduler.schedule_next_task().unwrap();
        InboundMessage::response(a, "retrieval", json!("ok"))
            .apply(&mut scheduler)
            .unwrap();
        assert_eq!(scheduler.get_task(a).unwrap().status, TaskStatus::Completed);

        let activated = InboundMessage::memory_updated("user:profile", "completed")
            .apply(&mut scheduler)
            .unwrap();
        assert_eq!(activated, vec![b]);

        assert!(InboundMessage::error(a, "late").apply(&mut scheduler).is_err());
    }
}
