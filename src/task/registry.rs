use crate::task::types::*;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Authoritative store of task records and their lifecycle state.
///
/// Tasks are kept in insertion order for the whole lifetime of the registry; every status
/// change goes through [`TaskRegistry::transition`] and is appended to the event stream.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    events: VecDeque<TaskEvent>,
    next_id: TaskId,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.index.contains_key(&id)
    }

    /// Resolve the id for a new task: the requested one if unused, otherwise the next
    /// monotonic id.
    pub fn allocate_id(&self, requested: Option<TaskId>) -> Result<TaskId, SchedulerError> {
        match requested {
            Some(id) if self.contains(id) => Err(SchedulerError::Validation(format!(
                "task id {} is already registered",
                id
            ))),
            Some(id) => Ok(id),
            None => {
                let mut id = self.next_id.max(1);
                while self.contains(id) {
                    id = id.checked_add(1).ok_or_else(|| {
                        SchedulerError::Validation("task id space exhausted".to_string())
                    })?;
                }
                Ok(id)
            }
        }
    }

    /// Store a new task; its status must be `pending`
    pub fn submit(&mut self, task: Task) -> Result<TaskId, SchedulerError> {
        let id = task.id;
        if self.contains(id) {
            return Err(SchedulerError::Validation(format!(
                "task id {} is already registered",
                id
            )));
        }
        if task.status != TaskStatus::Pending {
            return Err(SchedulerError::Validation(format!(
                "task {} must be submitted as pending, got {}",
                id, task.status
            )));
        }

        self.index.insert(id, self.tasks.len());
        self.tasks.push(task);
        self.next_id = self.next_id.max(id.saturating_add(1));

        self.events.push_back(TaskEvent::TaskSubmitted {
            task_id: id,
            status: TaskStatus::Pending,
        });
        debug!("Registered task {}", id);
        Ok(id)
    }

    pub fn get(&self, id: TaskId) -> Result<&Task, SchedulerError> {
        self.index
            .get(&id)
            .map(|&slot| &self.tasks[slot])
            .ok_or(SchedulerError::NotFound(id))
    }

    /// Mutable access for bookkeeping fields; status changes must use `transition`
    pub(crate) fn get_mut(&mut self, id: TaskId) -> Result<&mut Task, SchedulerError> {
        match self.index.get(&id) {
            Some(&slot) => Ok(&mut self.tasks[slot]),
            None => Err(SchedulerError::NotFound(id)),
        }
    }

    pub fn status_of(&self, id: TaskId) -> Option<TaskStatus> {
        self.get(id).ok().map(|t| t.status)
    }

    /// Move a task to `to`, enforcing the lifecycle state machine
    pub fn transition(
        &mut self,
        id: TaskId,
        to: TaskStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<TaskStatus, SchedulerError> {
        let task = self.get_mut(id)?;
        let from = task.status;

        if !from.can_transition_to(to) {
            return Err(SchedulerError::InvalidTransition {
                task_id: id,
                from,
                to,
            });
        }

        task.status = to;
        task.status_updated_at = now;
        task.status_reason = reason.clone();

        debug!("Task {} status: {} -> {} ({:?})", id, from, to, reason);
        self.events.push_back(TaskEvent::StatusChanged {
            task_id: id,
            from,
            to,
            reason,
        });
        Ok(from)
    }

    /// Tasks with `status`, in insertion order
    pub fn list_by_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.tasks.iter().filter(|t| t.status == status).collect()
    }

    pub fn count_by_status(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn push_event(&mut self, event: TaskEvent) {
        self.events.push_back(event);
    }

    /// Take every event recorded since the last drain
    pub fn drain_events(&mut self) -> Vec<TaskEvent> {
        self.events.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task(id: TaskId, now: DateTime<Utc>) -> Task {
        Task::new(
            id,
            serde_json::json!({"query": id}),
            TaskConfig {
                priority: PriorityFactors::default(),
                category: Some("test".to_string()),
                condition: None,
                produces: vec![],
                max_retries: 3,
                execution_timeout_ms: 30_000,
            },
            now,
        )
    }

    #[test]
    fn test_registry_creation() {
        let registry = TaskRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.allocate_id(None).unwrap(), 1);
    }

    #[test]
    fn test_submit_and_get() {
        let now = Utc::now();
        let mut registry = TaskRegistry::new();
        let id = registry.submit(new_task(1, now)).unwrap();

        let task = registry.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.config.category.as_deref(), Some("test"));
        assert_eq!(registry.get(42).unwrap_err(), SchedulerError::NotFound(42));
    }

    #[test]
    fn test_id_space_exhausted() {
        let now = Utc::now();
        let mut registry = TaskRegistry::new();
        registry.submit(new_task(TaskId::MAX, now)).unwrap();

        assert!(matches!(
            registry.allocate_id(None),
            Err(SchedulerError::Validation(_))
        ));
        assert_eq!(registry.allocate_id(Some(7)).unwrap(), 7);
    }

    #[test]
    fn test_ids_are_unique_and_monotonic() {
        let now = Utc::now();
        let mut registry = TaskRegistry::new();
        registry.submit(new_task(5, now)).unwrap();

        assert!(registry.submit(new_task(5, now)).is_err());
        assert!(registry.allocate_id(Some(5)).is_err());
        assert_eq!(registry.allocate_id(None).unwrap(), 6);
        assert_eq!(registry.allocate_id(Some(2)).unwrap(), 2);
    }

    #[test]
    fn test_transitions_follow_state_machine() {
        let now = Utc::now();
        let mut registry = TaskRegistry::new();
        registry.submit(new_task(1, now)).unwrap();

        let err = registry
            .transition(1, TaskStatus::Running, None, now)
            .unwrap_err();
        assert_eq!(
            err,
            SchedulerError::InvalidTransition {
                task_id: 1,
                from: TaskStatus::Pending,
                to: TaskStatus::Running
            }
        );

        let later = now + chrono::Duration::seconds(5);
        registry.transition(1, TaskStatus::Ready, None, later).unwrap();
        registry
            .transition(1, TaskStatus::Running, Some("dispatched".to_string()), later)
            .unwrap();

        let task = registry.get(1).unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.status_updated_at, later);
        assert_eq!(task.status_reason.as_deref(), Some("dispatched"));
    }

    #[test]
    fn test_events_recorded_and_drained() {
        let now = Utc::now();
        let mut registry = TaskRegistry::new();
        registry.submit(new_task(1, now)).unwrap();
        registry.transition(1, TaskStatus::Ready, None, now).unwrap();

        let events = registry.drain_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], TaskEvent::TaskSubmitted { task_id: 1, .. }));
        assert!(matches!(
            events[1],
            TaskEvent::StatusChanged {
                task_id: 1,
                from: TaskStatus::Pending,
                to: TaskStatus::Ready,
                ..
            }
        ));
        assert!(registry.drain_events().is_empty());
    }

    #[test]
    fn test_list_by_status_keeps_insertion_order() {
        let now = Utc::now();
        let mut registry = TaskRegistry::new();
        for id in [3, 1, 2] {
            registry.submit(new_task(id, now)).unwrap();
            registry.transition(id, TaskStatus::Ready, None, now).unwrap();
        }

        let ids: Vec<_> = registry
            .list_by_status(TaskStatus::Ready)
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(registry.count_by_status(TaskStatus::Pending), 0);
    }
}
