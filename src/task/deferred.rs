use crate::task::condition::{ConditionEvaluator, SatisfiedState};
use crate::task::graph::DependencyGraph;
use crate::task::registry::TaskRegistry;
use crate::task::types::*;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

/// Holds tasks blocked on an unmet condition or prerequisite and promotes them to `ready`
/// when both become satisfied.
///
/// This is the only path from `deferred` back into the ready pipeline. Tasks that never
/// activate stay deferred until cancelled.
#[derive(Debug, Default)]
pub struct DeferredActivationManager {
    deferred: Vec<TaskId>,
}

impl DeferredActivationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_deferred(&mut self, task_id: TaskId) {
        if !self.deferred.contains(&task_id) {
            self.deferred.push(task_id);
        }
    }

    /// Drop a task from the deferred set (cancellation); returns whether it was present
    pub fn remove(&mut self, task_id: TaskId) -> bool {
        let before = self.deferred.len();
        self.deferred.retain(|&id| id != task_id);
        before != self.deferred.len()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.deferred.contains(&task_id)
    }

    pub fn len(&self) -> usize {
        self.deferred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deferred.is_empty()
    }

    pub fn task_ids(&self) -> &[TaskId] {
        &self.deferred
    }

    /// Whether a task's condition (if any) holds against `satisfied`
    pub fn condition_met<S>(task: &Task, satisfied: &S) -> Result<bool, SchedulerError>
    where
        S: SatisfiedState + ?Sized,
    {
        match &task.config.condition {
            Some(condition) => Ok(ConditionEvaluator::evaluate(condition, satisfied)?),
            None => Ok(true),
        }
    }

    /// Re-evaluate every deferred task.
    ///
    /// Tasks whose condition holds and whose prerequisites are all completed are removed from
    /// the deferred set and moved to `ready` in the same step, emitting `task_activated`.
    /// Returns the activated ids in deferral order.
    pub fn on_external_state_change<S>(
        &mut self,
        registry: &mut TaskRegistry,
        graph: &DependencyGraph,
        satisfied: &S,
        now: DateTime<Utc>,
    ) -> Vec<TaskId>
    where
        S: SatisfiedState + ?Sized,
    {
        let mut activated = Vec::new();
        let mut still_deferred = Vec::with_capacity(self.deferred.len());

        for &task_id in &self.deferred {
            match Self::try_activate(task_id, registry, graph, satisfied, now) {
                Ok(true) => activated.push(task_id),
                Ok(false) => still_deferred.push(task_id),
                Err(SchedulerError::NotFound(_)) => {
                    warn!("Deferred task {} no longer registered; dropping", task_id);
                }
                Err(e) => {
                    warn!("Deferred task {} could not be re-evaluated: {}", task_id, e);
                    still_deferred.push(task_id);
                }
            }
        }

        self.deferred = still_deferred;

        if !activated.is_empty() {
            info!("Activated {} deferred tasks: {:?}", activated.len(), activated);
        }
        activated
    }

    fn try_activate<S>(
        task_id: TaskId,
        registry: &mut TaskRegistry,
        graph: &DependencyGraph,
        satisfied: &S,
        now: DateTime<Utc>,
    ) -> Result<bool, SchedulerError>
    where
        S: SatisfiedState + ?Sized,
    {
        let task = registry.get(task_id)?;
        if task.status != TaskStatus::Deferred {
            // Cancelled or otherwise moved on outside the manager.
            return Err(SchedulerError::NotFound(task_id));
        }

        if !Self::condition_met(task, satisfied)? {
            return Ok(false);
        }
        if !graph.is_ready(task_id, |p| registry.status_of(p)) {
            return Ok(false);
        }

        registry.transition(
            task_id,
            TaskStatus::Ready,
            Some(crate::env::reasons::ACTIVATED.to_string()),
            now,
        )?;
        registry.push_event(TaskEvent::TaskActivated { task_id });
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::condition::ConditionExpression;
    use std::collections::HashSet;

    fn deferred_task(
        registry: &mut TaskRegistry,
        graph: &mut DependencyGraph,
        id: TaskId,
        condition: Option<ConditionExpression>,
        now: DateTime<Utc>,
    ) {
        let task = Task::new(
            id,
            serde_json::json!(id),
            TaskConfig {
                priority: PriorityFactors::default(),
                category: None,
                condition,
                produces: vec![],
                max_retries: 3,
                execution_timeout_ms: 30_000,
            },
            now,
        );
        registry.submit(task).unwrap();
        graph.add_node(id);
        registry
            .transition(id, TaskStatus::Deferred, None, now)
            .unwrap();
    }

    fn labels(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_activation_on_state_change() {
        let now = Utc::now();
        let mut registry = TaskRegistry::new();
        let mut graph = DependencyGraph::new();
        let mut manager = DeferredActivationManager::new();

        deferred_task(&mut registry, &mut graph, 1, Some(ConditionExpression::leaf("X")), now);
        manager.add_deferred(1);

        let activated = manager.on_external_state_change(&mut registry, &graph, &labels(&[]), now);
        assert!(activated.is_empty());
        assert!(manager.contains(1));

        let activated =
            manager.on_external_state_change(&mut registry, &graph, &labels(&["X"]), now);
        assert_eq!(activated, vec![1]);
        assert!(manager.is_empty());
        assert_eq!(registry.status_of(1), Some(TaskStatus::Ready));

        let events = registry.drain_events();
        assert!(events.contains(&TaskEvent::TaskActivated { task_id: 1 }));
    }

    #[test]
    fn test_activation_waits_for_dependencies() {
        let now = Utc::now();
        let mut registry = TaskRegistry::new();
        let mut graph = DependencyGraph::new();
        let mut manager = DeferredActivationManager::new();

        deferred_task(&mut registry, &mut graph, 1, None, now);
        deferred_task(&mut registry, &mut graph, 2, Some(ConditionExpression::leaf("X")), now);
        graph.add_edge(2, 1).unwrap();
        manager.add_deferred(2);

        let activated =
            manager.on_external_state_change(&mut registry, &graph, &labels(&["X"]), now);
        assert!(activated.is_empty());
        assert_eq!(registry.status_of(2), Some(TaskStatus::Deferred));

        registry.transition(1, TaskStatus::Ready, None, now).unwrap();
        registry.transition(1, TaskStatus::Running, None, now).unwrap();
        registry.transition(1, TaskStatus::Completed, None, now).unwrap();

        let activated =
            manager.on_external_state_change(&mut registry, &graph, &labels(&["X"]), now);
        assert_eq!(activated, vec![2]);
    }

    #[test]
    fn test_cancelled_tasks_are_dropped() {
        let now = Utc::now();
        let mut registry = TaskRegistry::new();
        let mut graph = DependencyGraph::new();
        let mut manager = DeferredActivationManager::new();

        deferred_task(&mut registry, &mut graph, 1, Some(ConditionExpression::leaf("X")), now);
        manager.add_deferred(1);
        registry.transition(1, TaskStatus::Failed, None, now).unwrap();

        let activated =
            manager.on_external_state_change(&mut registry, &graph, &labels(&["X"]), now);
        assert!(activated.is_empty());
        assert!(manager.is_empty());
        assert!(!manager.remove(1));
    }
}
