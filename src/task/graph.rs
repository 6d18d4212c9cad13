use crate::task::types::{SchedulerError, TaskId, TaskStatus};
use std::collections::HashMap;
use tracing::debug;

type NodeIndex = usize;

/// Prerequisite edges between tasks.
///
/// Nodes live in an arena; forward (`prerequisites`) and reverse (`dependents`) edge lists
/// are updated together so the two directions never disagree.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    index: HashMap<TaskId, NodeIndex>,
    nodes: Vec<Node>,
}

#[derive(Debug, Clone)]
struct Node {
    id: TaskId,
    prerequisites: Vec<NodeIndex>,
    dependents: Vec<NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Register a task; no-op if it is already present
    pub fn add_node(&mut self, id: TaskId) {
        if self.index.contains_key(&id) {
            return;
        }
        self.index.insert(id, self.nodes.len());
        self.nodes.push(Node {
            id,
            prerequisites: Vec::new(),
            dependents: Vec::new(),
        });
    }

    /// Undo an `add_node` for a node that never got edges; only the most recent node can go
    pub fn discard_isolated(&mut self, id: TaskId) -> bool {
        let Some(&idx) = self.index.get(&id) else {
            return false;
        };
        let node = &self.nodes[idx];
        if idx + 1 != self.nodes.len() || !node.prerequisites.is_empty() || !node.dependents.is_empty() {
            return false;
        }
        self.nodes.pop();
        self.index.remove(&id);
        true
    }

    fn node_index(&self, id: TaskId) -> Result<NodeIndex, SchedulerError> {
        self.index
            .get(&id)
            .copied()
            .ok_or(SchedulerError::NotFound(id))
    }

    /// Add `dependent -> prerequisite`.
    ///
    /// The cycle check runs before insertion; on error the graph is unchanged.
    pub fn add_edge(&mut self, dependent: TaskId, prerequisite: TaskId) -> Result<(), SchedulerError> {
        if dependent == prerequisite {
            return Err(SchedulerError::Validation(format!(
                "task {} cannot depend on itself",
                dependent
            )));
        }

        let dep_idx = self.node_index(dependent)?;
        let pre_idx = self.node_index(prerequisite)?;

        if self.nodes[dep_idx].prerequisites.contains(&pre_idx) {
            return Ok(());
        }

        // The new edge closes a cycle iff the prerequisite already (transitively) depends on
        // the dependent.
        if self.reaches(pre_idx, dep_idx) {
            return Err(SchedulerError::DependencyCycle {
                dependent,
                prerequisite,
            });
        }

        self.nodes[dep_idx].prerequisites.push(pre_idx);
        self.nodes[pre_idx].dependents.push(dep_idx);

        debug!("Added dependency edge {} -> {}", dependent, prerequisite);
        Ok(())
    }

    /// Add several edges for one dependent; all or nothing
    pub fn add_edges(&mut self, dependent: TaskId, prerequisites: &[TaskId]) -> Result<(), SchedulerError> {
        let mut added = Vec::new();

        for &prerequisite in prerequisites {
            let already_present = self.depends_on(dependent, prerequisite);
            if let Err(e) = self.add_edge(dependent, prerequisite) {
                for &undo in &added {
                    self.remove_edge(dependent, undo);
                }
                return Err(e);
            }
            if !already_present {
                added.push(prerequisite);
            }
        }

        Ok(())
    }

    fn remove_edge(&mut self, dependent: TaskId, prerequisite: TaskId) {
        if let (Some(&dep_idx), Some(&pre_idx)) =
            (self.index.get(&dependent), self.index.get(&prerequisite))
        {
            self.nodes[dep_idx].prerequisites.retain(|&i| i != pre_idx);
            self.nodes[pre_idx].dependents.retain(|&i| i != dep_idx);
        }
    }

    /// Direct edge check
    pub fn depends_on(&self, dependent: TaskId, prerequisite: TaskId) -> bool {
        match (self.index.get(&dependent), self.index.get(&prerequisite)) {
            (Some(&dep_idx), Some(&pre_idx)) => self.nodes[dep_idx].prerequisites.contains(&pre_idx),
            _ => false,
        }
    }

    /// Whether `to` is reachable from `from` along prerequisite edges
    fn reaches(&self, from: NodeIndex, to: NodeIndex) -> bool {
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![from];

        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if visited[current] {
                continue;
            }
            visited[current] = true;
            stack.extend(self.nodes[current].prerequisites.iter().copied());
        }

        false
    }

    /// Direct prerequisites in insertion order
    pub fn prerequisites(&self, id: TaskId) -> Vec<TaskId> {
        self.index
            .get(&id)
            .map(|&idx| {
                self.nodes[idx]
                    .prerequisites
                    .iter()
                    .map(|&p| self.nodes[p].id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Direct dependents in insertion order
    pub fn dependents(&self, id: TaskId) -> Vec<TaskId> {
        self.index
            .get(&id)
            .map(|&idx| {
                self.nodes[idx]
                    .dependents
                    .iter()
                    .map(|&d| self.nodes[d].id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// True iff every prerequisite of `id` is `completed` according to `status_of`
    pub fn is_ready<F>(&self, id: TaskId, status_of: F) -> bool
    where
        F: Fn(TaskId) -> Option<TaskStatus>,
    {
        self.prerequisites(id)
            .into_iter()
            .all(|p| status_of(p) == Some(TaskStatus::Completed))
    }

    /// Dependents to re-check after `id` completed
    pub fn on_completed(&self, id: TaskId) -> Vec<TaskId> {
        self.dependents(id)
    }

    /// All tasks that transitively depend on `id`, nearest first
    pub fn transitive_dependents(&self, id: TaskId) -> Vec<TaskId> {
        let Some(&start) = self.index.get(&id) else {
            return Vec::new();
        };

        let mut visited = vec![false; self.nodes.len()];
        visited[start] = true;
        let mut queue = std::collections::VecDeque::from([start]);
        let mut order = Vec::new();

        while let Some(current) = queue.pop_front() {
            for &next in &self.nodes[current].dependents {
                if !visited[next] {
                    visited[next] = true;
                    order.push(self.nodes[next].id);
                    queue.push_back(next);
                }
            }
        }

        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with(ids: &[TaskId]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for &id in ids {
            graph.add_node(id);
        }
        graph
    }

    #[test]
    fn test_edges_are_bidirectional() {
        let mut graph = graph_with(&[1, 2, 3]);
        graph.add_edge(2, 1).unwrap();
        graph.add_edge(3, 1).unwrap();

        assert_eq!(graph.prerequisites(2), vec![1]);
        assert_eq!(graph.dependents(1), vec![2, 3]);
        assert!(graph.depends_on(3, 1));
        assert!(!graph.depends_on(1, 3));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut graph = graph_with(&[1]);
        assert!(matches!(
            graph.add_edge(1, 1),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[test]
    fn test_cycle_rejected_and_graph_unchanged() {
        let mut graph = graph_with(&[1, 2, 3]);
        graph.add_edge(2, 1).unwrap();
        graph.add_edge(3, 2).unwrap();

        let before_prereqs = graph.prerequisites(1);
        let before_dependents = graph.dependents(3);

        assert_eq!(
            graph.add_edge(1, 3),
            Err(SchedulerError::DependencyCycle {
                dependent: 1,
                prerequisite: 3
            })
        );
        assert_eq!(graph.prerequisites(1), before_prereqs);
        assert_eq!(graph.dependents(3), before_dependents);
    }

    #[test]
    fn test_add_edges_rolls_back_on_failure() {
        let mut graph = graph_with(&[1, 2, 3]);
        graph.add_edge(1, 3).unwrap();

        // 3 -> 2 is fine, 3 -> 1 closes a cycle through 1 -> 3.
        assert!(graph.add_edges(3, &[2, 1]).is_err());
        assert!(graph.prerequisites(3).is_empty());
        assert!(graph.dependents(2).is_empty());
    }

    #[test]
    fn test_unknown_nodes_not_found() {
        let mut graph = graph_with(&[1]);
        assert_eq!(graph.add_edge(1, 9), Err(SchedulerError::NotFound(9)));
    }

    #[test]
    fn test_readiness_requires_completed_prerequisites() {
        let mut graph = graph_with(&[1, 2, 3]);
        graph.add_edges(3, &[1, 2]).unwrap();

        let statuses = |completed: &'static [TaskId]| {
            move |id: TaskId| {
                Some(if completed.contains(&id) {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Failed
                })
            }
        };

        assert!(!graph.is_ready(3, statuses(&[1])));
        assert!(graph.is_ready(3, statuses(&[1, 2])));
        assert!(graph.is_ready(1, statuses(&[])));
    }

    #[test]
    fn test_transitive_dependents() {
        let mut graph = graph_with(&[1, 2, 3, 4]);
        graph.add_edge(2, 1).unwrap();
        graph.add_edge(3, 2).unwrap();
        graph.add_edge(4, 1).unwrap();

        assert_eq!(graph.transitive_dependents(1), vec![2, 4, 3]);
        assert_eq!(graph.on_completed(2), vec![3]);
    }
}
