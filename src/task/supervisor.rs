use crate::task::types::{Task, TaskFailure, TaskId};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::debug;

/// An execution timer for a running task
#[derive(Debug, Clone, PartialEq)]
pub struct ArmedTimer {
    pub deadline: DateTime<Utc>,
    pub timeout_ms: u64,
}

/// `now + ms`, saturating at the latest representable instant
pub fn deadline_after(now: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(Duration::try_milliseconds)
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// What to do with a task whose execution timer fired
#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutOutcome {
    /// Back to `pending`, re-inserted after `delay_ms`
    Retry { retry_count: u32, delay_ms: u64 },
    /// Terminal failure
    Exhausted(TaskFailure),
}

/// Per-task execution timers and backoff re-insertions.
///
/// Timers are deadlines rather than sleeping futures: the owner polls [`expired`] and
/// [`due_reinsertions`] and sleeps until [`next_deadline`]. A timer exists only while its task
/// is running; every exit from `running` must call [`disarm`].
///
/// [`expired`]: RetryTimeoutSupervisor::expired
/// [`due_reinsertions`]: RetryTimeoutSupervisor::due_reinsertions
/// [`next_deadline`]: RetryTimeoutSupervisor::next_deadline
/// [`disarm`]: RetryTimeoutSupervisor::disarm
#[derive(Debug)]
pub struct RetryTimeoutSupervisor {
    timers: HashMap<TaskId, ArmedTimer>,
    reinsertions: HashMap<TaskId, DateTime<Utc>>,
    backoff_base_ms: u64,
    backoff_cap_ms: u64,
}

impl RetryTimeoutSupervisor {
    pub fn new(backoff_base_ms: u64, backoff_cap_ms: u64) -> Self {
        Self {
            timers: HashMap::new(),
            reinsertions: HashMap::new(),
            backoff_base_ms,
            backoff_cap_ms,
        }
    }

    /// Arm (or re-arm) the execution timer for a dispatched task
    pub fn arm(&mut self, task_id: TaskId, now: DateTime<Utc>, timeout_ms: u64) -> DateTime<Utc> {
        let deadline = deadline_after(now, timeout_ms);
        self.timers.insert(
            task_id,
            ArmedTimer {
                deadline,
                timeout_ms,
            },
        );
        debug!("Armed {} ms timer for task {}", timeout_ms, task_id);
        deadline
    }

    /// Cancel a task's timer; returns the timer if one was armed
    pub fn disarm(&mut self, task_id: TaskId) -> Option<ArmedTimer> {
        let timer = self.timers.remove(&task_id);
        if timer.is_some() {
            debug!("Disarmed timer for task {}", task_id);
        }
        timer
    }

    pub fn is_armed(&self, task_id: TaskId) -> bool {
        self.timers.contains_key(&task_id)
    }

    pub fn armed_count(&self) -> usize {
        self.timers.len()
    }

    /// Remove and return timers whose deadline is at or before `now`, earliest first
    pub fn expired(&mut self, now: DateTime<Utc>) -> Vec<(TaskId, ArmedTimer)> {
        let mut fired: Vec<(TaskId, ArmedTimer)> = self
            .timers
            .iter()
            .filter(|(_, timer)| timer.deadline <= now)
            .map(|(&id, timer)| (id, timer.clone()))
            .collect();

        fired.sort_by(|a, b| a.1.deadline.cmp(&b.1.deadline).then(a.0.cmp(&b.0)));
        for (id, _) in &fired {
            self.timers.remove(id);
        }
        fired
    }

    /// `min(cap, base * 2^retry_count)`
    pub fn backoff_delay_ms(&self, retry_count: u32) -> u64 {
        let factor = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        self.backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_cap_ms)
    }

    /// Decide the outcome of a timeout for `task`; does not mutate the task
    pub fn on_timeout(&self, task: &Task, timeout_ms: u64) -> TimeoutOutcome {
        self.retry_or_exhaust(task, TaskFailure::Timeout { timeout_ms })
    }

    /// Decide between a retry and terminal failure after `failure`
    pub fn retry_or_exhaust(&self, task: &Task, failure: TaskFailure) -> TimeoutOutcome {
        if task.has_retries_left() {
            let retry_count = task.retry_count + 1;
            TimeoutOutcome::Retry {
                retry_count,
                delay_ms: self.backoff_delay_ms(retry_count),
            }
        } else {
            TimeoutOutcome::Exhausted(TaskFailure::RetriesExhausted {
                attempts: task.retry_count + 1,
                last: Box::new(failure),
            })
        }
    }

    /// Schedule a retried task to re-enter the ready pipeline at `due`
    pub fn schedule_reinsertion(&mut self, task_id: TaskId, due: DateTime<Utc>) {
        self.reinsertions.insert(task_id, due);
    }

    pub fn cancel_reinsertion(&mut self, task_id: TaskId) -> bool {
        self.reinsertions.remove(&task_id).is_some()
    }

    pub fn has_reinsertion(&self, task_id: TaskId) -> bool {
        self.reinsertions.contains_key(&task_id)
    }

    pub fn reinsertion_count(&self) -> usize {
        self.reinsertions.len()
    }

    /// Remove and return re-insertions due at or before `now`, earliest first
    pub fn due_reinsertions(&mut self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut due: Vec<(TaskId, DateTime<Utc>)> = self
            .reinsertions
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(&id, &at)| (id, at))
            .collect();

        due.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        for (id, _) in &due {
            self.reinsertions.remove(id);
        }
        due.into_iter().map(|(id, _)| id).collect()
    }

    /// Earliest timer deadline or re-insertion time
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.timers
            .values()
            .map(|t| t.deadline)
            .chain(self.reinsertions.values().copied())
            .min()
    }
}
