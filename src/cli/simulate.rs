//! Offline simulation and validation of submission files

use crate::EngineConfig;
use crate::cli::args::RunConfig;
use crate::dispatch::{DispatchError, Dispatcher, EchoRunner, TaskRunner};
use crate::protocol::SubmissionMessage;
use crate::task::{Scheduler, SchedulerStatistics, Task, TaskEvent, TaskId, TaskStatus};
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct RejectedSubmission {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub events: Vec<TaskEvent>,
    pub tasks: Vec<Task>,
    pub statistics: SchedulerStatistics,
    pub rejected: Vec<RejectedSubmission>,
    pub timed_out: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceptedSubmission {
    pub index: usize,
    pub task_id: TaskId,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub accepted: Vec<AcceptedSubmission>,
    pub rejected: Vec<RejectedSubmission>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Runs submissions through a dispatcher until nothing can make progress
pub struct Simulation {
    config: EngineConfig,
    runner: Arc<dyn TaskRunner>,
    memory_topics: Vec<String>,
    timeout: Duration,
}

impl Simulation {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            runner: Arc::new(EchoRunner::default()),
            memory_topics: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Apply command line overrides
    pub fn from_run_config(mut config: EngineConfig, run: &RunConfig) -> Self {
        if let Some(max_concurrent) = run.max_concurrent {
            config.scheduler.max_concurrent_tasks = max_concurrent;
        }

        Self::new(config)
            .with_runner(Arc::new(EchoRunner::new(Duration::from_millis(run.runner_delay_ms))))
            .with_memory_topics(run.memory_topics.clone())
            .with_timeout(Duration::from_secs(run.timeout_secs))
    }

    pub fn with_runner(mut self, runner: Arc<dyn TaskRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_memory_topics(mut self, topics: Vec<String>) -> Self {
        self.memory_topics = topics;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn run(
        self,
        submissions: Vec<SubmissionMessage>,
        mut on_event: impl FnMut(&TaskEvent),
    ) -> Result<SimulationReport> {
        self.config.validate()?;

        let scheduler = Scheduler::new(self.config.scheduler.clone());
        let (handle, join) = Dispatcher::spawn(scheduler, self.runner, &self.config.dispatcher);
        let mut events = handle.subscribe().await?;

        let mut rejected = Vec::new();
        for (index, message) in submissions.into_iter().enumerate() {
            let result = match message.into_submission() {
                Ok(submission) => handle.submit(submission).await,
                Err(e) => Err(DispatchError::Scheduler(e)),
            };
            match result {
                Ok(_) => {}
                Err(DispatchError::Closed) => anyhow::bail!("Dispatcher stopped during submission"),
                Err(e) => {
                    warn!("Submission {} rejected: {}", index, e);
                    rejected.push(RejectedSubmission {
                        index,
                        error: e.to_string(),
                    });
                }
            }
        }

        for topic in &self.memory_topics {
            handle.memory_updated(topic.as_str(), "completed").await?;
        }

        let deadline = Instant::now() + self.timeout;
        let mut seen = Vec::new();
        let mut timed_out = false;

        loop {
            while let Ok(event) = events.try_recv() {
                on_event(&event);
                seen.push(event);
            }
            if handle.statistics().await?.is_idle() {
                break;
            }

            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(event)) => {
                    on_event(&event);
                    seen.push(event);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!("Simulation timed out after {:?}", self.timeout);
                    timed_out = true;
                    break;
                }
            }
        }

        handle.shutdown().await?;
        let scheduler = join.await.context("Dispatcher task failed")?;
        while let Ok(event) = events.try_recv() {
            on_event(&event);
            seen.push(event);
        }

        let statistics = scheduler.statistics();
        info!(
            "Simulation finished: {} completed, {} failed, {} still waiting",
            statistics.completed_tasks,
            statistics.failed_tasks,
            statistics.pending_tasks + statistics.deferred_tasks
        );

        Ok(SimulationReport {
            events: seen,
            tasks: scheduler.tasks().cloned().collect(),
            statistics,
            rejected,
            timed_out,
        })
    }
}

/// Submit every message to a fresh scheduler and report how each one fares
pub fn validate_submissions(config: &EngineConfig, submissions: Vec<SubmissionMessage>) -> ValidationReport {
    let mut scheduler = Scheduler::new(config.scheduler.clone());
    let mut report = ValidationReport::default();

    for (index, message) in submissions.into_iter().enumerate() {
        let outcome = message
            .into_submission()
            .and_then(|submission| scheduler.submit(submission))
            .and_then(|task_id| Ok((task_id, scheduler.get_task(task_id)?.status)));

        match outcome {
            Ok((task_id, status)) => report.accepted.push(AcceptedSubmission {
                index,
                task_id,
                status,
            }),
            Err(e) => report.rejected.push(RejectedSubmission {
                index,
                error: e.to_string(),
            }),
        }
    }

    report
}

/// One-line human description of an event
pub fn describe_event(event: &TaskEvent) -> String {
    match event {
        TaskEvent::TaskSubmitted { task_id, .. } => format!("task {} submitted", task_id),
        TaskEvent::StatusChanged {
            task_id,
            from,
            to,
            reason,
        } => match reason {
            Some(reason) => format!("task {} {} -> {} ({})", task_id, from, to, reason),
            None => format!("task {} {} -> {}", task_id, from, to),
        },
        TaskEvent::TaskActivated { task_id } => format!("task {} activated", task_id),
        TaskEvent::TaskDispatched {
            task_id,
            score,
            attempt,
        } => format!(
            "task {} dispatched (score {:.2}, attempt {})",
            task_id, score, attempt
        ),
        TaskEvent::TaskCompleted { task_id, result } => {
            format!("task {} completed: {}", task_id, result)
        }
        TaskEvent::TaskFailed { task_id, error } => format!("task {} failed: {}", task_id, error),
        TaskEvent::RetryScheduled {
            task_id,
            retry_count,
            delay_ms,
        } => format!(
            "task {} retry {} in {} ms",
            task_id, retry_count, delay_ms
        ),
    }
}
