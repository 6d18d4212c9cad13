//! Async host for the scheduler.
//!
//! A [`Dispatcher`] owns the [`Scheduler`] and is the only code that touches it: submissions,
//! protocol messages, runner results and timer deadlines are all funneled into one loop, so
//! every scheduler step runs to completion before the next event is looked at. Callers talk to
//! it through a cloneable [`DispatcherHandle`].

use crate::env::defaults;
use crate::protocol::InboundMessage;
use crate::task::{Scheduler, SchedulerError, SchedulerStatistics, Task, TaskEvent, TaskId, TaskSubmission};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Capacity of the command channel
    pub command_buffer: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            command_buffer: defaults::COMMAND_BUFFER,
        }
    }
}

/// Execution collaborator for dispatched tasks.
///
/// `Ok(result)` is reported back as a `response` message, `Err` as an `error` message. A
/// runner that never returns is eventually timed out by the scheduler and its future dropped.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Subsystem name attached to responses
    fn name(&self) -> &str {
        "runner"
    }

    async fn run(&self, task: &Task) -> anyhow::Result<serde_json::Value>;
}

/// Runner that answers every task with its own query after an optional delay
#[derive(Debug, Clone, Default)]
pub struct EchoRunner {
    pub delay: Duration,
}

impl EchoRunner {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl TaskRunner for EchoRunner {
    fn name(&self) -> &str {
        "echo"
    }

    async fn run(&self, task: &Task) -> anyhow::Result<serde_json::Value> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(serde_json::json!({ "echo": task.query }))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error("Dispatcher is not running")]
    Closed,
}

/// Requests accepted by the dispatcher loop
#[derive(Debug)]
pub enum DispatcherCommand {
    Submit {
        submission: TaskSubmission,
        respond: oneshot::Sender<Result<TaskId, SchedulerError>>,
    },
    Inbound {
        message: InboundMessage,
        respond: oneshot::Sender<Result<Vec<TaskId>, SchedulerError>>,
    },
    Cancel {
        task_id: TaskId,
        respond: oneshot::Sender<Result<(), SchedulerError>>,
    },
    GetTask {
        task_id: TaskId,
        respond: oneshot::Sender<Result<Task, SchedulerError>>,
    },
    Statistics {
        respond: oneshot::Sender<SchedulerStatistics>,
    },
    Subscribe {
        respond: oneshot::Sender<mpsc::UnboundedReceiver<TaskEvent>>,
    },
    Shutdown,
}

/// A runner's answer for one dispatch attempt
#[derive(Debug)]
struct RunnerOutcome {
    task_id: TaskId,
    attempt: u32,
    message: InboundMessage,
}

struct InFlight {
    attempt: u32,
    handle: JoinHandle<()>,
}

/// Cloneable client for a running [`Dispatcher`]
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    commands: mpsc::Sender<DispatcherCommand>,
}

impl DispatcherHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> DispatcherCommand,
    ) -> Result<T, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| DispatchError::Closed)?;
        rx.await.map_err(|_| DispatchError::Closed)
    }

    pub async fn submit(&self, submission: TaskSubmission) -> Result<TaskId, DispatchError> {
        Ok(self
            .request(|respond| DispatcherCommand::Submit {
                submission,
                respond,
            })
            .await??)
    }

    /// Deliver a protocol message; returns activated task ids for memory updates
    pub async fn send(&self, message: InboundMessage) -> Result<Vec<TaskId>, DispatchError> {
        Ok(self
            .request(|respond| DispatcherCommand::Inbound { message, respond })
            .await??)
    }

    pub async fn report_response(
        &self,
        task_id: TaskId,
        subsystem: impl Into<String>,
        result: serde_json::Value,
    ) -> Result<(), DispatchError> {
        self.send(InboundMessage::response(task_id, subsystem, result))
            .await
            .map(|_| ())
    }

    pub async fn report_error(&self, task_id: TaskId, error: impl Into<String>) -> Result<(), DispatchError> {
        self.send(InboundMessage::error(task_id, error))
            .await
            .map(|_| ())
    }

    pub async fn memory_updated(
        &self,
        topic: impl Into<String>,
        status: impl Into<String>,
    ) -> Result<Vec<TaskId>, DispatchError> {
        self.send(InboundMessage::memory_updated(topic, status)).await
    }

    pub async fn cancel(&self, task_id: TaskId) -> Result<(), DispatchError> {
        Ok(self
            .request(|respond| DispatcherCommand::Cancel { task_id, respond })
            .await??)
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task, DispatchError> {
        Ok(self
            .request(|respond| DispatcherCommand::GetTask { task_id, respond })
            .await??)
    }

    pub async fn statistics(&self) -> Result<SchedulerStatistics, DispatchError> {
        self.request(|respond| DispatcherCommand::Statistics { respond })
            .await
    }

    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<TaskEvent>, DispatchError> {
        self.request(|respond| DispatcherCommand::Subscribe { respond })
            .await
    }

    /// Ask the loop to stop; in-flight runners are aborted
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        self.commands
            .send(DispatcherCommand::Shutdown)
            .await
            .map_err(|_| DispatchError::Closed)
    }
}

/// Single-owner event loop around a [`Scheduler`]
pub struct Dispatcher {
    scheduler: Scheduler,
    runner: Arc<dyn TaskRunner>,
    commands: mpsc::Receiver<DispatcherCommand>,
    outcomes_tx: mpsc::UnboundedSender<RunnerOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<RunnerOutcome>,
    in_flight: HashMap<TaskId, InFlight>,
}

impl Dispatcher {
    pub fn new(
        scheduler: Scheduler,
        runner: Arc<dyn TaskRunner>,
        config: &DispatcherConfig,
    ) -> (Self, DispatcherHandle) {
        let (commands_tx, commands) = mpsc::channel(config.command_buffer.max(1));
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();

        let dispatcher = Self {
            scheduler,
            runner,
            commands,
            outcomes_tx,
            outcomes_rx,
            in_flight: HashMap::new(),
        };
        (dispatcher, DispatcherHandle { commands: commands_tx })
    }

    /// Spawn the loop; the join handle yields the scheduler after shutdown
    pub fn spawn(
        scheduler: Scheduler,
        runner: Arc<dyn TaskRunner>,
        config: &DispatcherConfig,
    ) -> (DispatcherHandle, JoinHandle<Scheduler>) {
        let (dispatcher, handle) = Self::new(scheduler, runner, config);
        (handle, tokio::spawn(dispatcher.run()))
    }

    pub async fn run(mut self) -> Scheduler {
        info!("Dispatcher started with runner '{}'", self.runner.name());

        loop {
            self.pump();
            let deadline = self.next_wakeup();

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(DispatcherCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                Some(outcome) = self.outcomes_rx.recv() => self.handle_outcome(outcome),
                _ = sleep_until(deadline) => {
                    debug!("Timer deadline reached");
                }
            }
        }

        for (_, flight) in self.in_flight.drain() {
            flight.handle.abort();
        }
        info!("Dispatcher stopped");
        self.scheduler
    }

    /// Fire due timers, dispatch whatever fits, and drop runners for tasks that left `running`
    fn pump(&mut self) {
        for task in self.scheduler.schedule_ready_tasks() {
            self.launch(task);
        }
        self.reap();
    }

    fn launch(&mut self, task: Task) {
        let task_id = task.id;
        let attempt = task.retry_count + 1;
        if let Some(previous) = self.in_flight.remove(&task_id) {
            previous.handle.abort();
        }

        let runner = Arc::clone(&self.runner);
        let outcomes = self.outcomes_tx.clone();
        let handle = tokio::spawn(async move {
            let message = match runner.run(&task).await {
                Ok(result) => InboundMessage::response(task.id, runner.name(), result),
                Err(e) => InboundMessage::error(task.id, e.to_string()),
            };
            let _ = outcomes.send(RunnerOutcome {
                task_id: task.id,
                attempt,
                message,
            });
        });

        self.in_flight.insert(task_id, InFlight { attempt, handle });
    }

    fn reap(&mut self) {
        let scheduler = &self.scheduler;
        self.in_flight.retain(|&task_id, flight| {
            let live = scheduler
                .get_task(task_id)
                .is_ok_and(|t| t.is_running() && t.retry_count + 1 == flight.attempt);
            if !live {
                debug!("Aborting runner for task {} (attempt {})", task_id, flight.attempt);
                flight.handle.abort();
            }
            live
        });
    }

    fn next_wakeup(&self) -> Option<Instant> {
        let deadline = self.scheduler.next_deadline()?;
        let wait = (deadline - self.scheduler.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        // A deadline past what `Instant` can represent never wakes the loop
        Instant::now().checked_add(wait.saturating_add(Duration::from_millis(1)))
    }

    fn handle_outcome(&mut self, outcome: RunnerOutcome) {
        let current = self
            .in_flight
            .get(&outcome.task_id)
            .is_some_and(|flight| flight.attempt == outcome.attempt);
        if !current {
            debug!(
                "Discarding stale result for task {} (attempt {})",
                outcome.task_id, outcome.attempt
            );
            return;
        }

        self.in_flight.remove(&outcome.task_id);
        if let Err(e) = outcome.message.apply(&mut self.scheduler) {
            warn!("Runner result for task {} rejected: {}", outcome.task_id, e);
        }
    }

    fn handle_command(&mut self, command: DispatcherCommand) {
        match command {
            DispatcherCommand::Submit {
                submission,
                respond,
            } => {
                let _ = respond.send(self.scheduler.submit(submission));
            }
            DispatcherCommand::Inbound { message, respond } => {
                let _ = respond.send(message.apply(&mut self.scheduler));
            }
            DispatcherCommand::Cancel { task_id, respond } => {
                let _ = respond.send(self.scheduler.cancel(task_id));
            }
            DispatcherCommand::GetTask { task_id, respond } => {
                let _ = respond.send(self.scheduler.get_task(task_id).cloned());
            }
            DispatcherCommand::Statistics { respond } => {
                let _ = respond.send(self.scheduler.statistics());
            }
            DispatcherCommand::Subscribe { respond } => {
                let _ = respond.send(self.scheduler.subscribe());
            }
            DispatcherCommand::Shutdown => {}
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
