//! # cogloop
//!
//! Priority task dispatcher for the cognitive loop of an agent. Tasks are ranked by a
//! multi-factor score with age-based anti-starvation, gated on prerequisite tasks and on
//! boolean conditions over external memory state, and supervised with execution timeouts and
//! exponential-backoff retries.
//!
//! ## Architecture Overview
//!
//! - **[`task`]**: the synchronous scheduling engine (registry, dependency graph, condition
//!   evaluation, scoring, deferred activation, retry/timeout supervision)
//! - **[`dispatch`]**: async actor owning the engine, driving timers and execution runners
//! - **[`protocol`]**: submission, response and memory-update wire messages
//! - **[`config`]**: TOML configuration
//!
//! ## Quick Start
//!
//! ```rust
//! use cogloop::{Scheduler, SchedulerConfig, TaskStatus, TaskSubmission};
//!
//! let mut scheduler = Scheduler::new(SchedulerConfig::default());
//! let recall = scheduler.submit(TaskSubmission::new("recall context")).unwrap();
//! let answer = scheduler
//!     .submit(TaskSubmission::new("answer").with_dependencies(vec![recall]))
//!     .unwrap();
//!
//! let task = scheduler.schedule_next_task().unwrap();
//! assert_eq!(task.id, recall);
//! scheduler.report_completion(recall, serde_json::json!({"facts": 3})).unwrap();
//! assert_eq!(scheduler.get_task(answer).unwrap().status, TaskStatus::Ready);
//! ```

/// Scheduling engine.
///
/// Every operation is a synchronous step over `&mut Scheduler`; time comes from an injected
/// [`task::Clock`].
pub mod task;

/// Async dispatcher actor and execution runner trait.
pub mod dispatch;

/// Wire messages exchanged with collaborators.
pub mod protocol;

/// Engine configuration.
pub mod config;

/// Environment constants and path utilities.
pub mod env;

// CLI module for command-line interface
pub mod cli;

pub use config::EngineConfig;
pub use dispatch::{Dispatcher, DispatcherConfig, DispatcherHandle, TaskRunner};
pub use protocol::{InboundMessage, SubmissionMessage};
pub use task::{
    ConditionExpression, Scheduler, SchedulerConfig, SchedulerError, Task, TaskEvent, TaskFailure,
    TaskId, TaskStatus, TaskSubmission,
};
