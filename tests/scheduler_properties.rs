//! Behavioural guarantees of the scheduling engine, driven on a manual clock.

use chrono::Duration;
use cogloop::task::{
    ConditionEvaluator, ConditionExpression, DependencyGraph, ManualClock, Scheduler,
    SchedulerConfig, SchedulerError, ScoringWeights, TaskEvent, TaskFailure, TaskStatus,
    TaskSubmission,
};
use std::collections::HashSet;
use std::sync::Arc;

fn scheduler_with(config: SchedulerConfig) -> (Scheduler, ManualClock) {
    let clock = ManualClock::default();
    (Scheduler::with_clock(config, Arc::new(clock.clone())), clock)
}

fn default_scheduler() -> (Scheduler, ManualClock) {
    scheduler_with(SchedulerConfig::default())
}

#[test]
fn test_unconstrained_submission_is_ready() {
    let (mut scheduler, _) = default_scheduler();

    for query in ["a", "b", "c"] {
        let id = scheduler.submit(TaskSubmission::new(query)).unwrap();
        let task = scheduler.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.retry_count, 0);
    }
}

#[test]
fn test_cycle_rejected_and_graph_unchanged() {
    let mut graph = DependencyGraph::new();
    for id in 1..=4 {
        graph.add_node(id);
    }
    graph.add_edge(2, 1).unwrap();
    graph.add_edge(3, 2).unwrap();
    graph.add_edge(4, 3).unwrap();

    let snapshot: Vec<_> = (1..=4)
        .map(|id| (graph.prerequisites(id), graph.dependents(id)))
        .collect();

    assert_eq!(
        graph.add_edge(1, 4),
        Err(SchedulerError::DependencyCycle {
            dependent: 1,
            prerequisite: 4
        })
    );
    assert!(matches!(
        graph.add_edges(2, &[4]),
        Err(SchedulerError::DependencyCycle { .. })
    ));

    let after: Vec<_> = (1..=4)
        .map(|id| (graph.prerequisites(id), graph.dependents(id)))
        .collect();
    assert_eq!(snapshot, after);
}

#[test]
fn test_cycle_through_scheduler_leaves_tasks_untouched() {
    let (mut scheduler, _) = default_scheduler();
    let a = scheduler.submit(TaskSubmission::new("a")).unwrap();
    let b = scheduler
        .submit(TaskSubmission::new("b").with_dependencies(vec![a]))
        .unwrap();

    assert!(matches!(
        scheduler.add_dependency(a, b),
        Err(SchedulerError::DependencyCycle { .. })
    ));
    assert!(scheduler.dependencies_of(a).is_empty());
    assert_eq!(scheduler.get_task(a).unwrap().status, TaskStatus::Ready);
}

#[test]
fn test_threshold_two_of_three() {
    let labels = ["A", "B", "C"];
    let explicit = ConditionExpression::threshold(
        labels.iter().map(|l| ConditionExpression::leaf(*l)).collect(),
        Some(2),
    );
    let implicit = ConditionExpression::threshold(
        labels.iter().map(|l| ConditionExpression::leaf(*l)).collect(),
        None,
    );

    // Every subset of {A, B, C}
    for mask in 0u8..8 {
        let satisfied: HashSet<String> = labels
            .iter()
            .enumerate()
            .filter(|(i, _)| mask & (1 << i) != 0)
            .map(|(_, l)| l.to_string())
            .collect();
        let expected = satisfied.len() >= 2;

        assert_eq!(ConditionEvaluator::evaluate(&explicit, &satisfied).unwrap(), expected);
        assert_eq!(ConditionEvaluator::evaluate(&implicit, &satisfied).unwrap(), expected);
    }
}

#[test]
fn test_deferred_task_activates_on_state_change() {
    let (mut scheduler, _) = default_scheduler();
    let mut events = scheduler.subscribe();

    let id = scheduler
        .submit(TaskSubmission::new("needs X").with_condition(ConditionExpression::leaf("X")))
        .unwrap();
    assert_eq!(scheduler.get_task(id).unwrap().status, TaskStatus::Deferred);
    assert!(scheduler.schedule_next_task().is_none());

    assert!(scheduler.on_external_state_change(["Y"]).is_empty());
    assert_eq!(scheduler.on_external_state_change(["X"]), vec![id]);

    let task = scheduler.get_task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Ready);
    assert_eq!(task.status_reason.as_deref(), Some("activated"));

    let mut activated = false;
    while let Ok(event) = events.try_recv() {
        activated |= event == TaskEvent::TaskActivated { task_id: id };
    }
    assert!(activated);

    assert_eq!(scheduler.schedule_next_task().unwrap().id, id);
}

#[test]
fn test_identical_scores_prefer_earlier_creation() {
    let config = SchedulerConfig {
        weights: ScoringWeights {
            age_weight: 0.0,
            ..Default::default()
        },
        ..Default::default()
    };
    let (mut scheduler, clock) = scheduler_with(config);

    // The earlier task gets the larger id so creation time, not id, decides.
    let earlier = scheduler
        .submit(TaskSubmission::new("earlier").with_id(20))
        .unwrap();
    clock.advance_ms(5);
    let later = scheduler.submit(TaskSubmission::new("later").with_id(10)).unwrap();

    assert_eq!(
        scheduler.explain(earlier).unwrap().total,
        scheduler.explain(later).unwrap().total
    );
    assert_eq!(scheduler.schedule_next_task().unwrap().id, earlier);
    assert_eq!(scheduler.schedule_next_task().unwrap().id, later);
}

#[test]
fn test_identical_scores_and_creation_prefer_lower_id() {
    let config = SchedulerConfig {
        weights: ScoringWeights {
            age_weight: 0.0,
            ..Default::default()
        },
        ..Default::default()
    };
    let (mut scheduler, _) = scheduler_with(config);

    scheduler.submit(TaskSubmission::new("x").with_id(9)).unwrap();
    scheduler.submit(TaskSubmission::new("y").with_id(3)).unwrap();

    assert_eq!(scheduler.schedule_next_task().unwrap().id, 3);
}

#[test]
fn test_timeout_retries_then_exhausts() {
    let (mut scheduler, clock) = default_scheduler();
    let id = scheduler
        .submit(
            TaskSubmission::new("slow")
                .with_max_retries(2)
                .with_execution_timeout_ms(100),
        )
        .unwrap();

    for expected_retry in 1..=2u32 {
        let task = scheduler.schedule_next_task().unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.status, TaskStatus::Running);

        clock.advance_ms(100);
        let report = scheduler.tick();
        assert_eq!(report.retried, vec![id]);

        let task = scheduler.get_task(id).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, expected_retry);
        assert_eq!(task.status_reason.as_deref(), Some("timeout"));
        assert_eq!(task.last_error, Some(TaskFailure::Timeout { timeout_ms: 100 }));

        // Not eligible until the backoff elapses.
        assert!(scheduler.schedule_next_task().is_none());
        let backoff = 1000 * 2i64.pow(expected_retry);
        clock.advance_ms(backoff);
    }

    scheduler.schedule_next_task().unwrap();
    clock.advance_ms(100);
    let report = scheduler.tick();
    assert_eq!(report.failed, vec![id]);

    let task = scheduler.get_task(id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.status_reason.as_deref(), Some("retries_exhausted"));
    assert_eq!(scheduler.running_count(), 0);
    assert_eq!(scheduler.next_deadline(), None);
}

#[test]
fn test_never_completed_task_retries_once_then_fails() {
    let (mut scheduler, clock) = default_scheduler();
    let mut events = scheduler.subscribe();
    let a = scheduler
        .submit(
            TaskSubmission::new("A")
                .with_max_retries(1)
                .with_execution_timeout_ms(10),
        )
        .unwrap();

    // Poll like a host loop would, advancing to each deadline.
    let mut dispatches = 0;
    for _ in 0..10 {
        if scheduler.schedule_next_task().is_some() {
            dispatches += 1;
        }
        match scheduler.next_deadline() {
            Some(deadline) => clock.set(deadline),
            None => break,
        }
        scheduler.tick();
    }

    assert_eq!(dispatches, 2);
    let task = scheduler.get_task(a).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.status_reason.as_deref(), Some("retries_exhausted"));

    let mut retries = 0;
    let mut failures = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            TaskEvent::RetryScheduled { .. } => retries += 1,
            TaskEvent::TaskFailed { .. } => failures += 1,
            _ => {}
        }
    }
    assert_eq!((retries, failures), (1, 1));
}

#[test]
fn test_dependent_never_scheduled_before_prerequisite_completes() {
    let (mut scheduler, clock) = default_scheduler();
    let a = scheduler
        .submit(TaskSubmission::new("A").with_user_priority(1.0))
        .unwrap();
    let b = scheduler
        .submit(
            TaskSubmission::new("B")
                .with_user_priority(10.0)
                .with_dependencies(vec![a]),
        )
        .unwrap();
    assert_eq!(scheduler.get_task(b).unwrap().status, TaskStatus::Pending);

    assert_eq!(scheduler.schedule_next_task().unwrap().id, a);
    for _ in 0..5 {
        clock.advance_ms(1000);
        assert!(scheduler.schedule_next_task().is_none());
    }

    scheduler
        .report_completion(a, serde_json::json!({"ok": true}))
        .unwrap();
    assert_eq!(scheduler.get_task(b).unwrap().status, TaskStatus::Ready);
    assert!(scheduler.is_dependency_ready(b));
    assert_eq!(scheduler.schedule_next_task().unwrap().id, b);
}

#[test]
fn test_failed_prerequisite_leaves_dependent_pending() {
    let (mut scheduler, _) = default_scheduler();
    let a = scheduler
        .submit(TaskSubmission::new("A").with_max_retries(0))
        .unwrap();
    let b = scheduler
        .submit(TaskSubmission::new("B").with_dependencies(vec![a]))
        .unwrap();

    scheduler.schedule_next_task().unwrap();
    scheduler.report_error(a, "model unavailable").unwrap();

    assert_eq!(scheduler.get_task(a).unwrap().status, TaskStatus::Failed);
    assert_eq!(scheduler.get_task(b).unwrap().status, TaskStatus::Pending);
    assert!(scheduler.schedule_next_task().is_none());
}

#[test]
fn test_concurrency_cap_of_one() {
    let config = SchedulerConfig {
        max_concurrent_tasks: 1,
        ..Default::default()
    };
    let (mut scheduler, _) = scheduler_with(config);
    let first = scheduler.submit(TaskSubmission::new("first")).unwrap();
    scheduler.submit(TaskSubmission::new("second")).unwrap();

    assert_eq!(scheduler.schedule_next_task().unwrap().id, first);
    assert!(scheduler.schedule_next_task().is_none());
    assert_eq!(scheduler.list_by_status(TaskStatus::Ready).len(), 1);

    scheduler
        .report_completion(first, serde_json::json!(null))
        .unwrap();
    assert!(scheduler.schedule_next_task().is_some());
}

#[test]
fn test_cancel_frees_concurrency_slot() {
    let config = SchedulerConfig {
        max_concurrent_tasks: 1,
        ..Default::default()
    };
    let (mut scheduler, _) = scheduler_with(config);
    let first = scheduler.submit(TaskSubmission::new("first")).unwrap();
    let second = scheduler.submit(TaskSubmission::new("second")).unwrap();

    scheduler.schedule_next_task().unwrap();
    scheduler
        .report_failure(first, TaskFailure::Cancelled)
        .unwrap();

    assert_eq!(
        scheduler.get_task(first).unwrap().status_reason.as_deref(),
        Some("cancelled")
    );
    assert_eq!(scheduler.schedule_next_task().unwrap().id, second);
}

#[test]
fn test_age_changes_selection_over_time() {
    let (mut scheduler, clock) = default_scheduler();

    let old = scheduler
        .submit(TaskSubmission::new("old, low priority").with_user_priority(5.0))
        .unwrap();
    clock.advance(Duration::minutes(3));
    let fresh = scheduler
        .submit(TaskSubmission::new("fresh, higher priority").with_user_priority(6.0))
        .unwrap();

    // 3 minutes of age (bonus 4.5) does not make up a 10 point gap.
    assert!(scheduler.explain(fresh).unwrap().total > scheduler.explain(old).unwrap().total);

    // The gap in age bonus keeps widening; after 10 more minutes the old task leads.
    clock.advance(Duration::minutes(10));
    assert!(scheduler.explain(old).unwrap().total > scheduler.explain(fresh).unwrap().total);
    assert_eq!(scheduler.schedule_next_task().unwrap().id, old);
}

#[test]
fn test_system_critical_outranks_everything() {
    let (mut scheduler, clock) = default_scheduler();
    scheduler
        .submit(
            TaskSubmission::new("important")
                .with_user_priority(10.0)
                .with_urgency(10.0),
        )
        .unwrap();
    clock.advance(Duration::hours(2));
    let critical = scheduler
        .submit(
            TaskSubmission::new("critical")
                .with_user_priority(0.0)
                .with_resource_cost(10.0)
                .system_critical(),
        )
        .unwrap();

    assert_eq!(scheduler.schedule_next_task().unwrap().id, critical);
}

#[test]
fn test_oversized_timeout_message_rejected_without_panic() {
    let (mut scheduler, _) = default_scheduler();
    let message = cogloop::SubmissionMessage::from_value(serde_json::json!({
        "query": "q",
        "executionTimeout": 10_000_000_000_000_000u64
    }))
    .unwrap();

    let submission = message.into_submission().unwrap();
    assert!(matches!(
        scheduler.submit(submission),
        Err(SchedulerError::Validation(_))
    ));
    assert!(scheduler.schedule_next_task().is_none());
}
