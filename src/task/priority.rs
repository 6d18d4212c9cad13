use crate::task::types::{PriorityFactors, SchedulerError, Task, TaskId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Weights for the priority score
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoringWeights {
    pub user_priority_weight: f64,
    pub urgency_weight: f64,
    pub resource_weight: f64,
    pub resource_cost_weight: f64,
    /// Bonus per squared minute of age
    pub age_weight: f64,
    pub max_age_bonus: f64,
    pub system_critical_bonus: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            user_priority_weight: 10.0,
            urgency_weight: 8.0,
            resource_weight: 5.0,
            resource_cost_weight: 2.0,
            age_weight: 0.5,
            max_age_bonus: 100.0,
            system_critical_bonus: 10_000.0,
        }
    }
}

impl ScoringWeights {
    /// Every weight must be finite and non-negative
    pub fn validate(&self) -> Result<(), SchedulerError> {
        let named = [
            ("user_priority_weight", self.user_priority_weight),
            ("urgency_weight", self.urgency_weight),
            ("resource_weight", self.resource_weight),
            ("resource_cost_weight", self.resource_cost_weight),
            ("age_weight", self.age_weight),
            ("max_age_bonus", self.max_age_bonus),
            ("system_critical_bonus", self.system_critical_bonus),
        ];
        for (name, value) in named {
            if !value.is_finite() || value < 0.0 {
                return Err(SchedulerError::Validation(format!(
                    "{} must be a finite non-negative number, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    /// Largest possible score gap between two non-critical tasks with clamped factors
    pub fn max_non_critical_spread(&self) -> f64 {
        10.0 * self.user_priority_weight.abs()
            + 10.0 * self.urgency_weight.abs()
            + self.resource_weight.abs()
            + 10.0 * self.resource_cost_weight.abs()
            + 10.0
            + self.max_age_bonus.abs()
    }
}

/// Per-factor contributions to a task's score
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScoreBreakdown {
    pub user_priority: f64,
    pub urgency: f64,
    pub resource: f64,
    pub resource_cost: f64,
    pub inherited: f64,
    pub age: f64,
    pub critical: f64,
    pub total: f64,
}

/// Deterministic, side-effect-free scoring of tasks
#[derive(Clone, Debug, Default)]
pub struct PriorityCalculator {
    weights: ScoringWeights,
}

impl PriorityCalculator {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    pub fn score(&self, task: &Task, now: DateTime<Utc>) -> f64 {
        self.breakdown(task, now).total
    }

    pub fn breakdown(&self, task: &Task, now: DateTime<Utc>) -> ScoreBreakdown {
        self.breakdown_factors(&task.config.priority, now - task.created_at)
    }

    /// Score without the age bonus; used for priority inheritance
    pub fn base_score(&self, factors: &PriorityFactors) -> f64 {
        self.breakdown_factors(factors, Duration::zero()).total
    }

    fn breakdown_factors(&self, factors: &PriorityFactors, age: Duration) -> ScoreBreakdown {
        let w = &self.weights;

        let user_priority = factors.user_priority * w.user_priority_weight;
        let urgency = factors.urgency * w.urgency_weight;
        let resource =
            (1.0 - factors.system_load) * factors.resource_availability * w.resource_weight;
        let resource_cost = -factors.resource_cost * w.resource_cost_weight;
        let inherited = factors.inherited_priority_boost;
        let age = self.age_bonus(age);
        let critical = if factors.is_system_critical {
            w.system_critical_bonus
        } else {
            0.0
        };

        ScoreBreakdown {
            user_priority,
            urgency,
            resource,
            resource_cost,
            inherited,
            age,
            critical,
            total: user_priority + urgency + resource + resource_cost + inherited + age + critical,
        }
    }

    /// Quadratic in minutes waited, capped at `max_age_bonus`.
    ///
    /// Quadratic growth widens the gap between an old and a new task as both wait, so a
    /// starving task eventually overtakes higher-priority newcomers.
    pub fn age_bonus(&self, age: Duration) -> f64 {
        let minutes = (age.num_milliseconds().max(0) as f64) / 60_000.0;
        (self.weights.age_weight * minutes * minutes).min(self.weights.max_age_bonus)
    }
}

/// A ready task with its score at selection time
#[derive(Clone, Debug, PartialEq)]
pub struct RankedTask {
    pub task_id: TaskId,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

impl RankedTask {
    /// Total order: higher score, then earlier `created_at`, then lower id.
    /// `Ordering::Less` means `self` is preferred.
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .total_cmp(&self.score)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.task_id.cmp(&other.task_id))
    }
}
