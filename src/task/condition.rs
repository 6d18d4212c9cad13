//! Boolean condition trees gating task readiness.
//!
//! Conditions are evaluated against a read-only [`SatisfiedState`] snapshot supplied by the
//! caller (memory topics that finished, labels produced by completed tasks).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};

/// Read-only view of which prerequisite labels are currently satisfied
pub trait SatisfiedState {
    fn is_satisfied(&self, label: &str) -> bool;
}

impl SatisfiedState for HashSet<String> {
    fn is_satisfied(&self, label: &str) -> bool {
        self.contains(label)
    }
}

impl SatisfiedState for BTreeSet<String> {
    fn is_satisfied(&self, label: &str) -> bool {
        self.contains(label)
    }
}

impl SatisfiedState for [&str] {
    fn is_satisfied(&self, label: &str) -> bool {
        self.contains(&label)
    }
}

/// Condition expression tree
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionExpression {
    /// True iff `prerequisite` is in the satisfied set
    Leaf { prerequisite: String },
    And { children: Vec<ConditionExpression> },
    Or { children: Vec<ConditionExpression> },
    Not { child: Box<ConditionExpression> },
    /// True iff at least `k` children hold; `k` defaults to `ceil(children / 2)`
    Threshold {
        children: Vec<ConditionExpression>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        k: Option<i64>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConditionError {
    #[error("threshold k must not be negative (got {0})")]
    NegativeThreshold(i64),

    #[error("threshold k={k} exceeds child count {children}")]
    ThresholdExceedsChildren { k: i64, children: usize },

    #[error("unknown condition type '{0}'")]
    UnknownTag(String),

    #[error("malformed condition: {0}")]
    Malformed(String),
}

impl ConditionExpression {
    pub fn leaf(prerequisite: impl Into<String>) -> Self {
        ConditionExpression::Leaf {
            prerequisite: prerequisite.into(),
        }
    }

    pub fn and(children: Vec<ConditionExpression>) -> Self {
        ConditionExpression::And { children }
    }

    pub fn or(children: Vec<ConditionExpression>) -> Self {
        ConditionExpression::Or { children }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(child: ConditionExpression) -> Self {
        ConditionExpression::Not {
            child: Box::new(child),
        }
    }

    pub fn threshold(children: Vec<ConditionExpression>, k: Option<i64>) -> Self {
        ConditionExpression::Threshold { children, k }
    }

    /// Labels referenced anywhere in the tree
    pub fn prerequisites(&self) -> BTreeSet<&str> {
        let mut labels = BTreeSet::new();
        self.collect_prerequisites(&mut labels);
        labels
    }

    fn collect_prerequisites<'a>(&'a self, labels: &mut BTreeSet<&'a str>) {
        match self {
            ConditionExpression::Leaf { prerequisite } => {
                labels.insert(prerequisite.as_str());
            }
            ConditionExpression::And { children }
            | ConditionExpression::Or { children }
            | ConditionExpression::Threshold { children, .. } => {
                for child in children {
                    child.collect_prerequisites(labels);
                }
            }
            ConditionExpression::Not { child } => child.collect_prerequisites(labels),
        }
    }

    /// Parse a loosely-typed JSON condition record.
    ///
    /// Tags are matched case-insensitively; unknown tags are rejected rather than defaulted.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ConditionError> {
        let object = value
            .as_object()
            .ok_or_else(|| ConditionError::Malformed(format!("expected object, got {}", value)))?;

        let tag = object
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| ConditionError::Malformed("missing 'type' field".to_string()))?;

        let children = || -> Result<Vec<ConditionExpression>, ConditionError> {
            object
                .get("children")
                .and_then(|c| c.as_array())
                .ok_or_else(|| ConditionError::Malformed(format!("'{}' requires 'children'", tag)))?
                .iter()
                .map(ConditionExpression::from_value)
                .collect()
        };

        match tag.to_ascii_lowercase().as_str() {
            "leaf" | "prerequisite" => {
                let prerequisite = object
                    .get("prerequisite")
                    .and_then(|p| p.as_str())
                    .ok_or_else(|| {
                        ConditionError::Malformed("leaf requires 'prerequisite'".to_string())
                    })?;
                Ok(ConditionExpression::leaf(prerequisite))
            }
            "and" => Ok(ConditionExpression::And {
                children: children()?,
            }),
            "or" => Ok(ConditionExpression::Or {
                children: children()?,
            }),
            "not" => {
                let child = object
                    .get("child")
                    .ok_or_else(|| ConditionError::Malformed("not requires 'child'".to_string()))?;
                Ok(ConditionExpression::not(ConditionExpression::from_value(child)?))
            }
            "threshold" => {
                let k = match object.get("k") {
                    None | Some(serde_json::Value::Null) => None,
                    Some(k) => Some(k.as_i64().ok_or_else(|| {
                        ConditionError::Malformed(format!("threshold k must be an integer, got {}", k))
                    })?),
                };
                Ok(ConditionExpression::Threshold {
                    children: children()?,
                    k,
                })
            }
            other => Err(ConditionError::UnknownTag(other.to_string())),
        }
    }
}

/// Pure recursive evaluator for condition trees
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Evaluate `expr` against `satisfied`.
    ///
    /// Empty `And` is true, empty `Or` is false, and a threshold of zero is true.
    /// `And`/`Or` short-circuit, so a malformed subtree after the deciding child is not
    /// reached; use [`ConditionEvaluator::validate`] to check the whole tree.
    pub fn evaluate<S>(expr: &ConditionExpression, satisfied: &S) -> Result<bool, ConditionError>
    where
        S: SatisfiedState + ?Sized,
    {
        match expr {
            ConditionExpression::Leaf { prerequisite } => Ok(satisfied.is_satisfied(prerequisite)),
            ConditionExpression::And { children } => {
                for child in children {
                    if !Self::evaluate(child, satisfied)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            ConditionExpression::Or { children } => {
                for child in children {
                    if Self::evaluate(child, satisfied)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            ConditionExpression::Not { child } => Ok(!Self::evaluate(child, satisfied)?),
            ConditionExpression::Threshold { children, k } => {
                let required = Self::threshold_k(*k, children.len())?;
                let mut count = 0usize;
                for child in children {
                    if count >= required {
                        break;
                    }
                    if Self::evaluate(child, satisfied)? {
                        count += 1;
                    }
                }
                Ok(count >= required)
            }
        }
    }

    /// Check the whole tree for structural errors
    pub fn validate(expr: &ConditionExpression) -> Result<(), ConditionError> {
        match expr {
            ConditionExpression::Leaf { prerequisite } => {
                if prerequisite.trim().is_empty() {
                    return Err(ConditionError::Malformed(
                        "leaf prerequisite must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
            ConditionExpression::And { children } | ConditionExpression::Or { children } => {
                children.iter().try_for_each(Self::validate)
            }
            ConditionExpression::Not { child } => Self::validate(child),
            ConditionExpression::Threshold { children, k } => {
                Self::threshold_k(*k, children.len())?;
                children.iter().try_for_each(Self::validate)
            }
        }
    }

    fn threshold_k(k: Option<i64>, children: usize) -> Result<usize, ConditionError> {
        match k {
            None => Ok(children.div_ceil(2)),
            Some(k) if k < 0 => Err(ConditionError::NegativeThreshold(k)),
            Some(k) if k as u64 > children as u64 => {
                Err(ConditionError::ThresholdExceedsChildren { k, children })
            }
            Some(k) => Ok(k as usize),
        }
    }
}
