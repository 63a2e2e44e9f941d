//! Condition bookkeeping shared by every status aggregator

use chrono::{DateTime, SecondsFormat, Utc};

use crate::crd::{Condition, ConditionStatus};

/// Condition types reported by the operator
pub mod condition_types {
    pub const AVAILABLE: &str = "Available";
    pub const PROGRESSING: &str = "Progressing";
    pub const DEGRADED: &str = "Degraded";
    pub const REMOVED: &str = "Removed";
    /// Pruner only: the CronJob will create jobs
    pub const SCHEDULED: &str = "Scheduled";
    /// Pruner only: the most recent prune job failed
    pub const FAILED: &str = "Failed";
}

/// Ordered set of conditions, unique by type
///
/// `now` is supplied by the caller so transitions are reproducible in tests.
/// `last_transition_time` moves only when a condition's status flips; reason
/// and message are updated in place.
#[derive(Clone, Debug)]
pub struct ConditionSet {
    conditions: Vec<Condition>,
    now: String,
}

impl ConditionSet {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self::from_existing(Vec::new(), now)
    }

    pub fn from_existing(existing: Vec<Condition>, now: DateTime<Utc>) -> Self {
        let mut conditions: Vec<Condition> = Vec::with_capacity(existing.len());
        for condition in existing {
            // keep the first occurrence if the stored status carries duplicates
            if !conditions.iter().any(|c| c.type_ == condition.type_) {
                conditions.push(condition);
            }
        }
        Self {
            conditions,
            now: now.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    /// Set a condition; returns true when anything about it changed
    pub fn set(&mut self, type_: &str, status: ConditionStatus, reason: &str, message: &str) -> bool {
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            let mut changed = false;
            if existing.status != status {
                existing.status = status;
                existing.last_transition_time = self.now.clone();
                changed = true;
            }
            if existing.reason != reason {
                existing.reason = reason.to_string();
                changed = true;
            }
            if existing.message != message {
                existing.message = message.to_string();
                changed = true;
            }
            changed
        } else {
            self.conditions.push(Condition {
                type_: type_.to_string(),
                status,
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: self.now.clone(),
            });
            true
        }
    }

    pub fn set_true(&mut self, type_: &str, reason: &str, message: &str) -> bool {
        self.set(type_, ConditionStatus::True, reason, message)
    }

    pub fn set_false(&mut self, type_: &str, reason: &str, message: &str) -> bool {
        self.set(type_, ConditionStatus::False, reason, message)
    }

    pub fn get(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true(&self, type_: &str) -> bool {
        self.get(type_).is_some_and(|c| c.status.is_true())
    }

    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}
