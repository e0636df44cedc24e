//! Status management utilities.
//!
//! Provides helpers for building and updating resource status conditions.

use crate::crd::{Condition, ConditionType};

/// Builder for managing conditions list
///
/// Starts from the conditions currently stored on a resource. Setting a
/// condition that already exists with the same status keeps its original
/// transition time, so rebuilding unchanged conditions yields an identical
/// list.
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
}

impl ConditionBuilder {
    /// Create a new condition builder
    pub fn new() -> Self {
        Self {
            conditions: Vec::new(),
        }
    }

    /// Start from existing conditions
    pub fn from_existing(conditions: &[Condition]) -> Self {
        Self {
            conditions: conditions.to_vec(),
        }
    }

    /// Add or update a condition
    pub fn set(&mut self, mut condition: Condition) -> &mut Self {
        // Find and replace existing condition of same type
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
        self
    }

    /// Set Ready condition
    pub fn ready(
        &mut self,
        ready: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::ready(ready, reason, message, generation))
    }

    /// Set WellFormed condition
    pub fn well_formed(
        &mut self,
        formed: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::well_formed(formed, reason, message, generation))
    }

    /// Set a condition of any type
    pub fn condition(
        &mut self,
        condition_type: ConditionType,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::new(condition_type, status, reason, message, generation))
    }

    /// Drop a condition type entirely
    pub fn remove(&mut self, condition_type: ConditionType) -> &mut Self {
        let name = condition_type.to_string();
        self.conditions.retain(|c| c.r#type != name);
        self
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

impl Default for ConditionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if a condition type is true
pub fn is_condition_true(conditions: &[Condition], condition_type: ConditionType) -> bool {
    let name = condition_type.to_string();
    conditions
        .iter()
        .find(|c| c.r#type == name)
        .is_some_and(|c| c.status == "True")
}

/// Get the reason for a condition
pub fn get_condition_reason(conditions: &[Condition], condition_type: ConditionType) -> Option<&str> {
    let name = condition_type.to_string();
    conditions
        .iter()
        .find(|c| c.r#type == name)
        .map(|c| c.reason.as_str())
}
