//! Status management utilities.
//!
//! Provides helpers for updating BkApp status conditions and computing the
//! merge patch that moves a persisted status to the in-memory one.

use serde_json::{Map, Value};

use crate::crd::{Condition, ConditionStatus, ConditionType};

/// Add or update a condition.
///
/// The transition time of an existing condition is kept when its status
/// does not change. Returns false when nothing changed.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        Some(existing) => {
            if existing.same_state(&condition) {
                return false;
            }
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Look up a condition by type.
pub fn find_condition(conditions: &[Condition], condition_type: ConditionType) -> Option<&Condition> {
    let name = condition_type.to_string();
    conditions.iter().find(|c| c.r#type == name)
}

/// Every condition type reset to `Unknown` with the same reason.
pub fn reset_conditions(reason: &str, message: &str, generation: Option<i64>) -> Vec<Condition> {
    ConditionType::ALL
        .iter()
        .map(|t| Condition::new(*t, ConditionStatus::Unknown, reason, message, generation))
        .collect()
}

/// Compute the RFC 7386 merge patch turning `old` into `new`.
///
/// Returns `None` when the values are equal. Keys missing from `new` are
/// emitted as `null`; arrays and scalars are replaced wholesale.
pub fn merge_patch_diff(old: &Value, new: &Value) -> Option<Value> {
    if old == new {
        return None;
    }
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut patch = Map::new();
            for (key, old_value) in old_map {
                match new_map.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new_value) => {
                        if let Some(diff) = merge_patch_diff(old_value, new_value) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                }
            }
            for (key, new_value) in new_map {
                if !old_map.contains_key(key) {
                    patch.insert(key.clone(), new_value.clone());
                }
            }
            Some(Value::Object(patch))
        }
        _ => Some(new.clone()),
    }
}
