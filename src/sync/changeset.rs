//! Change-set builder.
//!
//! Diffs a node's last-synced snapshot against its current payload
//! into typed field changes. The diff is always computed against the
//! snapshot — never against the live state of a peer — and carries the
//! base value for every changed field so delta-based merge strategies
//! (counters) stay correct.

use crate::model::{deep_equal, get_path, remove_path, set_path, SYNCABLE_FIELDS};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One field-level change: the base value at the diff site and the
/// current value. An absent value means the field did not exist —
/// distinct from an explicit `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub old_value: Option<Value>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub new_value: Option<Value>,
}

/// Deserialize a present field as `Some`, even when its value is JSON
/// `null` — key absence is the only way to get `None`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// A node's pending changes relative to its last-synced snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub node_id: String,
    pub device_id: String,
    /// Drift-adjusted local wall clock at diff time. Ordering input
    /// for `latest_wins` / `max_timestamp` merges.
    pub timestamp: DateTime<Utc>,
    pub changes: Vec<FieldChange>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Look up the change for a field path, if any.
    pub fn change_for(&self, field: &str) -> Option<&FieldChange> {
        self.changes.iter().find(|c| c.field == field)
    }
}

/// Diff `base` (absent for a newly created node) against `current`.
///
/// Exactly the syncable fields whose deep-equal comparison differs are
/// emitted, in the closed set's declaration order.
pub fn compute_change_set(
    base: Option<&Value>,
    current: &Value,
    node_id: &str,
    device_id: &str,
    timestamp: DateTime<Utc>,
) -> ChangeSet {
    let mut changes = Vec::new();

    for field in SYNCABLE_FIELDS {
        let old = base.and_then(|b| get_path(b, field));
        let new = get_path(current, field);

        if !deep_equal(old, new) {
            changes.push(FieldChange {
                field: field.to_string(),
                old_value: old.cloned(),
                new_value: new.cloned(),
            });
        }
    }

    ChangeSet {
        node_id: node_id.to_string(),
        device_id: device_id.to_string(),
        timestamp,
        changes,
    }
}

/// Apply a change set's new values on top of a base payload.
///
/// Satisfies `apply(compute(base, current), base) == current` over the
/// syncable paths. An absent `new_value` removes the field.
pub fn apply_change_set(base: &Value, change_set: &ChangeSet) -> Value {
    let mut out = base.clone();
    for change in &change_set.changes {
        match &change.new_value {
            Some(value) => set_path(&mut out, &change.field, value.clone()),
            None => remove_path(&mut out, &change.field),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn diff(base: Option<&Value>, current: &Value) -> ChangeSet {
        compute_change_set(base, current, "node-1", "ios-abcdef123456", Utc::now())
    }

    #[test]
    fn diff_emits_only_changed_fields() {
        let base = json!({
            "content": {"title": "Trip", "body": "Old body"},
            "temporal": {"access_count": 4},
        });
        let current = json!({
            "content": {"title": "Trip", "body": "New body"},
            "temporal": {"access_count": 5},
        });

        let cs = diff(Some(&base), &current);
        assert_eq!(cs.changes.len(), 2);

        let body = cs.change_for("content.body").unwrap();
        assert_eq!(body.old_value, Some(json!("Old body")));
        assert_eq!(body.new_value, Some(json!("New body")));

        let count = cs.change_for("temporal.access_count").unwrap();
        assert_eq!(count.old_value, Some(json!(4)));
        assert_eq!(count.new_value, Some(json!(5)));
    }

    #[test]
    fn diff_without_base_treats_every_present_field_as_new() {
        let current = json!({
            "content": {"title": "Fresh"},
            "organization": {"tags": ["a"]},
        });

        let cs = diff(None, &current);
        assert_eq!(cs.changes.len(), 2);
        for change in &cs.changes {
            assert!(change.old_value.is_none());
        }
    }

    #[test]
    fn diff_missing_intermediates_never_panics() {
        let base = json!({});
        let current = json!({"neural": {"stability": 0.7}});

        let cs = diff(Some(&base), &current);
        assert_eq!(cs.changes.len(), 1);
        assert_eq!(cs.changes[0].field, "neural.stability");
    }

    #[test]
    fn diff_field_removal_has_absent_new_value() {
        let base = json!({"content": {"summary": "short"}});
        let current = json!({"content": {}});

        let cs = diff(Some(&base), &current);
        let change = cs.change_for("content.summary").unwrap();
        assert_eq!(change.old_value, Some(json!("short")));
        assert!(change.new_value.is_none());
    }

    #[test]
    fn diff_distinguishes_null_from_absent() {
        let base = json!({"content": {}});
        let current = json!({"content": {"summary": null}});

        let cs = diff(Some(&base), &current);
        let change = cs.change_for("content.summary").unwrap();
        assert!(change.old_value.is_none());
        assert_eq!(change.new_value, Some(Value::Null));
    }

    #[test]
    fn diff_ignores_non_syncable_fields() {
        let base = json!({"derived": {"embedding": [1, 2]}});
        let current = json!({"derived": {"embedding": [3, 4]}});

        let cs = diff(Some(&base), &current);
        assert!(cs.is_empty());
    }

    #[test]
    fn apply_round_trips_the_diff() {
        let base = json!({
            "content": {"title": "A", "body": "one"},
            "organization": {"tags": ["x"]},
            "temporal": {"access_count": 1},
        });
        let current = json!({
            "content": {"title": "B"},
            "organization": {"tags": ["x", "y"]},
            "temporal": {"access_count": 2, "last_accessed": "2026-01-05T10:00:00Z"},
            "state": {"lifecycle": "active"},
        });

        let cs = diff(Some(&base), &current);
        let rebuilt = apply_change_set(&base, &cs);

        for field in SYNCABLE_FIELDS {
            assert!(
                deep_equal(get_path(&rebuilt, field), get_path(&current, field)),
                "field {field} did not round-trip"
            );
        }
    }

    #[test]
    fn change_serde_preserves_null_versus_absent() {
        let change = FieldChange {
            field: "content.summary".into(),
            old_value: None,
            new_value: Some(Value::Null),
        };

        let json = serde_json::to_string(&change).unwrap();
        // Absent old_value must not appear as a key
        assert!(!json.contains("old_value"));

        let back: FieldChange = serde_json::from_str(&json).unwrap();
        assert!(back.old_value.is_none());
        assert_eq!(back.new_value, Some(Value::Null));
    }

    #[test]
    fn identical_payloads_produce_empty_change_set() {
        let payload = json!({"content": {"title": "same"}});
        let cs = diff(Some(&payload), &payload);
        assert!(cs.is_empty());
    }
}
