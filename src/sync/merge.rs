//! Field-level auto-merge engine.
//!
//! Applies a fixed table of per-field strategies to two concurrent
//! change sets, producing either a fully merged payload or a partial
//! merge plus explicit per-field conflicts for user resolution.
//!
//! The strategy mapping is a static table matched over a tagged enum —
//! not a polymorphism hierarchy. Adding a strategy is a protocol bump
//! and is deliberately friction-heavy.

use crate::model::{remove_path, set_path, ClusterMembership};
use crate::sync::changeset::{ChangeSet, FieldChange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── Strategy table ──────────────────────────────────────────────

/// Named reconciliation rule for two new values of the same field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Later adjusted timestamp wins; tie → local.
    LatestWins,
    /// Numeric maximum.
    Max,
    /// Numeric minimum.
    Min,
    /// Arithmetic mean of the two values.
    Average,
    /// Delta-based counter addition.
    Sum,
    /// Set union, deduplicated by value equality.
    Union,
    /// Per-cluster max strength; `pinned` is OR.
    MergeMemberships,
    /// Lexicographic compare of ISO-8601 strings; later wins.
    MaxTimestamp,
    /// Never auto-reconciled; always an unresolved entry.
    Conflict,
}

impl MergeStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            MergeStrategy::LatestWins => "latest_wins",
            MergeStrategy::Max => "max",
            MergeStrategy::Min => "min",
            MergeStrategy::Average => "average",
            MergeStrategy::Sum => "sum",
            MergeStrategy::Union => "union",
            MergeStrategy::MergeMemberships => "merge_memberships",
            MergeStrategy::MaxTimestamp => "max_timestamp",
            MergeStrategy::Conflict => "conflict",
        }
    }
}

/// The fixed field → strategy table. Unknown fields fall back to
/// `latest_wins` so future protocol fields merge safely.
pub fn strategy_for(field: &str) -> MergeStrategy {
    match field {
        "content.body" => MergeStrategy::Conflict,
        "content.title" | "content.summary" | "state.lifecycle" => MergeStrategy::LatestWins,
        "organization.tags" | "state.flags" => MergeStrategy::Union,
        "organization.cluster_memberships" => MergeStrategy::MergeMemberships,
        "neural.stability" | "neural.retrievability" | "neural.importance" => MergeStrategy::Max,
        "neural.difficulty" => MergeStrategy::Average,
        "temporal.access_count" => MergeStrategy::Sum,
        "temporal.last_accessed" => MergeStrategy::MaxTimestamp,
        _ => MergeStrategy::LatestWins,
    }
}

// ── Merge outcome ───────────────────────────────────────────────

/// One field both sides changed in ways the strategy cannot reconcile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_value: Option<Value>,
    pub local_ts: DateTime<Utc>,
    pub remote_ts: DateTime<Utc>,
}

/// Result status of an auto-merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    Merged,
    Conflict,
}

/// Outcome of merging two concurrent change sets.
///
/// On conflict the payload is still partially merged — every
/// non-conflicting field has already been applied.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub status: MergeStatus,
    pub merged: Value,
    pub conflicts: Vec<FieldConflict>,
}

// ── Engine ──────────────────────────────────────────────────────

/// Merge a remote change set into the local state.
///
/// `local_payload` is the node's current local payload (the pre-local
/// base with the local change set already applied). Remote-only fields
/// apply directly; doubly-changed fields go through the strategy table.
pub fn auto_merge(
    local_payload: &Value,
    local_changes: &ChangeSet,
    remote_changes: &ChangeSet,
) -> MergeOutcome {
    let mut merged = local_payload.clone();
    let mut conflicts = Vec::new();

    let local_ts = local_changes.timestamp;
    let remote_ts = remote_changes.timestamp;

    for rc in &remote_changes.changes {
        match local_changes.change_for(&rc.field) {
            // Only the remote touched this field — take it as-is.
            None => write_field(&mut merged, &rc.field, rc.new_value.clone()),

            Some(lc) => {
                let strategy = strategy_for(&rc.field);
                match apply_strategy(strategy, &rc.field, lc, rc, local_ts, remote_ts) {
                    StrategyResult::Resolved(value) => write_field(&mut merged, &rc.field, value),
                    StrategyResult::KeepLocal => {}
                    StrategyResult::Conflict => conflicts.push(FieldConflict {
                        field: rc.field.clone(),
                        local_value: lc.new_value.clone(),
                        remote_value: rc.new_value.clone(),
                        local_ts,
                        remote_ts,
                    }),
                }
            }
        }
    }

    let status = if conflicts.is_empty() {
        MergeStatus::Merged
    } else {
        MergeStatus::Conflict
    };

    MergeOutcome {
        status,
        merged,
        conflicts,
    }
}

fn write_field(payload: &mut Value, field: &str, value: Option<Value>) {
    match value {
        Some(v) => set_path(payload, field, v),
        None => remove_path(payload, field),
    }
}

enum StrategyResult {
    /// Write this value (absent removes the field).
    Resolved(Option<Value>),
    /// Degraded: the local value stands.
    KeepLocal,
    /// Hand the field to the user.
    Conflict,
}

fn apply_strategy(
    strategy: MergeStrategy,
    field: &str,
    lc: &FieldChange,
    rc: &FieldChange,
    local_ts: DateTime<Utc>,
    remote_ts: DateTime<Utc>,
) -> StrategyResult {
    match strategy {
        MergeStrategy::Conflict => StrategyResult::Conflict,

        MergeStrategy::LatestWins => {
            if remote_ts > local_ts {
                StrategyResult::Resolved(rc.new_value.clone())
            } else {
                StrategyResult::Resolved(lc.new_value.clone())
            }
        }

        MergeStrategy::Max | MergeStrategy::Min => {
            match (as_number(&lc.new_value), as_number(&rc.new_value)) {
                (Some(l), Some(r)) => {
                    let take_remote = match strategy {
                        MergeStrategy::Max => r > l,
                        _ => r < l,
                    };
                    let side = if take_remote { rc } else { lc };
                    StrategyResult::Resolved(side.new_value.clone())
                }
                _ => degrade(field, strategy),
            }
        }

        MergeStrategy::Average => {
            match (as_number(&lc.new_value), as_number(&rc.new_value)) {
                (Some(l), Some(r)) => StrategyResult::Resolved(number_value((l + r) / 2.0)),
                _ => degrade(field, strategy),
            }
        }

        MergeStrategy::Sum => merge_sum(field, lc, rc),

        MergeStrategy::Union => {
            let local_items = as_array(&lc.new_value);
            let remote_items = as_array(&rc.new_value);
            let mut out = local_items;
            for item in remote_items {
                if !out.contains(&item) {
                    out.push(item);
                }
            }
            StrategyResult::Resolved(Some(Value::Array(out)))
        }

        MergeStrategy::MergeMemberships => merge_memberships(field, lc, rc),

        MergeStrategy::MaxTimestamp => {
            match (lc.new_value.as_ref(), rc.new_value.as_ref()) {
                (Some(Value::String(l)), Some(Value::String(r))) => {
                    // ISO-8601 instants compare lexicographically
                    let winner = if r > l { rc } else { lc };
                    StrategyResult::Resolved(winner.new_value.clone())
                }
                _ => degrade(field, strategy),
            }
        }
    }
}

/// Delta-based counter addition.
///
/// `result = base + (local_new − local_old) + (remote_new − remote_old)`.
/// Absolute summation would double-count the shared base, so the old
/// values are load-bearing; when either is missing the merge degrades
/// to `local_new + remote_new` and logs.
fn merge_sum(field: &str, lc: &FieldChange, rc: &FieldChange) -> StrategyResult {
    let local_new = as_number(&lc.new_value);
    let remote_new = as_number(&rc.new_value);

    let (Some(local_new), Some(remote_new)) = (local_new, remote_new) else {
        return degrade(field, MergeStrategy::Sum);
    };

    match (as_number(&lc.old_value), as_number(&rc.old_value)) {
        (Some(local_old), Some(remote_old)) => {
            let base = local_old;
            let result = base + (local_new - local_old) + (remote_new - remote_old);
            StrategyResult::Resolved(number_value(result))
        }
        _ => {
            tracing::warn!(
                field,
                "Degraded sum merge: base value missing, falling back to absolute addition"
            );
            StrategyResult::Resolved(number_value(local_new + remote_new))
        }
    }
}

/// Keyed by `cluster_id`; overlapping keys take max strength and OR
/// the pinned flag. Local ordering is preserved, unseen remote
/// clusters append in remote order.
fn merge_memberships(field: &str, lc: &FieldChange, rc: &FieldChange) -> StrategyResult {
    let parse = |value: &Option<Value>| -> Option<Vec<ClusterMembership>> {
        match value {
            None => Some(Vec::new()),
            Some(v) => serde_json::from_value(v.clone()).ok(),
        }
    };

    let (Some(local), Some(remote)) = (parse(&lc.new_value), parse(&rc.new_value)) else {
        return degrade(field, MergeStrategy::MergeMemberships);
    };

    let mut out = local;
    for membership in remote {
        match out.iter_mut().find(|m| m.cluster_id == membership.cluster_id) {
            Some(existing) => {
                existing.strength = existing.strength.max(membership.strength);
                existing.pinned = existing.pinned || membership.pinned;
            }
            None => out.push(membership),
        }
    }

    match serde_json::to_value(out) {
        Ok(value) => StrategyResult::Resolved(Some(value)),
        Err(_) => degrade(field, MergeStrategy::MergeMemberships),
    }
}

fn degrade(field: &str, strategy: MergeStrategy) -> StrategyResult {
    tracing::warn!(
        field,
        strategy = strategy.name(),
        "Strategy type mismatch, keeping local value"
    );
    StrategyResult::KeepLocal
}

fn as_number(value: &Option<Value>) -> Option<f64> {
    value.as_ref().and_then(Value::as_f64)
}

fn as_array(value: &Option<Value>) -> Vec<Value> {
    match value {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    }
}

/// Re-serialize a numeric result, keeping integers integral.
fn number_value(n: f64) -> Option<Value> {
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        Some(Value::from(n as i64))
    } else {
        Some(Value::from(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::changeset::compute_change_set;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_760_000_000 + secs, 0).unwrap()
    }

    fn change_set(device: &str, at: DateTime<Utc>, base: &Value, current: &Value) -> ChangeSet {
        compute_change_set(Some(base), current, "node-1", device, at)
    }

    #[test]
    fn strategy_table_matches_contract() {
        assert_eq!(strategy_for("content.body"), MergeStrategy::Conflict);
        assert_eq!(strategy_for("content.title"), MergeStrategy::LatestWins);
        assert_eq!(strategy_for("organization.tags"), MergeStrategy::Union);
        assert_eq!(
            strategy_for("organization.cluster_memberships"),
            MergeStrategy::MergeMemberships
        );
        assert_eq!(strategy_for("neural.stability"), MergeStrategy::Max);
        assert_eq!(strategy_for("neural.difficulty"), MergeStrategy::Average);
        assert_eq!(strategy_for("temporal.access_count"), MergeStrategy::Sum);
        assert_eq!(
            strategy_for("temporal.last_accessed"),
            MergeStrategy::MaxTimestamp
        );
        // Unknown fields fall back to latest_wins
        assert_eq!(strategy_for("future.field"), MergeStrategy::LatestWins);
    }

    #[test]
    fn remote_only_field_applies_without_conflict() {
        let base = json!({"content": {"title": "t"}});
        let local = json!({"content": {"title": "t2"}});
        let remote = json!({"content": {"title": "t"}, "state": {"lifecycle": "archived"}});

        let lc = change_set("ios-a", ts(0), &base, &local);
        let rc = change_set("mac-b", ts(1), &base, &remote);

        let outcome = auto_merge(&local, &lc, &rc);
        assert_eq!(outcome.status, MergeStatus::Merged);
        assert_eq!(
            outcome.merged.pointer("/state/lifecycle"),
            Some(&json!("archived"))
        );
        // Local-only edit survives
        assert_eq!(outcome.merged.pointer("/content/title"), Some(&json!("t2")));
    }

    #[test]
    fn concurrent_tag_edits_take_the_union() {
        let base = json!({"organization": {"tags": ["x"]}});
        let local = json!({"organization": {"tags": ["x", "y"]}});
        let remote = json!({"organization": {"tags": ["x", "z"]}});

        let lc = change_set("ios-a", ts(0), &base, &local);
        let rc = change_set("mac-b", ts(1), &base, &remote);

        let outcome = auto_merge(&local, &lc, &rc);
        assert_eq!(outcome.status, MergeStatus::Merged);
        assert_eq!(
            outcome.merged.pointer("/organization/tags"),
            Some(&json!(["x", "y", "z"]))
        );
    }

    #[test]
    fn concurrent_body_edits_conflict_with_partial_merge() {
        let base = json!({"content": {"body": "base"}, "temporal": {"access_count": 10}});
        let local = json!({"content": {"body": "local edit"}, "temporal": {"access_count": 11}});
        let remote = json!({"content": {"body": "remote edit"}, "temporal": {"access_count": 11}});

        let lc = change_set("ios-a", ts(0), &base, &local);
        let rc = change_set("mac-b", ts(5), &base, &remote);

        let outcome = auto_merge(&local, &lc, &rc);
        assert_eq!(outcome.status, MergeStatus::Conflict);
        assert_eq!(outcome.conflicts.len(), 1);

        let conflict = &outcome.conflicts[0];
        assert_eq!(conflict.field, "content.body");
        assert_eq!(conflict.local_value, Some(json!("local edit")));
        assert_eq!(conflict.remote_value, Some(json!("remote edit")));

        // Non-conflicting counter still merged: 10 + 1 + 1
        assert_eq!(
            outcome.merged.pointer("/temporal/access_count"),
            Some(&json!(12))
        );
    }

    #[test]
    fn sum_is_delta_based_not_absolute() {
        // base=10, both bump by 1 — absolute addition would say 22
        let base = json!({"temporal": {"access_count": 10}});
        let local = json!({"temporal": {"access_count": 11}});
        let remote = json!({"temporal": {"access_count": 11}});

        let lc = change_set("ios-a", ts(0), &base, &local);
        let rc = change_set("mac-b", ts(1), &base, &remote);

        let outcome = auto_merge(&local, &lc, &rc);
        assert_eq!(
            outcome.merged.pointer("/temporal/access_count"),
            Some(&json!(12))
        );
    }

    #[test]
    fn sum_delta_law_holds_for_arbitrary_deltas() {
        for (x, y) in [(3i64, 7i64), (0, 5), (-2, 9)] {
            let base = json!({"temporal": {"access_count": 10}});
            let local = json!({"temporal": {"access_count": 10 + x}});
            let remote = json!({"temporal": {"access_count": 10 + y}});

            let lc = change_set("ios-a", ts(0), &base, &local);
            let rc = change_set("mac-b", ts(1), &base, &remote);

            let outcome = auto_merge(&local, &lc, &rc);
            assert_eq!(
                outcome.merged.pointer("/temporal/access_count"),
                Some(&json!(10 + x + y)),
                "x={x} y={y}"
            );
        }
    }

    #[test]
    fn sum_without_base_degrades_to_absolute() {
        let lc = ChangeSet {
            node_id: "n".into(),
            device_id: "ios-a".into(),
            timestamp: ts(0),
            changes: vec![FieldChange {
                field: "temporal.access_count".into(),
                old_value: None,
                new_value: Some(json!(4)),
            }],
        };
        let rc = ChangeSet {
            node_id: "n".into(),
            device_id: "mac-b".into(),
            timestamp: ts(1),
            changes: vec![FieldChange {
                field: "temporal.access_count".into(),
                old_value: None,
                new_value: Some(json!(3)),
            }],
        };

        let outcome = auto_merge(&json!({"temporal": {"access_count": 4}}), &lc, &rc);
        assert_eq!(
            outcome.merged.pointer("/temporal/access_count"),
            Some(&json!(7))
        );
    }

    #[test]
    fn latest_wins_takes_later_timestamp_tie_goes_local() {
        let base = json!({"content": {"title": "base"}});
        let local = json!({"content": {"title": "local"}});
        let remote = json!({"content": {"title": "remote"}});

        let lc = change_set("ios-a", ts(10), &base, &local);
        let rc_later = change_set("mac-b", ts(20), &base, &remote);
        let outcome = auto_merge(&local, &lc, &rc_later);
        assert_eq!(
            outcome.merged.pointer("/content/title"),
            Some(&json!("remote"))
        );

        let rc_tie = change_set("mac-b", ts(10), &base, &remote);
        let outcome = auto_merge(&local, &lc, &rc_tie);
        assert_eq!(
            outcome.merged.pointer("/content/title"),
            Some(&json!("local"))
        );
    }

    #[test]
    fn max_takes_numeric_extremum() {
        let base = json!({"neural": {"stability": 0.5}});
        let local = json!({"neural": {"stability": 0.7}});
        let remote = json!({"neural": {"stability": 0.9}});

        let lc = change_set("ios-a", ts(0), &base, &local);
        let rc = change_set("mac-b", ts(1), &base, &remote);

        let outcome = auto_merge(&local, &lc, &rc);
        assert_eq!(
            outcome.merged.pointer("/neural/stability"),
            Some(&json!(0.9))
        );
    }

    #[test]
    fn max_non_numeric_degrades_to_local() {
        let lc = ChangeSet {
            node_id: "n".into(),
            device_id: "ios-a".into(),
            timestamp: ts(0),
            changes: vec![FieldChange {
                field: "neural.stability".into(),
                old_value: None,
                new_value: Some(json!(0.4)),
            }],
        };
        let rc = ChangeSet {
            node_id: "n".into(),
            device_id: "mac-b".into(),
            timestamp: ts(1),
            changes: vec![FieldChange {
                field: "neural.stability".into(),
                old_value: None,
                new_value: Some(json!("not a number")),
            }],
        };

        let local_payload = json!({"neural": {"stability": 0.4}});
        let outcome = auto_merge(&local_payload, &lc, &rc);
        assert_eq!(outcome.status, MergeStatus::Merged);
        assert_eq!(
            outcome.merged.pointer("/neural/stability"),
            Some(&json!(0.4))
        );
    }

    #[test]
    fn average_takes_arithmetic_mean() {
        let base = json!({"neural": {"difficulty": 0.5}});
        let local = json!({"neural": {"difficulty": 0.4}});
        let remote = json!({"neural": {"difficulty": 0.8}});

        let lc = change_set("ios-a", ts(0), &base, &local);
        let rc = change_set("mac-b", ts(1), &base, &remote);

        let outcome = auto_merge(&local, &lc, &rc);
        let merged = outcome
            .merged
            .pointer("/neural/difficulty")
            .and_then(Value::as_f64)
            .unwrap();
        assert!((merged - 0.6).abs() < 1e-9);
    }

    #[test]
    fn memberships_merge_by_cluster_with_max_strength_and_or_pinned() {
        let base = json!({"organization": {"cluster_memberships": [
            {"cluster_id": "c1", "strength": 0.5, "pinned": false},
        ]}});
        let local = json!({"organization": {"cluster_memberships": [
            {"cluster_id": "c1", "strength": 0.6, "pinned": true},
        ]}});
        let remote = json!({"organization": {"cluster_memberships": [
            {"cluster_id": "c1", "strength": 0.9, "pinned": false},
            {"cluster_id": "c2", "strength": 0.3, "pinned": false},
        ]}});

        let lc = change_set("ios-a", ts(0), &base, &local);
        let rc = change_set("mac-b", ts(1), &base, &remote);

        let outcome = auto_merge(&local, &lc, &rc);
        let memberships: Vec<ClusterMembership> = serde_json::from_value(
            outcome
                .merged
                .pointer("/organization/cluster_memberships")
                .unwrap()
                .clone(),
        )
        .unwrap();

        assert_eq!(memberships.len(), 2);
        let c1 = memberships.iter().find(|m| m.cluster_id == "c1").unwrap();
        assert!((c1.strength - 0.9).abs() < 1e-9);
        assert!(c1.pinned); // OR of (true, false)
    }

    #[test]
    fn max_timestamp_compares_lexicographically() {
        let base = json!({"temporal": {"last_accessed": "2026-01-01T00:00:00Z"}});
        let local = json!({"temporal": {"last_accessed": "2026-01-03T08:00:00Z"}});
        let remote = json!({"temporal": {"last_accessed": "2026-01-05T12:30:00Z"}});

        let lc = change_set("ios-a", ts(0), &base, &local);
        let rc = change_set("mac-b", ts(1), &base, &remote);

        let outcome = auto_merge(&local, &lc, &rc);
        assert_eq!(
            outcome.merged.pointer("/temporal/last_accessed"),
            Some(&json!("2026-01-05T12:30:00Z"))
        );
    }

    #[test]
    fn merge_is_symmetric_on_non_conflict_fields() {
        let base = json!({
            "organization": {"tags": ["x"]},
            "neural": {"stability": 0.5},
            "temporal": {"access_count": 10},
        });
        let side_a = json!({
            "organization": {"tags": ["x", "y"]},
            "neural": {"stability": 0.7},
            "temporal": {"access_count": 12},
        });
        let side_b = json!({
            "organization": {"tags": ["x", "z"]},
            "neural": {"stability": 0.6},
            "temporal": {"access_count": 11},
        });

        let cs_a = change_set("ios-a", ts(0), &base, &side_a);
        let cs_b = change_set("mac-b", ts(1), &base, &side_b);

        let ab = auto_merge(&side_a, &cs_a, &cs_b);
        let ba = auto_merge(&side_b, &cs_b, &cs_a);

        // Numeric results identical either way
        assert_eq!(
            ab.merged.pointer("/neural/stability"),
            ba.merged.pointer("/neural/stability")
        );
        assert_eq!(
            ab.merged.pointer("/temporal/access_count"),
            ba.merged.pointer("/temporal/access_count")
        );
        assert_eq!(
            ab.merged.pointer("/temporal/access_count"),
            Some(&json!(13)) // 10 + 2 + 1
        );

        // Union results equal as sets
        let tags = |v: &Value| -> std::collections::HashSet<String> {
            v.pointer("/organization/tags")
                .and_then(Value::as_array)
                .unwrap()
                .iter()
                .map(|t| t.as_str().unwrap().to_string())
                .collect()
        };
        assert_eq!(tags(&ab.merged), tags(&ba.merged));
    }

    #[test]
    fn conflict_sets_match_modulo_side_labels() {
        let base = json!({"content": {"body": "base"}});
        let side_a = json!({"content": {"body": "A"}});
        let side_b = json!({"content": {"body": "B"}});

        let cs_a = change_set("ios-a", ts(0), &base, &side_a);
        let cs_b = change_set("mac-b", ts(1), &base, &side_b);

        let ab = auto_merge(&side_a, &cs_a, &cs_b);
        let ba = auto_merge(&side_b, &cs_b, &cs_a);

        assert_eq!(ab.conflicts.len(), 1);
        assert_eq!(ba.conflicts.len(), 1);
        assert_eq!(ab.conflicts[0].field, ba.conflicts[0].field);
        assert_eq!(ab.conflicts[0].local_value, ba.conflicts[0].remote_value);
        assert_eq!(ab.conflicts[0].remote_value, ba.conflicts[0].local_value);
    }
}
