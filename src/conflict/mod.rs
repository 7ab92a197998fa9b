//! Unresolved conflicts and user notifications.
//!
//! Conflicts the auto-merge engine could not resolve are persisted
//! locally until the user picks a side (or authors a manual merge) or
//! the record expires. Resolution applies the chosen side as a new
//! write — which increments the local vector and dominates both prior
//! versions — and files the losing side into conflict history.
//!
//! Records and history entries both expire 30 days after creation; a
//! periodic pass deletes expired rows.

use crate::sync::merge::FieldConflict;
use crate::sync::vector::VersionVector;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A node with field-level conflicts awaiting user resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnresolvedConflict {
    pub node_id: String,
    pub local_version: VersionVector,
    pub remote_version: VersionVector,
    pub conflicts: Vec<FieldConflict>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UnresolvedConflict {
    /// Build a record expiring after the configured retention window.
    pub fn new(
        node_id: &str,
        local_version: VersionVector,
        remote_version: VersionVector,
        conflicts: Vec<FieldConflict>,
        retention_days: u32,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            node_id: node_id.to_string(),
            local_version,
            remote_version,
            conflicts,
            created_at,
            expires_at: created_at + Duration::days(i64::from(retention_days)),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Who resolved a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolver {
    User,
    Auto,
}

impl Resolver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolver::User => "user",
            Resolver::Auto => "auto",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Resolver::User),
            "auto" => Some(Resolver::Auto),
            _ => None,
        }
    }
}

/// The rejected side of a resolution, kept for 30 days.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictHistoryEntry {
    pub node_id: String,
    pub rejected_version: VersionVector,
    pub resolved_at: DateTime<Utc>,
    pub resolved_by: Resolver,
    pub expires_at: DateTime<Utc>,
}

impl ConflictHistoryEntry {
    pub fn new(
        node_id: &str,
        rejected_version: VersionVector,
        resolved_by: Resolver,
        retention_days: u32,
    ) -> Self {
        let resolved_at = Utc::now();
        Self {
            node_id: node_id.to_string(),
            rejected_version,
            resolved_at,
            resolved_by,
            expires_at: resolved_at + Duration::days(i64::from(retention_days)),
        }
    }
}

// ── Notification state ──────────────────────────────────────────

/// Badge shown on the conflicts surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BadgeState {
    pub count: u64,
    pub visible: bool,
}

impl BadgeState {
    pub fn from_count(count: u64) -> Self {
        Self {
            count,
            visible: count > 0,
        }
    }
}

/// Whether the conflict banner may show.
///
/// Suppressed during the dismiss cooldown (24 h by default), and
/// whenever there is nothing to resolve.
pub fn banner_visible(
    unresolved_count: u64,
    dismissed_at: Option<DateTime<Utc>>,
    cooldown_ms: u64,
    now: DateTime<Utc>,
) -> bool {
    if unresolved_count == 0 {
        return false;
    }
    match dismissed_at {
        None => true,
        Some(at) => now - at >= Duration::milliseconds(cooldown_ms as i64),
    }
}
