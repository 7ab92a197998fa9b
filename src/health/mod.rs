//! Connectivity health and capability gating.
//!
//! Classifies the device's connectivity into a small state machine
//! and advertises which operations are available per state and
//! privacy tier. The state is a pure function of how long the device
//! has been offline and token validity — engines carry it explicitly
//! so tests can run several side by side.

use crate::model::PrivacyTier;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Offline shorter than this is a short outage.
const SHORT_OFFLINE_HOURS: i64 = 24;

/// Offline shorter than this (but past short) is a medium outage.
const MEDIUM_OFFLINE_HOURS: i64 = 168;

/// EMA weight for new clock-drift samples.
const DRIFT_EMA_WEIGHT: f64 = 0.2;

/// Connectivity classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Online,
    ShortOffline,
    MediumOffline,
    LongOffline,
    ReauthRequired,
}

/// Pure classification from token validity and offline duration.
///
/// A valid access token means the relay is reachable right now; an
/// expired refresh token requires interactive re-authentication
/// regardless of elapsed time.
pub fn classify(
    offline_for: Duration,
    access_token_valid: bool,
    refresh_token_valid: bool,
) -> HealthState {
    if !refresh_token_valid {
        return HealthState::ReauthRequired;
    }
    if access_token_valid {
        return HealthState::Online;
    }
    if offline_for < Duration::hours(SHORT_OFFLINE_HOURS) {
        HealthState::ShortOffline
    } else if offline_for < Duration::hours(MEDIUM_OFFLINE_HOURS) {
        HealthState::MediumOffline
    } else {
        HealthState::LongOffline
    }
}

/// Per-operation availability for the current state and tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub can_read: bool,
    pub can_write: bool,
    pub can_search: bool,
    pub can_sync: bool,
    pub can_use_llm: bool,
}

/// Compute operation availability.
///
/// Reads and writes always work — offline writes land in the sync
/// queue. Private-tier search stays available offline because
/// passkey-derived keys live locally; Standard-tier search needs the
/// relay. Sync and LLM calls need the network.
pub fn capabilities(state: HealthState, tier: PrivacyTier) -> Capabilities {
    let online = state == HealthState::Online;
    Capabilities {
        can_read: true,
        can_write: true,
        can_search: match tier {
            PrivacyTier::Private => true,
            PrivacyTier::Standard => online,
        },
        can_sync: online,
        can_use_llm: online,
    }
}

// ── Clock drift ─────────────────────────────────────────────────

/// Exponential-moving-average tracker of local clock drift against
/// per-sync server-time samples.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriftTracker {
    drift_ms: f64,
    samples: u64,
}

impl DriftTracker {
    pub fn new(drift_ms: f64) -> Self {
        Self {
            drift_ms,
            samples: u64::from(drift_ms != 0.0),
        }
    }

    /// Fold in one observation of `server_time - local_time`.
    pub fn observe(&mut self, server_time: DateTime<Utc>, local_time: DateTime<Utc>) {
        let sample = (server_time - local_time).num_milliseconds() as f64;
        if self.samples == 0 {
            self.drift_ms = sample;
        } else {
            self.drift_ms = DRIFT_EMA_WEIGHT * sample + (1.0 - DRIFT_EMA_WEIGHT) * self.drift_ms;
        }
        self.samples += 1;
    }

    pub fn drift_ms(&self) -> f64 {
        self.drift_ms
    }

    /// Local wall clock corrected by the tracked drift — the ordering
    /// input for `latest_wins` / `max_timestamp` merges.
    pub fn adjusted(&self, local_time: DateTime<Utc>) -> DateTime<Utc> {
        local_time + Duration::milliseconds(self.drift_ms as i64)
    }

    pub fn adjusted_now(&self) -> DateTime<Utc> {
        self.adjusted(Utc::now())
    }
}
