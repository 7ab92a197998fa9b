//! Engine configuration.
//!
//! Every knob has a serde default so a partial TOML file parses; an
//! absent file yields the built-in defaults. Engines take their config
//! explicitly so tests can run several differently-tuned engines side
//! by side.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for one engine instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sync: SyncConfig,
    pub rotation: RotationConfig,
    pub compaction: CompactionConfig,
    pub conflict: ConflictConfig,
}

/// Sync cycle tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Minimum interval between automatic sync cycles.
    pub min_sync_interval_ms: u64,
    /// Maximum retry attempts for retryable relay errors.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub retry_base_delay_ms: u64,
    /// Payloads per push/pull batch.
    pub batch_size: usize,
    /// Whether sync cycles run automatically.
    pub auto_sync: bool,
    /// Only sync on Wi-Fi.
    pub wifi_only: bool,
    /// Only sync while charging.
    pub charging_only: bool,
    /// Upper bound on queued offline writes.
    pub offline_queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_sync_interval_ms: 60_000,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            batch_size: 100,
            auto_sync: true,
            wifi_only: false,
            charging_only: false,
            offline_queue_capacity: 1_000,
        }
    }
}

/// Key rotation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Nodes re-encrypted per batch.
    pub batch_size: usize,
    /// Pause between re-encryption batches.
    pub pause_between_batches_ms: u64,
    /// Throttle ceiling for background work.
    pub max_batches_per_minute: u32,
    /// Abort batches when not on Wi-Fi.
    pub require_wifi: bool,
    /// Abort batches when not charging.
    pub require_charging: bool,
    /// Abort batches below this battery fraction (0.0–1.0).
    pub min_battery_level: f32,
    /// Persist phase + cursor after every batch.
    pub persist_progress: bool,
    /// Continue a persisted rotation on process start.
    pub auto_resume_on_launch: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            pause_between_batches_ms: 500,
            max_batches_per_minute: 10,
            require_wifi: true,
            require_charging: false,
            min_battery_level: 0.2,
            persist_progress: true,
            auto_resume_on_launch: true,
        }
    }
}

/// Version vector compaction thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Compaction is a no-op at or below this many active devices.
    pub threshold: usize,
    /// Devices inactive longer than this are folded into `_inactive`.
    pub inactive_days: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            threshold: 10,
            inactive_days: 90,
        }
    }
}

/// Conflict retention and notification tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Days before unresolved conflicts and history entries expire.
    pub history_retention_days: u32,
    /// Cooldown after a banner dismissal.
    pub banner_cooldown_ms: u64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            history_retention_days: 30,
            banner_cooldown_ms: 86_400_000,
        }
    }
}

impl EngineConfig {
    /// Load config from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config = toml::from_str(&raw)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_knobs() {
        let config = EngineConfig::default();
        assert_eq!(config.sync.min_sync_interval_ms, 60_000);
        assert_eq!(config.sync.max_retries, 3);
        assert_eq!(config.sync.batch_size, 100);
        assert_eq!(config.rotation.batch_size, 100);
        assert_eq!(config.rotation.pause_between_batches_ms, 500);
        assert_eq!(config.rotation.max_batches_per_minute, 10);
        assert_eq!(config.compaction.threshold, 10);
        assert_eq!(config.compaction.inactive_days, 90);
        assert_eq!(config.conflict.history_retention_days, 30);
        assert_eq!(config.conflict.banner_cooldown_ms, 86_400_000);
    }

    #[test]
    fn partial_toml_parses_with_defaults() {
        let parsed: EngineConfig = toml::from_str(
            r#"
            [sync]
            batch_size = 25

            [rotation]
            require_wifi = false
            "#,
        )
        .unwrap();

        assert_eq!(parsed.sync.batch_size, 25);
        assert_eq!(parsed.sync.max_retries, 3); // default
        assert!(!parsed.rotation.require_wifi);
        assert_eq!(parsed.rotation.batch_size, 100); // default
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = EngineConfig::load(Path::new("/nonexistent/nous.toml")).unwrap();
        assert_eq!(config.sync.batch_size, 100);
    }
}
