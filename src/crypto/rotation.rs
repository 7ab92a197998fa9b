//! Background key rotation.
//!
//! Phases: `generating → reencrypting → verifying → completing`.
//! Transitions are one-way; the engine persists the current phase and
//! a `last_processed_id` cursor after every batch, so rotation
//! survives crashes, device sleep, and app backgrounding without data
//! loss and resumes with no user input.
//!
//! Throughout a rotation, new writes use the new key and reads
//! dispatch on each node's `encryption_version`; rotation never
//! blocks either.

use crate::config::RotationConfig;
use crate::crypto::codec::{open_node, seal_node, SealedNode};
use crate::crypto::keys::{KeyHierarchy, KeyStatus, KeyVersionRecord};
use crate::error::{Result, SyncError};
use crate::store::SyncStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;

/// Fraction of nodes re-verified after re-encryption.
const VERIFY_SAMPLE_FRACTION: f64 = 0.05;

/// One-way phases of a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPhase {
    Generating,
    Reencrypting,
    Verifying,
    Completing,
}

impl RotationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationPhase::Generating => "generating",
            RotationPhase::Reencrypting => "reencrypting",
            RotationPhase::Verifying => "verifying",
            RotationPhase::Completing => "completing",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "generating" => Some(RotationPhase::Generating),
            "reencrypting" => Some(RotationPhase::Reencrypting),
            "verifying" => Some(RotationPhase::Verifying),
            "completing" => Some(RotationPhase::Completing),
            _ => None,
        }
    }
}

/// Persisted rotation state.
#[derive(Debug, Clone)]
pub struct RotationProgress {
    pub phase: RotationPhase,
    /// Last node id re-encrypted; the next batch starts after it.
    pub last_processed_id: Option<String>,
    pub new_version: u32,
    pub started_at: DateTime<Utc>,
}

/// Device conditions sampled before each batch.
#[derive(Debug, Clone, Copy)]
pub struct RotationEnvironment {
    pub on_wifi: bool,
    pub charging: bool,
    /// 0.0–1.0.
    pub battery_level: f32,
}

impl RotationEnvironment {
    /// Whether a batch may run under the configured preconditions.
    pub fn allows(&self, config: &RotationConfig) -> bool {
        if config.require_wifi && !self.on_wifi {
            return false;
        }
        if config.require_charging && !self.charging {
            return false;
        }
        self.battery_level >= config.min_battery_level
    }
}

/// Outcome of one rotation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Re-encrypted this many nodes; more work remains.
    Progressed(usize),
    /// Preconditions lost; cursor preserved, try again later.
    Paused,
    /// The rotation finished and the new version is active.
    Completed,
}

/// Drives one user's key rotation against the local store.
pub struct RotationEngine {
    store: Arc<SyncStore>,
    config: RotationConfig,
}

impl RotationEngine {
    pub fn new(store: Arc<SyncStore>, config: RotationConfig) -> Self {
        Self { store, config }
    }

    /// Begin a rotation: mint the next key version with a fresh salt,
    /// insert its record as `rotating`, and persist the re-encryption
    /// cursor. The old active version stays `active` until completion.
    pub fn begin(&self, keys: &Mutex<KeyHierarchy>) -> Result<RotationProgress> {
        if self.store.load_rotation()?.is_some() {
            return Err(SyncError::RotationAborted {
                reason: "a rotation is already in progress".into(),
            });
        }

        let new_version = self.store.max_key_version()? + 1;
        let started_at = Utc::now();

        let mut progress = RotationProgress {
            phase: RotationPhase::Generating,
            last_processed_id: None,
            new_version,
            started_at,
        };
        self.store.save_rotation(&progress)?;

        let record = KeyVersionRecord::generate(new_version, KeyStatus::Rotating);
        self.store.put_key_version(&record)?;
        keys.lock().register_version(&record);

        progress.phase = RotationPhase::Reencrypting;
        self.store.save_rotation(&progress)?;

        tracing::info!(new_version, "Key rotation started");
        Ok(progress)
    }

    /// Load the persisted rotation, if one is in flight.
    pub fn resume(&self) -> Result<Option<RotationProgress>> {
        self.store.load_rotation()
    }

    /// Advance the rotation by one unit of work for its current phase.
    pub fn step(
        &self,
        keys: &Mutex<KeyHierarchy>,
        env: &RotationEnvironment,
    ) -> Result<StepOutcome> {
        let progress = self.store.load_rotation()?.ok_or(SyncError::RotationAborted {
            reason: "no rotation in progress".into(),
        })?;

        match progress.phase {
            RotationPhase::Generating => {
                // Crash landed between the progress write and the key
                // record insert — re-mint if needed, then move on.
                let mut progress = progress;
                if self.store.get_key_version(progress.new_version)?.is_none() {
                    let record =
                        KeyVersionRecord::generate(progress.new_version, KeyStatus::Rotating);
                    self.store.put_key_version(&record)?;
                    keys.lock().register_version(&record);
                }
                progress.phase = RotationPhase::Reencrypting;
                self.store.save_rotation(&progress)?;
                Ok(StepOutcome::Progressed(0))
            }
            RotationPhase::Reencrypting => self.reencrypt_batch(keys, env, progress),
            RotationPhase::Verifying => self.verify(keys, progress),
            RotationPhase::Completing => self.complete(keys, progress),
        }
    }

    /// Re-encrypt one batch of nodes still on an older key version.
    fn reencrypt_batch(
        &self,
        keys: &Mutex<KeyHierarchy>,
        env: &RotationEnvironment,
        mut progress: RotationProgress,
    ) -> Result<StepOutcome> {
        if !env.allows(&self.config) {
            tracing::debug!("Rotation batch skipped: preconditions not met");
            return Ok(StepOutcome::Paused);
        }

        let nodes = self.store.nodes_below_version(
            progress.new_version,
            progress.last_processed_id.as_deref(),
            self.config.batch_size,
        )?;

        if nodes.is_empty() {
            progress.phase = RotationPhase::Verifying;
            self.store.save_rotation(&progress)?;
            return Ok(StepOutcome::Progressed(0));
        }

        let keys = keys.lock();
        let mut processed = 0usize;
        for node in &nodes {
            let sealed = sealed_from_node(node)?;
            let (plaintext, embedding) = open_node(&keys, &sealed)?;
            let resealed = seal_node(
                &keys,
                progress.new_version,
                &plaintext,
                embedding.as_deref(),
            )?;

            let mut updated = node.clone();
            updated.encrypted_payload = Some(resealed.encrypted_payload);
            updated.encrypted_embedding = resealed.encrypted_embedding;
            updated.nonce = Some(resealed.nonce.to_vec());
            updated.encryption_version = Some(progress.new_version);
            updated.content_checksum = Some(resealed.content_checksum);
            updated.updated_at = Utc::now();
            self.store.upsert_node(&updated)?;

            progress.last_processed_id = Some(node.node_id.clone());
            processed += 1;
        }
        drop(keys);

        if self.config.persist_progress {
            self.store.save_rotation(&progress)?;
        }

        tracing::debug!(
            processed,
            cursor = progress.last_processed_id.as_deref().unwrap_or(""),
            "Rotation batch re-encrypted"
        );
        Ok(StepOutcome::Progressed(processed))
    }

    /// Sample 5% of nodes and re-verify decryption under the new key.
    /// Any failure aborts the rotation: the new version is expired,
    /// the old stays active.
    fn verify(&self, keys: &Mutex<KeyHierarchy>, mut progress: RotationProgress) -> Result<StepOutcome> {
        let ids = self.store.encrypted_node_ids()?;
        let sample_size = ((ids.len() as f64) * VERIFY_SAMPLE_FRACTION).ceil() as usize;
        let sample: Vec<&String> = {
            let mut rng = rand::thread_rng();
            ids.choose_multiple(&mut rng, sample_size.max(usize::from(!ids.is_empty()))).collect()
        };

        let keys = keys.lock();
        for node_id in sample {
            let Some(node) = self.store.get_node(node_id)? else {
                continue;
            };
            let sealed = sealed_from_node(&node)?;
            if sealed.encryption_version != progress.new_version {
                return self.abort(progress.new_version, "node missed by re-encryption pass");
            }
            if let Err(e) = open_node(&keys, &sealed) {
                tracing::warn!(node_id = %node.node_id, "Rotation verification failed: {e}");
                return self.abort(progress.new_version, "verification decrypt failed");
            }
        }
        drop(keys);

        progress.phase = RotationPhase::Completing;
        self.store.save_rotation(&progress)?;
        Ok(StepOutcome::Progressed(0))
    }

    /// Mark the new version active, the old deprecated (retained 30
    /// days for late-syncing peers), and drop the cursor.
    fn complete(
        &self,
        keys: &Mutex<KeyHierarchy>,
        progress: RotationProgress,
    ) -> Result<StepOutcome> {
        if let Some(old) = self.store.key_version_with_status(KeyStatus::Active)? {
            if old.version != progress.new_version {
                self.store.set_key_status(old.version, KeyStatus::Deprecated)?;
            }
        }
        self.store
            .set_key_status(progress.new_version, KeyStatus::Active)?;
        keys.lock().set_active_version(progress.new_version);
        self.store.clear_rotation()?;

        tracing::info!(
            event = "rotation:completed",
            new_version = progress.new_version,
            "Key rotation completed"
        );
        Ok(StepOutcome::Completed)
    }

    fn abort(&self, new_version: u32, reason: &str) -> Result<StepOutcome> {
        self.store.set_key_status(new_version, KeyStatus::Expired)?;
        self.store.clear_rotation()?;
        tracing::warn!(new_version, reason, "Key rotation aborted");
        Err(SyncError::RotationAborted {
            reason: reason.to_string(),
        })
    }

    /// Drive the rotation until it completes or pauses, sleeping
    /// between batches and honoring the batches-per-minute throttle.
    pub async fn run_until_done(
        &self,
        keys: &Mutex<KeyHierarchy>,
        env_probe: impl Fn() -> RotationEnvironment,
    ) -> Result<StepOutcome> {
        let pause = Duration::from_millis(
            self.config
                .pause_between_batches_ms
                .max(60_000 / u64::from(self.config.max_batches_per_minute.max(1))),
        );

        loop {
            match self.step(keys, &env_probe())? {
                StepOutcome::Completed => return Ok(StepOutcome::Completed),
                StepOutcome::Paused => return Ok(StepOutcome::Paused),
                StepOutcome::Progressed(_) => {
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }
}

fn sealed_from_node(node: &crate::store::StoredNode) -> Result<SealedNode> {
    let encrypted_payload = node
        .encrypted_payload
        .clone()
        .ok_or_else(|| SyncError::IntegrityError {
            context: format!("node {} has no ciphertext", node.node_id),
        })?;
    let nonce_vec = node.nonce.clone().unwrap_or_default();
    let nonce: [u8; 12] = nonce_vec
        .as_slice()
        .try_into()
        .map_err(|_| SyncError::IntegrityError {
            context: format!("node {} has an invalid nonce", node.node_id),
        })?;
    Ok(SealedNode {
        encrypted_payload,
        encrypted_embedding: node.encrypted_embedding.clone(),
        nonce,
        encryption_version: node.encryption_version.unwrap_or(0),
        content_checksum: node.content_checksum.clone().unwrap_or_default(),
    })
}
