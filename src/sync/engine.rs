//! Engine orchestration: the local write path, the sync cycle, and
//! remote-payload application.
//!
//! A local write mutates a node, increments the local device's vector
//! coordinate, and leaves the node `pending` for the next push. A
//! sync cycle pushes pending payloads, pulls remote payloads since the
//! durable cursor, and routes each remote through vector comparison:
//! dominated remotes are discarded, dominating remotes overwrite,
//! concurrent remotes enter auto-merge (Standard tier) or the
//! checksum path (Private tier). The commit of
//! `(payload, vector, snapshot)` is atomic.

use crate::config::EngineConfig;
use crate::conflict::{
    banner_visible, BadgeState, ConflictHistoryEntry, Resolver, UnresolvedConflict,
};
use crate::crypto::codec::{open_node, seal_node, SealedNode};
use crate::crypto::keys::{KeyHierarchy, KeyStatus, KeyVersionRecord};
use crate::error::{Result, SyncError};
use crate::health::{capabilities, classify, Capabilities, DriftTracker, HealthState};
use crate::model::{DeviceRecord, PrivacyTier, SyncStatus, SCHEMA_VERSION};
use crate::store::{NodeSyncMeta, QueuedWrite, StoredNode, SyncStore};
use crate::sync::changeset::{compute_change_set, ChangeSet};
use crate::sync::merge::{auto_merge, FieldConflict, MergeStatus};
use crate::sync::protocol::{PullResponse, PushPayload, PushResponse, RelayClient, Timed};
use crate::sync::relay::RelayCore;
use crate::sync::vector::VectorOrdering;
use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Yield between pull batches so large initial syncs stay
/// non-blocking on UI runtimes.
const PULL_BATCH_YIELD_MS: u64 = 50;

/// Transport seam between the engine and the relay, so tests can run
/// the full protocol in-process.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn push(&self, payloads: Vec<PushPayload>) -> Result<Timed<PushResponse>>;
    async fn pull(&self, cursor: Option<&str>, limit: usize) -> Result<Timed<PullResponse>>;
}

#[async_trait]
impl RelayTransport for RelayClient {
    async fn push(&self, payloads: Vec<PushPayload>) -> Result<Timed<PushResponse>> {
        RelayClient::push(self, payloads).await
    }

    async fn pull(&self, cursor: Option<&str>, limit: usize) -> Result<Timed<PullResponse>> {
        RelayClient::pull(self, cursor, limit).await
    }
}

/// Direct in-process transport against a [`RelayCore`].
pub struct InProcessRelay {
    pub core: Arc<RelayCore>,
    pub user_id: String,
    pub device_id: String,
    pub schema_version: u32,
}

#[async_trait]
impl RelayTransport for InProcessRelay {
    async fn push(&self, payloads: Vec<PushPayload>) -> Result<Timed<PushResponse>> {
        let body = self
            .core
            .push(&self.user_id, &self.device_id, self.schema_version, payloads)?;
        Ok(Timed {
            body,
            server_time: Utc::now(),
        })
    }

    async fn pull(&self, cursor: Option<&str>, limit: usize) -> Result<Timed<PullResponse>> {
        let body = self
            .core
            .pull(&self.user_id, self.schema_version, cursor, limit)?;
        Ok(Timed {
            body,
            server_time: Utc::now(),
        })
    }
}

/// Result summary of one sync cycle.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub pushed: usize,
    pub push_conflicts: usize,
    pub pulled: usize,
    pub overwritten: usize,
    pub merged: usize,
    pub conflicts_recorded: usize,
    pub discarded: usize,
}

/// How a user resolves a conflicted node.
#[derive(Debug, Clone)]
pub enum ConflictResolution {
    KeepLocal,
    KeepRemote,
    /// User-authored merged payload.
    Manual(Value),
}

/// Validity of the auth provider's tokens (external input).
#[derive(Debug, Clone, Copy)]
pub struct TokenValidity {
    pub access_valid: bool,
    pub refresh_valid: bool,
}

impl Default for TokenValidity {
    fn default() -> Self {
        Self {
            access_valid: true,
            refresh_valid: true,
        }
    }
}

/// One engine instance: a single device's view of one user namespace.
pub struct NousSyncEngine {
    store: Arc<SyncStore>,
    config: EngineConfig,
    device: DeviceRecord,
    tier: PrivacyTier,
    keys: Mutex<KeyHierarchy>,
    drift: Mutex<DriftTracker>,
    tokens: Mutex<TokenValidity>,
    node_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    last_error: Mutex<Option<String>>,
    halted: AtomicBool,
}

impl NousSyncEngine {
    /// Create an engine for this device. The device record is
    /// persisted so peers (and compaction) can see it.
    pub fn new(
        store: Arc<SyncStore>,
        config: EngineConfig,
        device: DeviceRecord,
        tier: PrivacyTier,
    ) -> Result<Self> {
        store.upsert_device(&device)?;
        let drift = DriftTracker::new(store.drift_ms()?);

        Ok(Self {
            store,
            config,
            device,
            tier,
            keys: Mutex::new(KeyHierarchy::new()),
            drift: Mutex::new(drift),
            tokens: Mutex::new(TokenValidity::default()),
            node_locks: Mutex::new(HashMap::new()),
            last_error: Mutex::new(None),
            halted: AtomicBool::new(false),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device.device_id
    }

    pub fn store(&self) -> &Arc<SyncStore> {
        &self.store
    }

    pub fn tier(&self) -> PrivacyTier {
        self.tier
    }

    // ── Private-tier key management ─────────────────────────────

    /// Unlock the key hierarchy with the passkey-backed secret,
    /// registering every persisted key version. Creates version 1 on
    /// first use.
    pub fn unlock_keys(&self, passkey_secret: &[u8]) -> Result<()> {
        let mut keys = self.keys.lock();
        keys.unlock(passkey_secret.to_vec());

        let mut versions = self.store.list_key_versions()?;
        if versions.is_empty() {
            let first = KeyVersionRecord::generate(1, KeyStatus::Active);
            self.store.put_key_version(&first)?;
            versions.push(first);
        }
        for record in &versions {
            keys.register_version(record);
        }
        Ok(())
    }

    /// Drop key material (background transition). Private-tier sync
    /// is unavailable until the next unlock.
    pub fn lock_keys(&self) {
        self.keys.lock().lock();
    }

    /// Install key-version metadata fetched from the key service —
    /// the refresh path a `KeyVersionMissing` failure asks for.
    /// Records carry only salts and statuses, never key material.
    pub fn import_key_versions(&self, records: &[KeyVersionRecord]) -> Result<()> {
        let mut keys = self.keys.lock();
        for record in records {
            self.store.put_key_version(record)?;
            keys.register_version(record);
        }
        Ok(())
    }

    /// Shared hierarchy handle for the rotation engine.
    pub fn key_hierarchy(&self) -> &Mutex<KeyHierarchy> {
        &self.keys
    }

    /// The key version new writes must use: the rotating version if a
    /// rotation is in flight, else the active one (I5).
    fn write_key_version(&self) -> Result<u32> {
        if let Some(rotating) = self.store.key_version_with_status(KeyStatus::Rotating)? {
            return Ok(rotating.version);
        }
        let active = self
            .store
            .key_version_with_status(KeyStatus::Active)?
            .ok_or(SyncError::KeyVersionMissing { version: 0 })?;
        Ok(active.version)
    }

    // ── Local write path ────────────────────────────────────────

    fn node_lock(&self, node_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.node_locks.lock();
        locks
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Write a node's payload locally.
    ///
    /// Serialized per node: load snapshot, diff, bump the vector, and
    /// persist as `pending`. In any offline state the write is also
    /// queued for the drain that runs when connectivity returns.
    pub fn write_node(&self, node_id: &str, payload: &Value, priority: i32) -> Result<()> {
        let lock = self.node_lock(node_id);
        let _guard = lock.lock();
        self.write_node_locked(node_id, payload, priority)
    }

    /// Write-path body. Caller must hold this node's lock.
    fn write_node_locked(&self, node_id: &str, payload: &Value, priority: i32) -> Result<()> {
        let existing_meta = self.store.get_meta(node_id)?;
        let snapshot = self.store.get_snapshot(node_id)?;

        if snapshot.is_none() {
            if let Some(meta) = &existing_meta {
                if meta.status == SyncStatus::Synced {
                    // Snapshot lost for a node presumed synced —
                    // recoverable, diff as a new node.
                    tracing::warn!(node_id, "Base snapshot missing for synced node");
                }
            }
        }

        let timestamp = self.drift.lock().adjusted_now();
        let change_set = compute_change_set(
            snapshot.as_ref().map(|s| &s.snapshot),
            payload,
            node_id,
            &self.device.device_id,
            timestamp,
        );
        if change_set.is_empty() {
            tracing::debug!(node_id, "Write produced no syncable changes");
            return Ok(());
        }

        let mut vector = existing_meta
            .as_ref()
            .map(|m| m.vector.clone())
            .unwrap_or_default();
        vector.increment(&self.device.device_id);

        let mut node = StoredNode {
            node_id: node_id.to_string(),
            node_type: "memory".into(),
            payload: Some(payload.clone()),
            encrypted_payload: None,
            encrypted_embedding: None,
            nonce: None,
            encryption_version: None,
            content_checksum: None,
            updated_at: timestamp,
        };

        if self.tier == PrivacyTier::Private {
            let version = self.write_key_version()?;
            let keys = self.keys.lock();
            let sealed = seal_node(&keys, version, &serde_json::to_vec(payload)?, None)?;
            node.encrypted_payload = Some(sealed.encrypted_payload);
            node.nonce = Some(sealed.nonce.to_vec());
            node.encryption_version = Some(version);
            node.content_checksum = Some(sealed.content_checksum);
        }

        let meta = NodeSyncMeta {
            node_id: node_id.to_string(),
            vector,
            last_modifier: self.device.device_id.clone(),
            last_modified_at: timestamp,
            last_synced_at: existing_meta.as_ref().and_then(|m| m.last_synced_at),
            status: SyncStatus::Pending,
            content_checksum: node.content_checksum.clone(),
        };

        self.store.upsert_node(&node)?;
        self.store.upsert_meta(&meta)?;

        if self.health_state() != HealthState::Online {
            self.store.enqueue(
                node_id,
                priority,
                &json!({"kind": "node_write"}),
                self.config.sync.offline_queue_capacity,
            )?;
            tracing::debug!(node_id, priority, "Offline write queued");
        }

        tracing::debug!(
            node_id,
            seq = meta.vector.get(&self.device.device_id),
            "Recorded local write"
        );
        Ok(())
    }

    /// Current payload of a node, if present.
    pub fn read_node(&self, node_id: &str) -> Result<Option<Value>> {
        Ok(self.store.get_node(node_id)?.and_then(|n| n.payload))
    }

    pub fn node_status(&self, node_id: &str) -> Result<Option<SyncStatus>> {
        Ok(self.store.get_meta(node_id)?.map(|m| m.status))
    }

    pub fn node_vector(&self, node_id: &str) -> Result<Option<crate::sync::vector::VersionVector>> {
        Ok(self.store.get_meta(node_id)?.map(|m| m.vector))
    }

    // ── Sync cycle ──────────────────────────────────────────────

    /// Run one full push + pull cycle against the relay.
    pub async fn sync_cycle(&self, transport: &dyn RelayTransport) -> Result<SyncReport> {
        if self.halted.load(Ordering::SeqCst) {
            let message = self
                .last_error
                .lock()
                .clone()
                .unwrap_or_else(|| "sync halted".into());
            return Err(SyncError::Transport(format!("sync halted: {message}")));
        }

        let mut report = SyncReport::default();

        match self.run_cycle(transport, &mut report).await {
            Ok(()) => {
                self.store.set_last_online_at(Utc::now())?;
                self.store.touch_device(&self.device.device_id, Utc::now())?;
                *self.last_error.lock() = None;
                Ok(report)
            }
            Err(e) => {
                *self.last_error.lock() = Some(e.to_string());
                if e.halts_namespace() {
                    self.halted.store(true, Ordering::SeqCst);
                    tracing::warn!("Sync halted for namespace: {e}");
                }
                Err(e)
            }
        }
    }

    async fn run_cycle(
        &self,
        transport: &dyn RelayTransport,
        report: &mut SyncReport,
    ) -> Result<()> {
        self.push_pending(transport, report).await?;
        self.pull_remote(transport, report).await?;
        Ok(())
    }

    /// Push pending nodes, draining the offline queue in priority
    /// order first.
    async fn push_pending(
        &self,
        transport: &dyn RelayTransport,
        report: &mut SyncReport,
    ) -> Result<()> {
        let queued = self.store.peek_queue(self.config.sync.batch_size)?;
        let mut ordered_ids: Vec<String> = queued.iter().map(|q| q.node_id.clone()).collect();

        for meta in self.store.list_pending(self.config.sync.batch_size)? {
            if !ordered_ids.contains(&meta.node_id) {
                ordered_ids.push(meta.node_id);
            }
        }

        if ordered_ids.is_empty() {
            return Ok(());
        }

        let mut payloads = Vec::new();
        for node_id in &ordered_ids {
            if let Some(payload) = self.build_push_payload(node_id)? {
                payloads.push(payload);
            }
        }
        if payloads.is_empty() {
            self.clear_drained(&queued, &[])?;
            return Ok(());
        }

        let reply = transport.push(payloads).await?;
        self.observe_server_time(reply.server_time)?;

        let applied_ids: Vec<String> = reply.body.applied.iter().map(|a| a.id.clone()).collect();
        for id in &applied_ids {
            self.mark_pushed(id)?;
        }
        report.pushed += applied_ids.len();
        report.push_conflicts += reply.body.conflicts.len();

        // Conflicting pushes stay pending; the authoritative remote
        // arrives through the pull path and goes through auto-merge.
        for conflict in &reply.body.conflicts {
            tracing::debug!(node_id = %conflict.id, "Push behind relay, awaiting pull");
        }

        self.clear_drained(&queued, &applied_ids)?;
        Ok(())
    }

    fn clear_drained(&self, queued: &[QueuedWrite], applied: &[String]) -> Result<()> {
        for entry in queued {
            let gone = self.store.get_meta(&entry.node_id)?.is_none();
            if gone || applied.contains(&entry.node_id) {
                self.store.remove_queued(entry.id)?;
            }
        }
        Ok(())
    }

    /// Assemble the wire payload for one pending node.
    fn build_push_payload(&self, node_id: &str) -> Result<Option<PushPayload>> {
        let Some(meta) = self.store.get_meta(node_id)? else {
            return Ok(None);
        };
        if meta.status != SyncStatus::Pending {
            return Ok(None);
        }
        let Some(node) = self.store.get_node(node_id)? else {
            return Ok(None);
        };

        let mut payload = PushPayload {
            id: node_id.to_string(),
            version: meta.vector.clone(),
            change_set: None,
            data: None,
            content_checksum: node.content_checksum.clone(),
            encrypted_payload: None,
            encrypted_embedding: None,
            nonce: None,
            encryption_version: None,
            last_modified_at: Some(meta.last_modified_at),
        };

        match self.tier {
            PrivacyTier::Standard => {
                let data = node.payload.clone().unwrap_or(Value::Null);
                let snapshot = self.store.get_snapshot(node_id)?;
                payload.change_set = Some(compute_change_set(
                    snapshot.as_ref().map(|s| &s.snapshot),
                    &data,
                    node_id,
                    &self.device.device_id,
                    meta.last_modified_at,
                ));
                payload.data = Some(data);
            }
            PrivacyTier::Private => {
                // The relay never sees the change set's field list.
                let b64 = base64::engine::general_purpose::STANDARD;
                payload.encrypted_payload = node.encrypted_payload.as_ref().map(|b| b64.encode(b));
                payload.encrypted_embedding =
                    node.encrypted_embedding.as_ref().map(|b| b64.encode(b));
                payload.nonce = node.nonce.as_ref().map(|b| b64.encode(b));
                payload.encryption_version = node.encryption_version;
            }
        }

        Ok(Some(payload))
    }

    /// An acknowledged push: snapshot and metadata flip to synced.
    fn mark_pushed(&self, node_id: &str) -> Result<()> {
        let lock = self.node_lock(node_id);
        let _guard = lock.lock();

        let Some(mut meta) = self.store.get_meta(node_id)? else {
            return Ok(());
        };
        let Some(node) = self.store.get_node(node_id)? else {
            return Ok(());
        };

        let now = Utc::now();
        meta.status = SyncStatus::Synced;
        meta.last_synced_at = Some(now);
        let snapshot = node.payload.clone().unwrap_or(Value::Null);
        self.store.commit_synced(&node, &meta, &snapshot, now)?;
        Ok(())
    }

    /// Pull remote batches since the durable cursor and apply each
    /// payload, yielding between batches.
    async fn pull_remote(
        &self,
        transport: &dyn RelayTransport,
        report: &mut SyncReport,
    ) -> Result<()> {
        loop {
            let cursor = self.store.pull_cursor()?;
            let reply = transport
                .pull(cursor.as_deref(), self.config.sync.batch_size)
                .await?;
            self.observe_server_time(reply.server_time)?;

            if reply.body.changes.is_empty() {
                return Ok(());
            }

            // Deterministic fold order for payloads concurrent with
            // each other and with local state.
            let mut changes = reply.body.changes;
            changes.sort_by(|a, b| {
                (a.last_modified_at, &a.id).cmp(&(b.last_modified_at, &b.id))
            });

            for payload in changes {
                report.pulled += 1;
                self.apply_remote(payload, report)?;
            }

            match reply.body.next_cursor {
                Some(cursor) => self.store.set_pull_cursor(&cursor)?,
                None => return Ok(()),
            }

            tokio::time::sleep(std::time::Duration::from_millis(PULL_BATCH_YIELD_MS)).await;
        }
    }

    /// Record a peer device seen in remote traffic. Platform comes
    /// from the device-id prefix; activity feeds vector compaction.
    fn note_peer_device(&self, device_id: &str) -> Result<()> {
        if device_id.is_empty() || device_id == self.device.device_id {
            return Ok(());
        }
        match self.store.get_device(device_id)? {
            Some(_) => self.store.touch_device(device_id, Utc::now()),
            None => {
                let platform = device_id
                    .split('-')
                    .next()
                    .and_then(crate::model::Platform::parse)
                    .unwrap_or(crate::model::Platform::Web);
                let mut device = DeviceRecord::generate(platform, "peer");
                device.device_id = device_id.to_string();
                self.store.upsert_device(&device)
            }
        }
    }

    /// Route one remote payload through vector comparison.
    fn apply_remote(&self, remote: PushPayload, report: &mut SyncReport) -> Result<()> {
        let lock = self.node_lock(&remote.id);
        let _guard = lock.lock();

        if let Some(cs) = &remote.change_set {
            self.note_peer_device(&cs.device_id)?;
        }

        // Applying a payload twice is a no-op thanks to dominance.
        let Some(meta) = self.store.get_meta(&remote.id)? else {
            self.adopt_remote(&remote, None)?;
            report.overwritten += 1;
            return Ok(());
        };

        match remote.version.compare(&meta.vector) {
            VectorOrdering::BDominates | VectorOrdering::Equal => {
                report.discarded += 1;
                tracing::debug!(node_id = %remote.id, "Remote dominated or equal, discarded");
                Ok(())
            }
            VectorOrdering::ADominates => {
                self.adopt_remote(&remote, Some(&meta))?;
                report.overwritten += 1;
                Ok(())
            }
            VectorOrdering::Concurrent => match self.tier {
                PrivacyTier::Standard => self.merge_remote(&remote, &meta, report),
                PrivacyTier::Private => self.checksum_merge_remote(&remote, &meta, report),
            },
        }
    }

    /// Remote wins wholesale: commit payload, merged vector, and
    /// snapshot atomically.
    fn adopt_remote(&self, remote: &PushPayload, meta: Option<&NodeSyncMeta>) -> Result<()> {
        let now = Utc::now();
        let (payload, node) = self.materialize_remote(remote, now)?;

        let mut vector = meta.map(|m| m.vector.clone()).unwrap_or_default();
        vector.merge(&remote.version);

        let new_meta = NodeSyncMeta {
            node_id: remote.id.clone(),
            vector,
            last_modifier: remote
                .change_set
                .as_ref()
                .map(|cs| cs.device_id.clone())
                .unwrap_or_else(|| "remote".into()),
            last_modified_at: remote.last_modified_at.unwrap_or(now),
            last_synced_at: Some(now),
            status: SyncStatus::Synced,
            content_checksum: remote.content_checksum.clone(),
        };

        self.store.commit_synced(&node, &new_meta, &payload, now)?;
        tracing::debug!(node_id = %remote.id, "Adopted dominating remote");
        Ok(())
    }

    /// Decode a remote payload into `(plaintext payload, stored node)`.
    fn materialize_remote(
        &self,
        remote: &PushPayload,
        now: DateTime<Utc>,
    ) -> Result<(Value, StoredNode)> {
        let mut node = StoredNode {
            node_id: remote.id.clone(),
            node_type: "memory".into(),
            payload: None,
            encrypted_payload: None,
            encrypted_embedding: None,
            nonce: None,
            encryption_version: None,
            content_checksum: remote.content_checksum.clone(),
            updated_at: now,
        };

        let payload = match self.tier {
            PrivacyTier::Standard => remote.data.clone().unwrap_or(Value::Null),
            PrivacyTier::Private => {
                let sealed = sealed_from_wire(remote)?;
                let keys = self.keys.lock();
                let (plaintext, _) = open_node(&keys, &sealed)?;
                node.encrypted_payload = Some(sealed.encrypted_payload.clone());
                node.encrypted_embedding = sealed.encrypted_embedding.clone();
                node.nonce = Some(sealed.nonce.to_vec());
                node.encryption_version = Some(sealed.encryption_version);
                serde_json::from_slice(&plaintext)?
            }
        };

        node.payload = Some(payload.clone());
        Ok((payload, node))
    }

    /// Standard tier: field-level auto-merge of concurrent changes.
    fn merge_remote(
        &self,
        remote: &PushPayload,
        meta: &NodeSyncMeta,
        report: &mut SyncReport,
    ) -> Result<()> {
        let local_payload = self
            .store
            .get_node(&remote.id)?
            .and_then(|n| n.payload)
            .unwrap_or(Value::Null);
        let snapshot = self.store.get_snapshot(&remote.id)?;
        let remote_data = remote.data.clone().unwrap_or(Value::Null);
        let remote_ts = remote.last_modified_at.unwrap_or_else(Utc::now);

        let local_cs = compute_change_set(
            snapshot.as_ref().map(|s| &s.snapshot),
            &local_payload,
            &remote.id,
            &self.device.device_id,
            meta.last_modified_at,
        );
        let remote_cs: ChangeSet = match &remote.change_set {
            Some(cs) => cs.clone(),
            None => compute_change_set(
                snapshot.as_ref().map(|s| &s.snapshot),
                &remote_data,
                &remote.id,
                "remote",
                remote_ts,
            ),
        };

        let outcome = auto_merge(&local_payload, &local_cs, &remote_cs);
        let mut vector = meta.vector.clone();
        vector.merge(&remote.version);

        let now = Utc::now();
        let status = match outcome.status {
            MergeStatus::Merged => SyncStatus::Pending,
            MergeStatus::Conflict => SyncStatus::Conflict,
        };

        let node = StoredNode {
            node_id: remote.id.clone(),
            node_type: "memory".into(),
            payload: Some(outcome.merged.clone()),
            encrypted_payload: None,
            encrypted_embedding: None,
            nonce: None,
            encryption_version: None,
            content_checksum: None,
            updated_at: now,
        };
        let new_meta = NodeSyncMeta {
            node_id: remote.id.clone(),
            vector: vector.clone(),
            last_modifier: self.device.device_id.clone(),
            last_modified_at: self.drift.lock().adjusted_now(),
            last_synced_at: meta.last_synced_at,
            status,
            content_checksum: None,
        };

        // The relay now holds the remote payload — that is the new
        // base snapshot the next diff runs against.
        self.store
            .commit_synced(&node, &new_meta, &remote_data, now)?;

        match outcome.status {
            MergeStatus::Merged => {
                report.merged += 1;
                tracing::info!(node_id = %remote.id, "Auto-merged concurrent remote");
            }
            MergeStatus::Conflict => {
                self.store.put_conflict(&UnresolvedConflict::new(
                    &remote.id,
                    meta.vector.clone(),
                    remote.version.clone(),
                    outcome.conflicts,
                    self.config.conflict.history_retention_days,
                ))?;
                report.conflicts_recorded += 1;
                tracing::info!(node_id = %remote.id, "Concurrent remote left unresolved conflicts");
            }
        }
        Ok(())
    }

    /// Private tier: the relay is blind to fields, so concurrency
    /// resolves by checksum comparison. Identical checksums merge
    /// vectors and keep the more recent ciphertext; differing
    /// checksums surface both decrypted payloads whole.
    fn checksum_merge_remote(
        &self,
        remote: &PushPayload,
        meta: &NodeSyncMeta,
        report: &mut SyncReport,
    ) -> Result<()> {
        let local_checksum = meta.content_checksum.clone().unwrap_or_default();
        let remote_checksum = remote.content_checksum.clone().unwrap_or_default();
        let now = Utc::now();

        let mut vector = meta.vector.clone();
        vector.merge(&remote.version);

        if local_checksum == remote_checksum {
            // Semantically identical concurrent writes. Keep the more
            // recent ciphertext and push the merged vector.
            let local_node = self.store.get_node(&remote.id)?;
            let remote_newer = remote.last_modified_at
                > Some(meta.last_modified_at);

            let (payload, mut node) = if remote_newer {
                self.materialize_remote(remote, now)?
            } else {
                let node = local_node.ok_or_else(|| SyncError::IntegrityError {
                    context: format!("missing local node {}", remote.id),
                })?;
                (node.payload.clone().unwrap_or(Value::Null), node)
            };
            node.updated_at = now;

            let new_meta = NodeSyncMeta {
                node_id: remote.id.clone(),
                vector,
                last_modifier: meta.last_modifier.clone(),
                last_modified_at: meta.last_modified_at.max(remote.last_modified_at.unwrap_or(now)),
                last_synced_at: meta.last_synced_at,
                status: SyncStatus::Pending,
                content_checksum: Some(local_checksum),
            };
            self.store.commit_synced(&node, &new_meta, &payload, now)?;
            report.merged += 1;
            tracing::debug!(node_id = %remote.id, "Identical-checksum concurrency merged");
            return Ok(());
        }

        // Field-level merge is unavailable; present both payloads
        // whole for user resolution.
        let local_payload = self
            .store
            .get_node(&remote.id)?
            .and_then(|n| n.payload)
            .unwrap_or(Value::Null);
        let (remote_payload, _) = self.materialize_remote(remote, now)?;

        let conflict = UnresolvedConflict::new(
            &remote.id,
            meta.vector.clone(),
            remote.version.clone(),
            vec![FieldConflict {
                field: "*".into(),
                local_value: Some(local_payload),
                remote_value: Some(remote_payload),
                local_ts: meta.last_modified_at,
                remote_ts: remote.last_modified_at.unwrap_or(now),
            }],
            self.config.conflict.history_retention_days,
        );
        self.store.put_conflict(&conflict)?;

        let mut conflicted_meta = meta.clone();
        conflicted_meta.status = SyncStatus::Conflict;
        self.store.upsert_meta(&conflicted_meta)?;

        report.conflicts_recorded += 1;
        tracing::info!(node_id = %remote.id, "Private-tier checksum conflict recorded");
        Ok(())
    }

    fn observe_server_time(&self, server_time: DateTime<Utc>) -> Result<()> {
        let mut drift = self.drift.lock();
        drift.observe(server_time, Utc::now());
        let value = drift.drift_ms();
        drop(drift);
        self.store.set_drift_ms(value)?;
        self.device_drift(value)
    }

    fn device_drift(&self, drift_ms: f64) -> Result<()> {
        if let Some(mut device) = self.store.get_device(&self.device.device_id)? {
            device.clock_drift_ms = drift_ms;
            self.store.upsert_device(&device)?;
        }
        Ok(())
    }

    // ── Conflict resolution & notifications ─────────────────────

    /// Resolve a conflicted node. The chosen payload becomes a new
    /// local write, so its vector dominates both prior versions; the
    /// losing side lands in conflict history.
    pub fn resolve_conflict(
        &self,
        node_id: &str,
        resolution: ConflictResolution,
        resolver: Resolver,
    ) -> Result<()> {
        // Held across the vector fold-in and the resolving write so a
        // concurrent writer cannot slip an increment in between.
        let lock = self.node_lock(node_id);
        let _guard = lock.lock();

        let Some(conflict) = self.store.get_conflict(node_id)? else {
            return Ok(());
        };

        // The resolution write must dominate both prior versions, so
        // fold the remote vector in before the write increments ours.
        if let Some(mut meta) = self.store.get_meta(node_id)? {
            meta.vector.merge(&conflict.remote_version);
            self.store.upsert_meta(&meta)?;
        }

        let current = self.read_node(node_id)?.unwrap_or(Value::Null);
        let (chosen, rejected_version) = match resolution {
            ConflictResolution::KeepLocal => (current, conflict.remote_version.clone()),
            ConflictResolution::KeepRemote => {
                let remote = conflict
                    .conflicts
                    .iter()
                    .find(|c| c.field == "*")
                    .and_then(|c| c.remote_value.clone())
                    .unwrap_or_else(|| {
                        // Field-level conflict: apply the remote side
                        // of each conflicted field onto the partial
                        // merge.
                        let mut merged = current.clone();
                        for fc in &conflict.conflicts {
                            match &fc.remote_value {
                                Some(v) => crate::model::set_path(&mut merged, &fc.field, v.clone()),
                                None => crate::model::remove_path(&mut merged, &fc.field),
                            }
                        }
                        merged
                    });
                (remote, conflict.local_version.clone())
            }
            ConflictResolution::Manual(payload) => (payload, conflict.remote_version.clone()),
        };

        self.write_node_locked(node_id, &chosen, 0)?;

        self.store.add_history(&ConflictHistoryEntry::new(
            node_id,
            rejected_version,
            resolver,
            self.config.conflict.history_retention_days,
        ))?;
        self.store.remove_conflict(node_id)?;

        tracing::info!(node_id, resolver = resolver.as_str(), "Conflict resolved");
        Ok(())
    }

    pub fn badge_state(&self) -> Result<BadgeState> {
        Ok(BadgeState::from_count(self.store.conflict_count()?))
    }

    pub fn banner_state(&self) -> Result<bool> {
        Ok(banner_visible(
            self.store.conflict_count()?,
            self.store.banner_dismissed_at()?,
            self.config.conflict.banner_cooldown_ms,
            Utc::now(),
        ))
    }

    pub fn dismiss_banner(&self) -> Result<()> {
        self.store.set_banner_dismissed_at(Utc::now())
    }

    /// Periodic housekeeping: expire conflict rows and compact
    /// oversized vectors at quiescence.
    pub fn run_maintenance(&self) -> Result<()> {
        let removed = self.store.gc_expired_conflicts(Utc::now())?;
        if removed > 0 {
            tracing::info!(removed, "Expired conflict rows deleted");
        }

        let last_active = self.store.last_active_map()?;
        let now = Utc::now();
        for meta in self.store.list_pending(usize::MAX)? {
            self.compact_vector(&meta.node_id, &last_active, now)?;
        }
        Ok(())
    }

    fn compact_vector(
        &self,
        node_id: &str,
        last_active: &HashMap<String, DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let lock = self.node_lock(node_id);
        let _guard = lock.lock();

        // Re-read under the lock: the listing snapshot may predate a
        // concurrent write's increment, and persisting a compaction
        // of that stale vector would clobber it.
        let Some(meta) = self.store.get_meta(node_id)? else {
            return Ok(());
        };
        let compacted = meta.vector.compact(last_active, &self.config.compaction, now);
        if compacted != meta.vector {
            let mut updated = meta;
            updated.vector = compacted;
            self.store.upsert_meta(&updated)?;
            tracing::debug!(node_id, "Vector compacted");
        }
        Ok(())
    }

    // ── Health & capabilities ───────────────────────────────────

    pub fn set_token_validity(&self, tokens: TokenValidity) {
        *self.tokens.lock() = tokens;
    }

    /// Current connectivity classification.
    pub fn health_state(&self) -> HealthState {
        let tokens = *self.tokens.lock();
        let last_online = self
            .store
            .last_online_at()
            .ok()
            .flatten()
            .unwrap_or_else(Utc::now);
        classify(
            Utc::now() - last_online,
            tokens.access_valid,
            tokens.refresh_valid,
        )
    }

    pub fn capabilities(&self) -> Capabilities {
        capabilities(self.health_state(), self.tier)
    }

    // ── Diagnostics ─────────────────────────────────────────────

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Clear a halt after the user intervened (e.g. upgraded).
    pub fn clear_error(&self) {
        *self.last_error.lock() = None;
        self.halted.store(false, Ordering::SeqCst);
    }

    pub fn pending_count(&self) -> Result<u64> {
        self.store.count_by_status(SyncStatus::Pending)
    }

    pub fn queue_depth(&self) -> Result<usize> {
        self.store.queue_len()
    }
}

fn sealed_from_wire(remote: &PushPayload) -> Result<SealedNode> {
    let b64 = base64::engine::general_purpose::STANDARD;
    let decode = |field: &Option<String>, name: &str| -> Result<Option<Vec<u8>>> {
        field
            .as_ref()
            .map(|raw| {
                b64.decode(raw).map_err(|_| SyncError::IntegrityError {
                    context: format!("invalid base64 in {name}"),
                })
            })
            .transpose()
    };

    let encrypted_payload =
        decode(&remote.encrypted_payload, "encrypted_payload")?.ok_or_else(|| {
            SyncError::IntegrityError {
                context: "private payload missing ciphertext".into(),
            }
        })?;
    let nonce_vec = decode(&remote.nonce, "nonce")?.unwrap_or_default();
    let nonce: [u8; 12] = nonce_vec
        .as_slice()
        .try_into()
        .map_err(|_| SyncError::IntegrityError {
            context: "invalid nonce length".into(),
        })?;

    Ok(SealedNode {
        encrypted_payload,
        encrypted_embedding: decode(&remote.encrypted_embedding, "encrypted_embedding")?,
        nonce,
        encryption_version: remote.encryption_version.unwrap_or(0),
        content_checksum: remote.content_checksum.clone().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::model::Platform;
    use crate::sync::relay::RelayConfig;
    use serde_json::json;

    fn make_engine(tier: PrivacyTier, name: &str) -> NousSyncEngine {
        let store = Arc::new(SyncStore::open_in_memory().unwrap());
        let device = DeviceRecord::generate(
            if name.starts_with("ios") {
                Platform::Ios
            } else {
                Platform::Mac
            },
            name,
        );
        let engine =
            NousSyncEngine::new(store, EngineConfig::default(), device, tier).unwrap();
        if tier == PrivacyTier::Private {
            engine.unlock_keys(b"shared-passkey-secret").unwrap();
        }
        engine
    }

    fn transport(core: &Arc<RelayCore>, engine: &NousSyncEngine) -> InProcessRelay {
        InProcessRelay {
            core: core.clone(),
            user_id: "user-1".into(),
            device_id: engine.device_id().to_string(),
            schema_version: SCHEMA_VERSION,
        }
    }

    async fn converge(
        a: &NousSyncEngine,
        b: &NousSyncEngine,
        ta: &InProcessRelay,
        tb: &InProcessRelay,
    ) {
        // Two rounds propagate merged results back out.
        for _ in 0..2 {
            a.sync_cycle(ta).await.unwrap();
            b.sync_cycle(tb).await.unwrap();
        }
        a.sync_cycle(ta).await.unwrap();
    }

    #[tokio::test]
    async fn write_then_sync_reaches_synced() {
        let engine = make_engine(PrivacyTier::Standard, "ios-phone");
        let core = Arc::new(RelayCore::new(RelayConfig::default()));
        let relay = transport(&core, &engine);

        engine
            .write_node("n1", &json!({"content": {"title": "hello"}}), 0)
            .unwrap();
        assert_eq!(engine.node_status("n1").unwrap(), Some(SyncStatus::Pending));

        let report = engine.sync_cycle(&relay).await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(engine.node_status("n1").unwrap(), Some(SyncStatus::Synced));
        assert_eq!(core.node_count("user-1"), 1);
    }

    #[tokio::test]
    async fn second_device_receives_remote_node() {
        let a = make_engine(PrivacyTier::Standard, "ios-phone");
        let b = make_engine(PrivacyTier::Standard, "mac-desk");
        let core = Arc::new(RelayCore::new(RelayConfig::default()));
        let (ta, tb) = (transport(&core, &a), transport(&core, &b));

        a.write_node("n1", &json!({"content": {"title": "from A"}}), 0)
            .unwrap();
        a.sync_cycle(&ta).await.unwrap();

        let report = b.sync_cycle(&tb).await.unwrap();
        assert_eq!(report.overwritten, 1);
        assert_eq!(
            b.read_node("n1").unwrap().unwrap().pointer("/content/title"),
            Some(&json!("from A"))
        );
        assert_eq!(b.node_status("n1").unwrap(), Some(SyncStatus::Synced));
    }

    #[tokio::test]
    async fn applying_the_same_payload_twice_is_a_noop() {
        let a = make_engine(PrivacyTier::Standard, "ios-phone");
        let b = make_engine(PrivacyTier::Standard, "mac-desk");
        let core = Arc::new(RelayCore::new(RelayConfig::default()));
        let (ta, tb) = (transport(&core, &a), transport(&core, &b));

        a.write_node("n1", &json!({"content": {"title": "x"}}), 0)
            .unwrap();
        a.sync_cycle(&ta).await.unwrap();
        b.sync_cycle(&tb).await.unwrap();

        // Reset the cursor to force a re-pull of the same payload
        b.store().set_pull_cursor("0").unwrap();
        let report = b.sync_cycle(&tb).await.unwrap();
        assert_eq!(report.discarded, 1);
        assert_eq!(report.overwritten, 0);
    }

    #[tokio::test]
    async fn concurrent_tag_edits_converge_to_the_union() {
        let a = make_engine(PrivacyTier::Standard, "ios-phone");
        let b = make_engine(PrivacyTier::Standard, "mac-desk");
        let core = Arc::new(RelayCore::new(RelayConfig::default()));
        let (ta, tb) = (transport(&core, &a), transport(&core, &b));

        // Shared base: tags [x]
        a.write_node("n1", &json!({"organization": {"tags": ["x"]}}), 0)
            .unwrap();
        a.sync_cycle(&ta).await.unwrap();
        b.sync_cycle(&tb).await.unwrap();

        // Concurrent edits from the same base
        a.write_node("n1", &json!({"organization": {"tags": ["x", "y"]}}), 0)
            .unwrap();
        b.write_node("n1", &json!({"organization": {"tags": ["x", "z"]}}), 0)
            .unwrap();

        converge(&a, &b, &ta, &tb).await;

        let tags = |engine: &NousSyncEngine| -> std::collections::HashSet<String> {
            engine
                .read_node("n1")
                .unwrap()
                .unwrap()
                .pointer("/organization/tags")
                .and_then(Value::as_array)
                .unwrap()
                .iter()
                .map(|t| t.as_str().unwrap().to_string())
                .collect()
        };

        let expected: std::collections::HashSet<String> =
            ["x", "y", "z"].iter().map(|s| s.to_string()).collect();
        assert_eq!(tags(&a), expected);
        assert_eq!(tags(&b), expected);
        assert_eq!(a.node_status("n1").unwrap(), Some(SyncStatus::Synced));
        assert_eq!(b.node_status("n1").unwrap(), Some(SyncStatus::Synced));
        assert_eq!(
            a.node_vector("n1").unwrap().unwrap(),
            b.node_vector("n1").unwrap().unwrap()
        );
    }

    #[tokio::test]
    async fn concurrent_body_edits_record_conflicts_and_merge_counters() {
        let a = make_engine(PrivacyTier::Standard, "ios-phone");
        let b = make_engine(PrivacyTier::Standard, "mac-desk");
        let core = Arc::new(RelayCore::new(RelayConfig::default()));
        let (ta, tb) = (transport(&core, &a), transport(&core, &b));

        let base = json!({"content": {"body": "base"}, "temporal": {"access_count": 10}});
        a.write_node("n1", &base, 0).unwrap();
        a.sync_cycle(&ta).await.unwrap();
        b.sync_cycle(&tb).await.unwrap();

        a.write_node(
            "n1",
            &json!({"content": {"body": "edit from A"}, "temporal": {"access_count": 11}}),
            0,
        )
        .unwrap();
        b.write_node(
            "n1",
            &json!({"content": {"body": "edit from B"}, "temporal": {"access_count": 11}}),
            0,
        )
        .unwrap();

        a.sync_cycle(&ta).await.unwrap();
        b.sync_cycle(&tb).await.unwrap();

        // B pulled A's concurrent payload: conflict on body, counter merged
        assert_eq!(b.node_status("n1").unwrap(), Some(SyncStatus::Conflict));
        let conflicts = b.store().list_conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflicts.len(), 1);
        assert_eq!(conflicts[0].conflicts[0].field, "content.body");

        // Delta-based counter: 10 + 1 + 1
        assert_eq!(
            b.read_node("n1")
                .unwrap()
                .unwrap()
                .pointer("/temporal/access_count"),
            Some(&json!(12))
        );

        assert_eq!(b.badge_state().unwrap().count, 1);
        assert!(b.banner_state().unwrap());
    }

    #[tokio::test]
    async fn conflict_resolution_dominates_and_files_history() {
        let a = make_engine(PrivacyTier::Standard, "ios-phone");
        let b = make_engine(PrivacyTier::Standard, "mac-desk");
        let core = Arc::new(RelayCore::new(RelayConfig::default()));
        let (ta, tb) = (transport(&core, &a), transport(&core, &b));

        a.write_node("n1", &json!({"content": {"body": "base"}}), 0)
            .unwrap();
        a.sync_cycle(&ta).await.unwrap();
        b.sync_cycle(&tb).await.unwrap();

        a.write_node("n1", &json!({"content": {"body": "A's body"}}), 0)
            .unwrap();
        b.write_node("n1", &json!({"content": {"body": "B's body"}}), 0)
            .unwrap();
        a.sync_cycle(&ta).await.unwrap();
        b.sync_cycle(&tb).await.unwrap();

        let vector_before = b.node_vector("n1").unwrap().unwrap();
        b.resolve_conflict("n1", ConflictResolution::KeepLocal, Resolver::User)
            .unwrap();

        // The resolution write dominates the merged vector
        let vector_after = b.node_vector("n1").unwrap().unwrap();
        assert_eq!(
            vector_after.compare(&vector_before),
            VectorOrdering::ADominates
        );
        assert_eq!(b.badge_state().unwrap().count, 0);
        assert_eq!(b.store().list_history("n1").unwrap().len(), 1);

        // Propagates cleanly: A adopts the resolution
        b.sync_cycle(&tb).await.unwrap();
        a.sync_cycle(&ta).await.unwrap();
        assert_eq!(
            a.read_node("n1").unwrap().unwrap().pointer("/content/body"),
            Some(&json!("B's body"))
        );
    }

    #[tokio::test]
    async fn schema_gate_halts_sync_without_retry() {
        let engine = make_engine(PrivacyTier::Standard, "ios-phone");
        let core = Arc::new(RelayCore::new(RelayConfig {
            min_schema_version: 2,
            ..RelayConfig::default()
        }));
        let relay = transport(&core, &engine);

        engine
            .write_node("n1", &json!({"content": {"title": "x"}}), 0)
            .unwrap();
        let err = engine.sync_cycle(&relay).await.unwrap_err();
        assert!(matches!(err, SyncError::SchemaTooOld { .. }));

        // Status is error; nothing was applied; no automatic retry
        assert!(engine.is_halted());
        assert!(engine
            .last_error()
            .unwrap()
            .contains("no longer supported"));
        assert_eq!(core.node_count("user-1"), 0);

        let err = engine.sync_cycle(&relay).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));

        engine.clear_error();
        assert!(!engine.is_halted());
    }

    #[tokio::test]
    async fn offline_writes_queue_and_drain_in_priority_order() {
        let engine = make_engine(PrivacyTier::Standard, "ios-phone");
        let core = Arc::new(RelayCore::new(RelayConfig::default()));
        let relay = transport(&core, &engine);

        // Medium offline: access token expired 48h ago, refresh valid
        engine
            .store()
            .set_last_online_at(Utc::now() - chrono::Duration::hours(48))
            .unwrap();
        engine.set_token_validity(TokenValidity {
            access_valid: false,
            refresh_valid: true,
        });
        assert_eq!(engine.health_state(), HealthState::MediumOffline);
        assert!(!engine.capabilities().can_sync);
        assert!(engine.capabilities().can_write);

        engine
            .write_node("n1", &json!({"content": {"title": "low"}}), 1)
            .unwrap();
        engine
            .write_node("n2", &json!({"content": {"title": "high"}}), 9)
            .unwrap();
        engine
            .write_node("n3", &json!({"content": {"title": "mid"}}), 5)
            .unwrap();
        assert_eq!(engine.queue_depth().unwrap(), 3);

        let order: Vec<String> = engine
            .store()
            .peek_queue(10)
            .unwrap()
            .into_iter()
            .map(|q| q.node_id)
            .collect();
        assert_eq!(order, ["n2", "n3", "n1"]);

        // Network returns
        engine.set_token_validity(TokenValidity::default());
        assert!(engine.capabilities().can_sync);

        let report = engine.sync_cycle(&relay).await.unwrap();
        assert_eq!(report.pushed, 3);
        assert_eq!(engine.queue_depth().unwrap(), 0);
        for id in ["n1", "n2", "n3"] {
            assert_eq!(engine.node_status(id).unwrap(), Some(SyncStatus::Synced));
        }
    }

    #[tokio::test]
    async fn queue_overflow_is_reported() {
        let store = Arc::new(SyncStore::open_in_memory().unwrap());
        let mut config = EngineConfig::default();
        config.sync.offline_queue_capacity = 2;
        let device = DeviceRecord::generate(Platform::Ios, "tiny-queue");
        let engine =
            NousSyncEngine::new(store, config, device, PrivacyTier::Standard).unwrap();

        engine
            .store()
            .set_last_online_at(Utc::now() - chrono::Duration::hours(48))
            .unwrap();
        engine.set_token_validity(TokenValidity {
            access_valid: false,
            refresh_valid: true,
        });

        engine.write_node("n1", &json!({"content": {"title": "a"}}), 0).unwrap();
        engine.write_node("n2", &json!({"content": {"title": "b"}}), 0).unwrap();
        let err = engine
            .write_node("n3", &json!({"content": {"title": "c"}}), 0)
            .unwrap_err();
        assert!(matches!(err, SyncError::OfflineQueueFull { capacity: 2 }));
    }

    #[tokio::test]
    async fn private_tier_round_trips_ciphertext() {
        let a = make_engine(PrivacyTier::Private, "ios-phone");
        let b = make_engine(PrivacyTier::Private, "mac-desk");
        b.import_key_versions(&a.store().list_key_versions().unwrap())
            .unwrap();
        let core = Arc::new(RelayCore::new(RelayConfig::default()));
        let (ta, tb) = (transport(&core, &a), transport(&core, &b));

        a.write_node("n1", &json!({"content": {"title": "secret"}}), 0)
            .unwrap();
        a.sync_cycle(&ta).await.unwrap();
        b.sync_cycle(&tb).await.unwrap();

        assert_eq!(
            b.read_node("n1").unwrap().unwrap().pointer("/content/title"),
            Some(&json!("secret"))
        );
    }

    #[tokio::test]
    async fn private_tier_identical_edits_do_not_conflict() {
        let a = make_engine(PrivacyTier::Private, "ios-phone");
        let b = make_engine(PrivacyTier::Private, "mac-desk");
        b.import_key_versions(&a.store().list_key_versions().unwrap())
            .unwrap();
        let core = Arc::new(RelayCore::new(RelayConfig::default()));
        let (ta, tb) = (transport(&core, &a), transport(&core, &b));

        a.write_node("n1", &json!({"content": {"title": "base"}}), 0)
            .unwrap();
        a.sync_cycle(&ta).await.unwrap();
        b.sync_cycle(&tb).await.unwrap();

        // Semantically identical concurrent edits → identical
        // plaintext → identical checksums
        let same = json!({"content": {"title": "identical edit"}});
        a.write_node("n1", &same, 0).unwrap();
        b.write_node("n1", &same, 0).unwrap();

        converge(&a, &b, &ta, &tb).await;

        assert_eq!(a.badge_state().unwrap().count, 0);
        assert_eq!(b.badge_state().unwrap().count, 0);
        assert_eq!(
            b.read_node("n1").unwrap().unwrap().pointer("/content/title"),
            Some(&json!("identical edit"))
        );
        assert_eq!(a.node_status("n1").unwrap(), Some(SyncStatus::Synced));
    }

    #[tokio::test]
    async fn private_tier_differing_edits_surface_whole_blob_conflict() {
        let a = make_engine(PrivacyTier::Private, "ios-phone");
        let b = make_engine(PrivacyTier::Private, "mac-desk");
        b.import_key_versions(&a.store().list_key_versions().unwrap())
            .unwrap();
        let core = Arc::new(RelayCore::new(RelayConfig::default()));
        let (ta, tb) = (transport(&core, &a), transport(&core, &b));

        a.write_node("n1", &json!({"content": {"title": "base"}}), 0)
            .unwrap();
        a.sync_cycle(&ta).await.unwrap();
        b.sync_cycle(&tb).await.unwrap();

        a.write_node("n1", &json!({"content": {"title": "from A"}}), 0)
            .unwrap();
        b.write_node("n1", &json!({"content": {"title": "from B"}}), 0)
            .unwrap();
        a.sync_cycle(&ta).await.unwrap();
        b.sync_cycle(&tb).await.unwrap();

        // B sees a whole-blob conflict with both decrypted payloads
        let conflicts = b.store().list_conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflicts[0].field, "*");
        assert_eq!(
            conflicts[0].conflicts[0]
                .local_value
                .as_ref()
                .unwrap()
                .pointer("/content/title"),
            Some(&json!("from B"))
        );
        assert_eq!(
            conflicts[0].conflicts[0]
                .remote_value
                .as_ref()
                .unwrap()
                .pointer("/content/title"),
            Some(&json!("from A"))
        );

        // Resolution re-encrypts and dominates both sides
        b.resolve_conflict("n1", ConflictResolution::KeepRemote, Resolver::User)
            .unwrap();
        b.sync_cycle(&tb).await.unwrap();
        a.sync_cycle(&ta).await.unwrap();
        assert_eq!(
            a.read_node("n1").unwrap().unwrap().pointer("/content/title"),
            Some(&json!("from A"))
        );
    }

    #[tokio::test]
    async fn server_time_samples_update_drift() {
        let engine = make_engine(PrivacyTier::Standard, "ios-phone");
        let core = Arc::new(RelayCore::new(RelayConfig::default()));
        let relay = transport(&core, &engine);

        engine.sync_cycle(&relay).await.unwrap();
        // In-process server time is near-zero drift, but the sample
        // must be persisted.
        let persisted = engine.store().drift_ms().unwrap();
        assert!(persisted.abs() < 5_000.0);
    }

    #[test]
    fn maintenance_compacts_oversized_vectors() {
        let engine = make_engine(PrivacyTier::Standard, "ios-phone");

        // A node tracked by 11 devices, most long gone
        let mut vector = crate::sync::vector::VersionVector::default();
        let now = Utc::now();
        for i in 0..11 {
            vector.increment(&format!("web-old{i:02}"));
            let mut device = DeviceRecord::generate(Platform::Web, "old");
            device.device_id = format!("web-old{i:02}");
            device.last_active_at = if i < 8 {
                now - chrono::Duration::days(200)
            } else {
                now
            };
            engine.store().upsert_device(&device).unwrap();
        }
        engine
            .store()
            .upsert_meta(&NodeSyncMeta {
                node_id: "n1".into(),
                vector,
                last_modifier: "web-old00".into(),
                last_modified_at: now,
                last_synced_at: None,
                status: SyncStatus::Pending,
                content_checksum: None,
            })
            .unwrap();

        engine.run_maintenance().unwrap();

        let meta = engine.store().get_meta("n1").unwrap().unwrap();
        assert_eq!(meta.vector.active_len(), 3);
        assert_eq!(meta.vector.get(crate::sync::vector::INACTIVE_KEY), 8);
    }
}
