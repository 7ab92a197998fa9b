//! SQLite-backed engine store.
//!
//! The local database is the only shared mutable resource; every
//! state transition in the engine commits through it. One connection
//! behind a mutex, WAL mode for concurrent reads + crash safety.
//!
//! Tables:
//! - `nodes`: local node bodies (plaintext payload or Private-tier ciphertext)
//! - `node_meta`: per-node sync metadata (vector, status, checksum)
//! - `snapshots`: last-synced snapshots
//! - `devices`: every known peer device
//! - `unresolved_conflicts` / `conflict_history`: conflict store
//! - `offline_queue`: writes awaiting connectivity
//! - `key_versions` / `rotation_progress`: Private-tier key lifecycle
//! - `engine_state`: pull cursor, drift, notification cooldowns

use crate::conflict::{ConflictHistoryEntry, UnresolvedConflict};
use crate::crypto::keys::{KeyStatus, KeyVersionRecord, SALT_SIZE};
use crate::crypto::rotation::{RotationPhase, RotationProgress};
use crate::error::{Result, SyncError};
use crate::model::{DeviceRecord, Platform, Snapshot, SyncStatus};
use crate::sync::vector::VersionVector;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// Engine-state keys.
const STATE_PULL_CURSOR: &str = "pull_cursor";
const STATE_DRIFT_MS: &str = "clock_drift_ms";
const STATE_BANNER_DISMISSED_AT: &str = "banner_dismissed_at";
const STATE_LAST_ONLINE_AT: &str = "last_online_at";

/// A node as stored locally: plaintext payload on the Standard tier,
/// opaque ciphertext columns on the Private tier.
#[derive(Debug, Clone)]
pub struct StoredNode {
    pub node_id: String,
    pub node_type: String,
    pub payload: Option<Value>,
    pub encrypted_payload: Option<Vec<u8>>,
    pub encrypted_embedding: Option<Vec<u8>>,
    pub nonce: Option<Vec<u8>>,
    pub encryption_version: Option<u32>,
    pub content_checksum: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Per-node sync metadata.
#[derive(Debug, Clone)]
pub struct NodeSyncMeta {
    pub node_id: String,
    pub vector: VersionVector,
    pub last_modifier: String,
    pub last_modified_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub content_checksum: Option<String>,
}

/// One write waiting in the offline queue.
#[derive(Debug, Clone)]
pub struct QueuedWrite {
    pub id: i64,
    pub node_id: String,
    pub priority: i32,
    pub operation: Value,
    pub enqueued_at: DateTime<Utc>,
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

/// SQLite-backed store for one engine instance.
pub struct SyncStore {
    conn: Mutex<Connection>,
}

impl SyncStore {
    /// Open (or create) the engine database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    /// In-memory store for tests and ephemeral engines.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS nodes (
                node_id TEXT PRIMARY KEY,
                node_type TEXT NOT NULL DEFAULT 'memory',
                payload_json TEXT,
                encrypted_payload BLOB,
                encrypted_embedding BLOB,
                nonce BLOB,
                encryption_version INTEGER,
                content_checksum TEXT,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_nodes_encryption ON nodes(encryption_version);

            CREATE TABLE IF NOT EXISTS node_meta (
                node_id TEXT PRIMARY KEY,
                vector_json TEXT NOT NULL,
                last_modifier TEXT NOT NULL,
                last_modified_at INTEGER NOT NULL,
                last_synced_at INTEGER,
                status TEXT NOT NULL,
                content_checksum TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_meta_status ON node_meta(status);

            CREATE TABLE IF NOT EXISTS snapshots (
                node_id TEXT PRIMARY KEY,
                snapshot_json TEXT NOT NULL,
                synced_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                display_name TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_active_at INTEGER NOT NULL,
                clock_drift_ms REAL NOT NULL DEFAULT 0,
                schema_version INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS unresolved_conflicts (
                node_id TEXT PRIMARY KEY,
                local_version_json TEXT NOT NULL,
                remote_version_json TEXT NOT NULL,
                conflicts_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conflicts_expires ON unresolved_conflicts(expires_at);

            CREATE TABLE IF NOT EXISTS conflict_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id TEXT NOT NULL,
                rejected_version_json TEXT NOT NULL,
                resolved_at INTEGER NOT NULL,
                resolved_by TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_history_expires ON conflict_history(expires_at);

            CREATE TABLE IF NOT EXISTS offline_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                operation_json TEXT NOT NULL,
                enqueued_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_order ON offline_queue(priority DESC, enqueued_at ASC);

            CREATE TABLE IF NOT EXISTS key_versions (
                version INTEGER PRIMARY KEY,
                created_at INTEGER NOT NULL,
                derivation_salt BLOB NOT NULL,
                status TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS rotation_progress (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                phase TEXT NOT NULL,
                last_processed_id TEXT,
                new_version INTEGER NOT NULL,
                started_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS engine_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Nodes ───────────────────────────────────────────────────

    pub fn upsert_node(&self, node: &StoredNode) -> Result<()> {
        let conn = self.conn.lock();
        let payload_json = node
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT OR REPLACE INTO nodes
             (node_id, node_type, payload_json, encrypted_payload, encrypted_embedding,
              nonce, encryption_version, content_checksum, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                node.node_id,
                node.node_type,
                payload_json,
                node.encrypted_payload,
                node.encrypted_embedding,
                node.nonce,
                node.encryption_version,
                node.content_checksum,
                to_millis(node.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_node(&self, node_id: &str) -> Result<Option<StoredNode>> {
        let conn = self.conn.lock();
        let node = conn
            .query_row(
                "SELECT node_id, node_type, payload_json, encrypted_payload,
                        encrypted_embedding, nonce, encryption_version,
                        content_checksum, updated_at
                 FROM nodes WHERE node_id = ?1",
                params![node_id],
                row_to_node,
            )
            .optional()?;
        Ok(node)
    }

    /// Nodes still encrypted under an older key version, in id order
    /// after the cursor. Drives the rotation re-encryption pass.
    pub fn nodes_below_version(
        &self,
        version: u32,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredNode>> {
        let conn = self.conn.lock();
        let cursor = after.unwrap_or("");
        let mut stmt = conn.prepare(
            "SELECT node_id, node_type, payload_json, encrypted_payload,
                    encrypted_embedding, nonce, encryption_version,
                    content_checksum, updated_at
             FROM nodes
             WHERE encryption_version IS NOT NULL
               AND encryption_version < ?1
               AND node_id > ?2
             ORDER BY node_id ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![version, cursor, limit as i64], row_to_node)?;
        let mut nodes = Vec::new();
        for row in rows {
            nodes.push(row?);
        }
        Ok(nodes)
    }

    pub fn count_encrypted_nodes(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM nodes WHERE encryption_version IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// All encrypted node ids (verification sampling pool).
    pub fn encrypted_node_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT node_id FROM nodes WHERE encryption_version IS NOT NULL ORDER BY node_id",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    // ── Node sync metadata ──────────────────────────────────────

    pub fn upsert_meta(&self, meta: &NodeSyncMeta) -> Result<()> {
        let conn = self.conn.lock();
        insert_meta(&conn, meta)?;
        Ok(())
    }

    pub fn get_meta(&self, node_id: &str) -> Result<Option<NodeSyncMeta>> {
        let conn = self.conn.lock();
        let meta = conn
            .query_row(
                "SELECT node_id, vector_json, last_modifier, last_modified_at,
                        last_synced_at, status, content_checksum
                 FROM node_meta WHERE node_id = ?1",
                params![node_id],
                row_to_meta,
            )
            .optional()?;
        Ok(meta)
    }

    /// Node ids whose local changes await the next push.
    pub fn list_pending(&self, limit: usize) -> Result<Vec<NodeSyncMeta>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT node_id, vector_json, last_modifier, last_modified_at,
                    last_synced_at, status, content_checksum
             FROM node_meta WHERE status = 'pending'
             ORDER BY last_modified_at ASC LIMIT ?1",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], row_to_meta)?;
        let mut metas = Vec::new();
        for row in rows {
            metas.push(row?);
        }
        Ok(metas)
    }

    pub fn count_by_status(&self, status: SyncStatus) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM node_meta WHERE status = ?1",
            params![status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ── Snapshots ───────────────────────────────────────────────

    pub fn put_snapshot(&self, node_id: &str, snapshot: &Value, synced_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        insert_snapshot(&conn, node_id, snapshot, synced_at)?;
        Ok(())
    }

    pub fn get_snapshot(&self, node_id: &str) -> Result<Option<Snapshot>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT node_id, snapshot_json, synced_at FROM snapshots WHERE node_id = ?1",
                params![node_id],
                |row| {
                    let node_id: String = row.get(0)?;
                    let snapshot_json: String = row.get(1)?;
                    let synced_at: i64 = row.get(2)?;
                    Ok((node_id, snapshot_json, synced_at))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((node_id, snapshot_json, synced_at)) => Ok(Some(Snapshot {
                node_id,
                snapshot: serde_json::from_str(&snapshot_json)?,
                synced_at: from_millis(synced_at),
            })),
        }
    }

    /// Commit `(node, meta, snapshot)` in one transaction — the apply
    /// of a merged or remote payload must be atomic.
    pub fn commit_synced(
        &self,
        node: &StoredNode,
        meta: &NodeSyncMeta,
        snapshot: &Value,
        synced_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let payload_json = node
                .payload
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            tx.execute(
                "INSERT OR REPLACE INTO nodes
                 (node_id, node_type, payload_json, encrypted_payload, encrypted_embedding,
                  nonce, encryption_version, content_checksum, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    node.node_id,
                    node.node_type,
                    payload_json,
                    node.encrypted_payload,
                    node.encrypted_embedding,
                    node.nonce,
                    node.encryption_version,
                    node.content_checksum,
                    to_millis(node.updated_at),
                ],
            )?;
            insert_meta(&tx, meta)?;
            insert_snapshot(&tx, &node.node_id, snapshot, synced_at)?;
        }
        tx.commit()?;
        Ok(())
    }

    // ── Devices ─────────────────────────────────────────────────

    pub fn upsert_device(&self, device: &DeviceRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO devices
             (device_id, platform, display_name, created_at, last_active_at,
              clock_drift_ms, schema_version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                device.device_id,
                device.platform.as_str(),
                device.display_name,
                to_millis(device.created_at),
                to_millis(device.last_active_at),
                device.clock_drift_ms,
                device.schema_version,
            ],
        )?;
        Ok(())
    }

    pub fn get_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let conn = self.conn.lock();
        let device = conn
            .query_row(
                "SELECT device_id, platform, display_name, created_at, last_active_at,
                        clock_drift_ms, schema_version
                 FROM devices WHERE device_id = ?1",
                params![device_id],
                row_to_device,
            )
            .optional()?;
        Ok(device)
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT device_id, platform, display_name, created_at, last_active_at,
                    clock_drift_ms, schema_version
             FROM devices ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_device)?;
        let mut devices = Vec::new();
        for row in rows {
            devices.push(row?);
        }
        Ok(devices)
    }

    /// device_id → last_active_at, for vector compaction.
    pub fn last_active_map(&self) -> Result<HashMap<String, DateTime<Utc>>> {
        Ok(self
            .list_devices()?
            .into_iter()
            .map(|d| (d.device_id, d.last_active_at))
            .collect())
    }

    pub fn touch_device(&self, device_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE devices SET last_active_at = ?2 WHERE device_id = ?1",
            params![device_id, to_millis(at)],
        )?;
        Ok(())
    }

    // ── Conflicts ───────────────────────────────────────────────

    pub fn put_conflict(&self, conflict: &UnresolvedConflict) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO unresolved_conflicts
             (node_id, local_version_json, remote_version_json, conflicts_json,
              created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conflict.node_id,
                serde_json::to_string(&conflict.local_version)?,
                serde_json::to_string(&conflict.remote_version)?,
                serde_json::to_string(&conflict.conflicts)?,
                to_millis(conflict.created_at),
                to_millis(conflict.expires_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_conflict(&self, node_id: &str) -> Result<Option<UnresolvedConflict>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT node_id, local_version_json, remote_version_json, conflicts_json,
                        created_at, expires_at
                 FROM unresolved_conflicts WHERE node_id = ?1",
                params![node_id],
                row_to_conflict_parts,
            )
            .optional()?;
        row.map(parts_to_conflict).transpose()
    }

    pub fn list_conflicts(&self) -> Result<Vec<UnresolvedConflict>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT node_id, local_version_json, remote_version_json, conflicts_json,
                    created_at, expires_at
             FROM unresolved_conflicts ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_conflict_parts)?;
        let mut conflicts = Vec::new();
        for row in rows {
            conflicts.push(parts_to_conflict(row?)?);
        }
        Ok(conflicts)
    }

    pub fn remove_conflict(&self, node_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM unresolved_conflicts WHERE node_id = ?1",
            params![node_id],
        )?;
        Ok(())
    }

    pub fn conflict_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM unresolved_conflicts", [], |row| {
                row.get(0)
            })?;
        Ok(count as u64)
    }

    pub fn add_history(&self, entry: &ConflictHistoryEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conflict_history
             (node_id, rejected_version_json, resolved_at, resolved_by, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.node_id,
                serde_json::to_string(&entry.rejected_version)?,
                to_millis(entry.resolved_at),
                entry.resolved_by.as_str(),
                to_millis(entry.expires_at),
            ],
        )?;
        Ok(())
    }

    pub fn list_history(&self, node_id: &str) -> Result<Vec<ConflictHistoryEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT node_id, rejected_version_json, resolved_at, resolved_by, expires_at
             FROM conflict_history WHERE node_id = ?1 ORDER BY resolved_at ASC",
        )?;
        let rows = stmt.query_map(params![node_id], |row| {
            let node_id: String = row.get(0)?;
            let rejected_json: String = row.get(1)?;
            let resolved_at: i64 = row.get(2)?;
            let resolved_by: String = row.get(3)?;
            let expires_at: i64 = row.get(4)?;
            Ok((node_id, rejected_json, resolved_at, resolved_by, expires_at))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (node_id, rejected_json, resolved_at, resolved_by, expires_at) = row?;
            entries.push(ConflictHistoryEntry {
                node_id,
                rejected_version: serde_json::from_str(&rejected_json)?,
                resolved_at: from_millis(resolved_at),
                resolved_by: crate::conflict::Resolver::parse(&resolved_by)
                    .unwrap_or(crate::conflict::Resolver::Auto),
                expires_at: from_millis(expires_at),
            });
        }
        Ok(entries)
    }

    /// Delete expired conflict rows and history entries. Returns the
    /// number of rows removed.
    pub fn gc_expired_conflicts(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock();
        let cutoff = to_millis(now);
        let a = conn.execute(
            "DELETE FROM unresolved_conflicts WHERE expires_at <= ?1",
            params![cutoff],
        )?;
        let b = conn.execute(
            "DELETE FROM conflict_history WHERE expires_at <= ?1",
            params![cutoff],
        )?;
        Ok(a + b)
    }

    // ── Offline queue ───────────────────────────────────────────

    /// Enqueue a write, enforcing the configured capacity.
    pub fn enqueue(
        &self,
        node_id: &str,
        priority: i32,
        operation: &Value,
        capacity: usize,
    ) -> Result<i64> {
        let conn = self.conn.lock();
        let len: i64 = conn.query_row("SELECT COUNT(*) FROM offline_queue", [], |row| row.get(0))?;
        if len as usize >= capacity {
            return Err(SyncError::OfflineQueueFull { capacity });
        }

        conn.execute(
            "INSERT INTO offline_queue (node_id, priority, operation_json, enqueued_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                node_id,
                priority,
                serde_json::to_string(operation)?,
                to_millis(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Queued writes in drain order: priority descending, FIFO within
    /// a priority.
    pub fn peek_queue(&self, limit: usize) -> Result<Vec<QueuedWrite>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, node_id, priority, operation_json, enqueued_at
             FROM offline_queue
             ORDER BY priority DESC, enqueued_at ASC, id ASC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let id: i64 = row.get(0)?;
            let node_id: String = row.get(1)?;
            let priority: i32 = row.get(2)?;
            let operation_json: String = row.get(3)?;
            let enqueued_at: i64 = row.get(4)?;
            Ok((id, node_id, priority, operation_json, enqueued_at))
        })?;

        let mut writes = Vec::new();
        for row in rows {
            let (id, node_id, priority, operation_json, enqueued_at) = row?;
            writes.push(QueuedWrite {
                id,
                node_id,
                priority,
                operation: serde_json::from_str(&operation_json)?,
                enqueued_at: from_millis(enqueued_at),
            });
        }
        Ok(writes)
    }

    pub fn remove_queued(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM offline_queue WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn queue_len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM offline_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    // ── Key versions ────────────────────────────────────────────

    pub fn put_key_version(&self, record: &KeyVersionRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO key_versions (version, created_at, derivation_salt, status)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.version,
                to_millis(record.created_at),
                record.derivation_salt.as_slice(),
                record.status.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn get_key_version(&self, version: u32) -> Result<Option<KeyVersionRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT version, created_at, derivation_salt, status
                 FROM key_versions WHERE version = ?1",
                params![version],
                row_to_key_version,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_key_versions(&self) -> Result<Vec<KeyVersionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT version, created_at, derivation_salt, status
             FROM key_versions ORDER BY version ASC",
        )?;
        let rows = stmt.query_map([], row_to_key_version)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn set_key_status(&self, version: u32, status: KeyStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE key_versions SET status = ?2 WHERE version = ?1",
            params![version, status.as_str()],
        )?;
        Ok(())
    }

    pub fn key_version_with_status(&self, status: KeyStatus) -> Result<Option<KeyVersionRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT version, created_at, derivation_salt, status
                 FROM key_versions WHERE status = ?1 ORDER BY version DESC LIMIT 1",
                params![status.as_str()],
                row_to_key_version,
            )
            .optional()?;
        Ok(record)
    }

    pub fn max_key_version(&self) -> Result<u32> {
        let conn = self.conn.lock();
        let max: Option<u32> =
            conn.query_row("SELECT MAX(version) FROM key_versions", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0))
    }

    // ── Rotation progress ───────────────────────────────────────

    pub fn save_rotation(&self, progress: &RotationProgress) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO rotation_progress
             (id, phase, last_processed_id, new_version, started_at)
             VALUES (1, ?1, ?2, ?3, ?4)",
            params![
                progress.phase.as_str(),
                progress.last_processed_id,
                progress.new_version,
                to_millis(progress.started_at),
            ],
        )?;
        Ok(())
    }

    pub fn load_rotation(&self) -> Result<Option<RotationProgress>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT phase, last_processed_id, new_version, started_at
                 FROM rotation_progress WHERE id = 1",
                [],
                |row| {
                    let phase: String = row.get(0)?;
                    let cursor: Option<String> = row.get(1)?;
                    let new_version: u32 = row.get(2)?;
                    let started_at: i64 = row.get(3)?;
                    Ok((phase, cursor, new_version, started_at))
                },
            )
            .optional()?;

        Ok(row.and_then(|(phase, cursor, new_version, started_at)| {
            Some(RotationProgress {
                phase: RotationPhase::parse(&phase)?,
                last_processed_id: cursor,
                new_version,
                started_at: from_millis(started_at),
            })
        }))
    }

    pub fn clear_rotation(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM rotation_progress WHERE id = 1", [])?;
        Ok(())
    }

    // ── Engine state ────────────────────────────────────────────

    fn set_state(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO engine_state (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn get_state(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM engine_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_pull_cursor(&self, cursor: &str) -> Result<()> {
        self.set_state(STATE_PULL_CURSOR, cursor)
    }

    pub fn pull_cursor(&self) -> Result<Option<String>> {
        self.get_state(STATE_PULL_CURSOR)
    }

    pub fn set_drift_ms(&self, drift: f64) -> Result<()> {
        self.set_state(STATE_DRIFT_MS, &drift.to_string())
    }

    pub fn drift_ms(&self) -> Result<f64> {
        Ok(self
            .get_state(STATE_DRIFT_MS)?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0.0))
    }

    pub fn set_banner_dismissed_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.set_state(STATE_BANNER_DISMISSED_AT, &to_millis(at).to_string())
    }

    pub fn banner_dismissed_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .get_state(STATE_BANNER_DISMISSED_AT)?
            .and_then(|raw| raw.parse().ok())
            .map(from_millis))
    }

    pub fn set_last_online_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.set_state(STATE_LAST_ONLINE_AT, &to_millis(at).to_string())
    }

    pub fn last_online_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .get_state(STATE_LAST_ONLINE_AT)?
            .and_then(|raw| raw.parse().ok())
            .map(from_millis))
    }
}

// ── Row mappers ─────────────────────────────────────────────────

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredNode> {
    let payload_json: Option<String> = row.get(2)?;
    let payload = payload_json
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    Ok(StoredNode {
        node_id: row.get(0)?,
        node_type: row.get(1)?,
        payload,
        encrypted_payload: row.get(3)?,
        encrypted_embedding: row.get(4)?,
        nonce: row.get(5)?,
        encryption_version: row.get(6)?,
        content_checksum: row.get(7)?,
        updated_at: from_millis(row.get(8)?),
    })
}

fn row_to_meta(row: &rusqlite::Row<'_>) -> rusqlite::Result<NodeSyncMeta> {
    let vector_json: String = row.get(1)?;
    let vector = serde_json::from_str(&vector_json)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
    let status_raw: String = row.get(5)?;
    let last_synced_at: Option<i64> = row.get(4)?;
    Ok(NodeSyncMeta {
        node_id: row.get(0)?,
        vector,
        last_modifier: row.get(2)?,
        last_modified_at: from_millis(row.get(3)?),
        last_synced_at: last_synced_at.map(from_millis),
        status: SyncStatus::parse(&status_raw).unwrap_or(SyncStatus::Pending),
        content_checksum: row.get(6)?,
    })
}

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceRecord> {
    let platform_raw: String = row.get(1)?;
    Ok(DeviceRecord {
        device_id: row.get(0)?,
        platform: Platform::parse(&platform_raw).unwrap_or(Platform::Web),
        display_name: row.get(2)?,
        created_at: from_millis(row.get(3)?),
        last_active_at: from_millis(row.get(4)?),
        clock_drift_ms: row.get(5)?,
        schema_version: row.get(6)?,
    })
}

fn row_to_key_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<KeyVersionRecord> {
    let salt_blob: Vec<u8> = row.get(2)?;
    let mut derivation_salt = [0u8; SALT_SIZE];
    if salt_blob.len() == SALT_SIZE {
        derivation_salt.copy_from_slice(&salt_blob);
    }
    let status_raw: String = row.get(3)?;
    Ok(KeyVersionRecord {
        version: row.get(0)?,
        created_at: from_millis(row.get(1)?),
        derivation_salt,
        status: KeyStatus::parse(&status_raw).unwrap_or(KeyStatus::Expired),
    })
}

type ConflictParts = (String, String, String, String, i64, i64);

fn row_to_conflict_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConflictParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn parts_to_conflict(parts: ConflictParts) -> Result<UnresolvedConflict> {
    let (node_id, local_json, remote_json, conflicts_json, created_at, expires_at) = parts;
    Ok(UnresolvedConflict {
        node_id,
        local_version: serde_json::from_str(&local_json)?,
        remote_version: serde_json::from_str(&remote_json)?,
        conflicts: serde_json::from_str(&conflicts_json)?,
        created_at: from_millis(created_at),
        expires_at: from_millis(expires_at),
    })
}

fn insert_meta(conn: &Connection, meta: &NodeSyncMeta) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO node_meta
         (node_id, vector_json, last_modifier, last_modified_at, last_synced_at,
          status, content_checksum)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            meta.node_id,
            serde_json::to_string(&meta.vector)?,
            meta.last_modifier,
            to_millis(meta.last_modified_at),
            meta.last_synced_at.map(to_millis),
            meta.status.as_str(),
            meta.content_checksum,
        ],
    )?;
    Ok(())
}

fn insert_snapshot(
    conn: &Connection,
    node_id: &str,
    snapshot: &Value,
    synced_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO snapshots (node_id, snapshot_json, synced_at)
         VALUES (?1, ?2, ?3)",
        params![
            node_id,
            serde_json::to_string(snapshot)?,
            to_millis(synced_at),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::Resolver;
    use crate::sync::merge::FieldConflict;
    use serde_json::json;

    fn store() -> SyncStore {
        SyncStore::open_in_memory().unwrap()
    }

    fn sample_node(id: &str) -> StoredNode {
        StoredNode {
            node_id: id.into(),
            node_type: "memory".into(),
            payload: Some(json!({"content": {"title": "t"}})),
            encrypted_payload: None,
            encrypted_embedding: None,
            nonce: None,
            encryption_version: None,
            content_checksum: None,
            updated_at: Utc::now(),
        }
    }

    fn sample_meta(id: &str, status: SyncStatus) -> NodeSyncMeta {
        let mut vector = VersionVector::default();
        vector.increment("ios-a");
        NodeSyncMeta {
            node_id: id.into(),
            vector,
            last_modifier: "ios-a".into(),
            last_modified_at: Utc::now(),
            last_synced_at: None,
            status,
            content_checksum: None,
        }
    }

    #[test]
    fn node_round_trip() {
        let store = store();
        store.upsert_node(&sample_node("n1")).unwrap();

        let loaded = store.get_node("n1").unwrap().unwrap();
        assert_eq!(loaded.node_id, "n1");
        assert_eq!(
            loaded.payload.unwrap().pointer("/content/title"),
            Some(&json!("t"))
        );
    }

    #[test]
    fn meta_round_trip_preserves_vector() {
        let store = store();
        store
            .upsert_meta(&sample_meta("n1", SyncStatus::Pending))
            .unwrap();

        let meta = store.get_meta("n1").unwrap().unwrap();
        assert_eq!(meta.vector.get("ios-a"), 1);
        assert_eq!(meta.status, SyncStatus::Pending);
    }

    #[test]
    fn pending_list_orders_by_modification_time() {
        let store = store();
        for id in ["n1", "n2", "n3"] {
            store.upsert_meta(&sample_meta(id, SyncStatus::Pending)).unwrap();
        }
        store.upsert_meta(&sample_meta("n4", SyncStatus::Synced)).unwrap();

        let pending = store.list_pending(10).unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(store.count_by_status(SyncStatus::Synced).unwrap(), 1);
    }

    #[test]
    fn snapshot_overwrite_is_atomic_per_node() {
        let store = store();
        let first = json!({"content": {"title": "v1"}});
        let second = json!({"content": {"title": "v2"}});

        store.put_snapshot("n1", &first, Utc::now()).unwrap();
        store.put_snapshot("n1", &second, Utc::now()).unwrap();

        let snapshot = store.get_snapshot("n1").unwrap().unwrap();
        assert_eq!(
            snapshot.snapshot.pointer("/content/title"),
            Some(&json!("v2"))
        );
    }

    #[test]
    fn commit_synced_writes_all_three() {
        let store = store();
        let node = sample_node("n1");
        let meta = sample_meta("n1", SyncStatus::Synced);
        let snapshot = node.payload.clone().unwrap();

        store
            .commit_synced(&node, &meta, &snapshot, Utc::now())
            .unwrap();

        assert!(store.get_node("n1").unwrap().is_some());
        assert_eq!(
            store.get_meta("n1").unwrap().unwrap().status,
            SyncStatus::Synced
        );
        assert!(store.get_snapshot("n1").unwrap().is_some());
    }

    #[test]
    fn devices_round_trip_and_last_active_map() {
        let store = store();
        let device = DeviceRecord::generate(Platform::Ios, "Kimberly's phone");
        store.upsert_device(&device).unwrap();

        let loaded = store.get_device(&device.device_id).unwrap().unwrap();
        assert_eq!(loaded.platform, Platform::Ios);

        let map = store.last_active_map().unwrap();
        assert!(map.contains_key(&device.device_id));
    }

    #[test]
    fn queue_drains_in_priority_then_fifo_order() {
        let store = store();
        store.enqueue("n1", 0, &json!({"op": "low"}), 100).unwrap();
        store.enqueue("n2", 5, &json!({"op": "high"}), 100).unwrap();
        store.enqueue("n3", 0, &json!({"op": "low2"}), 100).unwrap();

        let batch = store.peek_queue(10).unwrap();
        assert_eq!(batch[0].node_id, "n2"); // highest priority first
        assert_eq!(batch[1].node_id, "n1"); // then FIFO
        assert_eq!(batch[2].node_id, "n3");
    }

    #[test]
    fn queue_enforces_capacity() {
        let store = store();
        store.enqueue("n1", 0, &json!({}), 2).unwrap();
        store.enqueue("n2", 0, &json!({}), 2).unwrap();

        match store.enqueue("n3", 0, &json!({}), 2) {
            Err(SyncError::OfflineQueueFull { capacity: 2 }) => {}
            other => panic!("expected OfflineQueueFull, got {other:?}"),
        }
    }

    #[test]
    fn conflict_store_round_trip_and_gc() {
        let store = store();
        let now = Utc::now();

        let conflict = UnresolvedConflict {
            node_id: "n1".into(),
            local_version: VersionVector::default(),
            remote_version: VersionVector::default(),
            conflicts: vec![FieldConflict {
                field: "content.body".into(),
                local_value: Some(json!("a")),
                remote_value: Some(json!("b")),
                local_ts: now,
                remote_ts: now,
            }],
            created_at: now - chrono::Duration::days(31),
            expires_at: now - chrono::Duration::days(1), // already expired
        };
        store.put_conflict(&conflict).unwrap();
        assert_eq!(store.conflict_count().unwrap(), 1);

        let removed = store.gc_expired_conflicts(now).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.conflict_count().unwrap(), 0);
    }

    #[test]
    fn conflict_history_round_trip() {
        let store = store();
        let now = Utc::now();

        store
            .add_history(&ConflictHistoryEntry {
                node_id: "n1".into(),
                rejected_version: VersionVector::default(),
                resolved_at: now,
                resolved_by: Resolver::User,
                expires_at: now + chrono::Duration::days(30),
            })
            .unwrap();

        let history = store.list_history("n1").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].resolved_by, Resolver::User);
    }

    #[test]
    fn key_versions_track_status() {
        let store = store();
        store
            .put_key_version(&KeyVersionRecord::generate(1, KeyStatus::Active))
            .unwrap();
        store
            .put_key_version(&KeyVersionRecord::generate(2, KeyStatus::Rotating))
            .unwrap();

        assert_eq!(
            store
                .key_version_with_status(KeyStatus::Active)
                .unwrap()
                .unwrap()
                .version,
            1
        );
        assert_eq!(store.max_key_version().unwrap(), 2);

        store.set_key_status(2, KeyStatus::Active).unwrap();
        store.set_key_status(1, KeyStatus::Deprecated).unwrap();
        assert_eq!(
            store
                .key_version_with_status(KeyStatus::Active)
                .unwrap()
                .unwrap()
                .version,
            2
        );
    }

    #[test]
    fn key_version_salt_survives_round_trip() {
        let store = store();
        let record = KeyVersionRecord::generate(1, KeyStatus::Active);
        store.put_key_version(&record).unwrap();

        let loaded = store.get_key_version(1).unwrap().unwrap();
        assert_eq!(loaded.derivation_salt, record.derivation_salt);
    }

    #[test]
    fn rotation_progress_round_trip() {
        let store = store();
        let progress = RotationProgress {
            phase: RotationPhase::Reencrypting,
            last_processed_id: Some("node-47".into()),
            new_version: 2,
            started_at: Utc::now(),
        };
        store.save_rotation(&progress).unwrap();

        let loaded = store.load_rotation().unwrap().unwrap();
        assert_eq!(loaded.phase, RotationPhase::Reencrypting);
        assert_eq!(loaded.last_processed_id.as_deref(), Some("node-47"));
        assert_eq!(loaded.new_version, 2);

        store.clear_rotation().unwrap();
        assert!(store.load_rotation().unwrap().is_none());
    }

    #[test]
    fn nodes_below_version_pages_by_id() {
        let store = store();
        for i in 0..5 {
            let mut node = sample_node(&format!("node-{i:02}"));
            node.payload = None;
            node.encrypted_payload = Some(vec![1, 2, 3]);
            node.encryption_version = Some(1);
            store.upsert_node(&node).unwrap();
        }

        let first = store.nodes_below_version(2, None, 2).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].node_id, "node-00");

        let second = store
            .nodes_below_version(2, Some("node-01"), 10)
            .unwrap();
        assert_eq!(second.len(), 3);
        assert_eq!(second[0].node_id, "node-02");
    }

    #[test]
    fn engine_state_helpers() {
        let store = store();

        assert!(store.pull_cursor().unwrap().is_none());
        store.set_pull_cursor("cursor-42").unwrap();
        assert_eq!(store.pull_cursor().unwrap().as_deref(), Some("cursor-42"));

        assert_eq!(store.drift_ms().unwrap(), 0.0);
        store.set_drift_ms(-125.5).unwrap();
        assert_eq!(store.drift_ms().unwrap(), -125.5);

        let now = Utc::now();
        store.set_banner_dismissed_at(now).unwrap();
        let loaded = store.banner_dismissed_at().unwrap().unwrap();
        assert_eq!(loaded.timestamp_millis(), now.timestamp_millis());
    }
}
