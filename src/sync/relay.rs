//! The relay: authoritative store-and-forward point for a user's
//! devices.
//!
//! Holds the latest payload per node, enforces the 30-second
//! per-user-namespace lock across pushes, gates requests on schema
//! version, and serves cursor-based pulls. For Private-tier users the
//! relay only ever sees `(id, version, encrypted blob, checksum)`.
//!
//! The core is a plain state machine ([`RelayCore`]) so tests drive
//! it directly; the axum router wraps it for HTTP.

use crate::error::{Result, SyncError};
use crate::model::SCHEMA_VERSION;
use crate::sync::protocol::{
    AppliedRef, ConflictRef, LockGrant, LockRejection, PullResponse, PushPayload, PushRequest,
    PushResponse, UpgradeRequired, HEADER_DEVICE_ID, HEADER_SCHEMA_VERSION, HEADER_SERVER_TIME,
    HEADER_USER_ID, MAX_PULL_LIMIT,
};
use crate::sync::vector::VectorOrdering;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lock TTL: a device holding the namespace lock past this loses it.
pub const LOCK_TTL: Duration = Duration::from_secs(30);

/// Relay-side tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Clients below this schema version get `426 Upgrade Required`.
    pub min_schema_version: u32,
    pub upgrade_url: String,
    pub lock_ttl: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            min_schema_version: SCHEMA_VERSION,
            upgrade_url: "https://nous.app/upgrade".into(),
            lock_ttl: LOCK_TTL,
        }
    }
}

/// The namespace lock held during a push.
#[derive(Debug, Clone)]
struct NamespaceLock {
    token: String,
    holder: String,
    expires_at: Instant,
}

/// One stored node payload plus its pull ordering.
#[derive(Debug, Clone)]
struct StoredPayload {
    payload: PushPayload,
    server_seq: u64,
}

#[derive(Default)]
struct Namespace {
    nodes: HashMap<String, StoredPayload>,
    lock: Option<NamespaceLock>,
    next_seq: u64,
}

/// In-memory relay state for all user namespaces.
pub struct RelayCore {
    namespaces: Mutex<HashMap<String, Namespace>>,
    config: RelayConfig,
}

impl RelayCore {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            namespaces: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn check_schema(&self, schema_version: u32) -> Result<()> {
        if schema_version < self.config.min_schema_version {
            return Err(SyncError::SchemaTooOld {
                min_version: self.config.min_schema_version.to_string(),
                upgrade_url: self.config.upgrade_url.clone(),
                message: format!(
                    "schema {} is no longer supported, minimum is {}",
                    schema_version, self.config.min_schema_version
                ),
            });
        }
        Ok(())
    }

    /// Explicitly acquire the namespace lock for multi-step
    /// operations.
    pub fn acquire_lock(&self, user_id: &str, device_id: &str) -> Result<LockGrant> {
        let mut namespaces = self.namespaces.lock();
        let namespace = namespaces.entry(user_id.to_string()).or_default();
        let now = Instant::now();

        if let Some(lock) = &namespace.lock {
            if lock.expires_at > now && lock.holder != device_id {
                return Err(SyncError::LockHeld {
                    retry_after_ms: remaining_ms(lock.expires_at, now),
                });
            }
        }

        let token = uuid::Uuid::new_v4().to_string();
        namespace.lock = Some(NamespaceLock {
            token: token.clone(),
            holder: device_id.to_string(),
            expires_at: now + self.config.lock_ttl,
        });

        tracing::debug!(user = %user_id, device = %device_id, "Namespace lock acquired");
        Ok(LockGrant {
            token,
            ttl_ms: self.config.lock_ttl.as_millis() as u64,
        })
    }

    /// Release the lock if the caller holds it.
    pub fn release_lock(&self, user_id: &str, device_id: &str) {
        let mut namespaces = self.namespaces.lock();
        if let Some(namespace) = namespaces.get_mut(user_id) {
            if namespace
                .lock
                .as_ref()
                .is_some_and(|lock| lock.holder == device_id)
            {
                namespace.lock = None;
                tracing::debug!(user = %user_id, device = %device_id, "Namespace lock released");
            }
        }
    }

    /// Apply a push batch under the namespace lock.
    ///
    /// Per payload: an incoming vector that dominates the stored one
    /// is applied; a dominated, concurrent, or equal-but-different
    /// payload is returned in `conflicts` with the stored version.
    pub fn push(
        &self,
        user_id: &str,
        device_id: &str,
        schema_version: u32,
        payloads: Vec<PushPayload>,
    ) -> Result<PushResponse> {
        self.check_schema(schema_version)?;

        let mut namespaces = self.namespaces.lock();
        let namespace = namespaces.entry(user_id.to_string()).or_default();
        let now = Instant::now();

        // Lock discipline: expired holders lose the lock and must
        // retry; live locks held by peers reject with a hint.
        let held_explicitly = match &namespace.lock {
            Some(lock) if lock.expires_at <= now => {
                let was_ours = lock.holder == device_id;
                namespace.lock = None;
                if was_ours {
                    return Err(SyncError::LockExpired);
                }
                false
            }
            Some(lock) if lock.holder != device_id => {
                return Err(SyncError::LockHeld {
                    retry_after_ms: remaining_ms(lock.expires_at, now),
                });
            }
            Some(_) => true,
            None => false,
        };

        // Implicit lock for the duration of this batch (the namespace
        // mutex serializes it; the record exists for observability).
        if !held_explicitly {
            namespace.lock = Some(NamespaceLock {
                token: uuid::Uuid::new_v4().to_string(),
                holder: device_id.to_string(),
                expires_at: now + self.config.lock_ttl,
            });
        }

        let mut response = PushResponse::default();
        for payload in payloads {
            match namespace.nodes.get(&payload.id) {
                None => {
                    apply(namespace, payload, &mut response);
                }
                Some(stored) => match payload.version.compare(&stored.payload.version) {
                    VectorOrdering::ADominates => {
                        apply(namespace, payload, &mut response);
                    }
                    VectorOrdering::Equal if same_content(&payload, &stored.payload) => {
                        // Idempotent re-push after a lost ack
                        response.applied.push(AppliedRef { id: payload.id });
                    }
                    _ => {
                        response.conflicts.push(ConflictRef {
                            id: payload.id.clone(),
                            remote_version: stored.payload.version.clone(),
                        });
                    }
                },
            }
        }

        if !held_explicitly {
            namespace.lock = None;
        }

        tracing::debug!(
            user = %user_id,
            device = %device_id,
            applied = response.applied.len(),
            conflicts = response.conflicts.len(),
            "Push processed"
        );
        Ok(response)
    }

    /// Serve one pull batch after the cursor.
    pub fn pull(
        &self,
        user_id: &str,
        schema_version: u32,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<PullResponse> {
        self.check_schema(schema_version)?;

        let limit = limit.clamp(1, MAX_PULL_LIMIT);
        let cursor_seq: u64 = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);

        let namespaces = self.namespaces.lock();
        let Some(namespace) = namespaces.get(user_id) else {
            return Ok(PullResponse {
                changes: Vec::new(),
                next_cursor: None,
                total_estimate: 0,
                batch_number: 1,
            });
        };

        let mut newer: Vec<&StoredPayload> = namespace
            .nodes
            .values()
            .filter(|stored| stored.server_seq > cursor_seq)
            .collect();
        newer.sort_by_key(|stored| stored.server_seq);

        let total_estimate = newer.len() as u64;
        let consumed = namespace
            .nodes
            .values()
            .filter(|stored| stored.server_seq <= cursor_seq)
            .count() as u64;

        let batch: Vec<PushPayload> = newer
            .iter()
            .take(limit)
            .map(|stored| stored.payload.clone())
            .collect();
        let next_cursor = if batch.is_empty() {
            None
        } else {
            newer
                .get(batch.len() - 1)
                .map(|stored| stored.server_seq.to_string())
        };

        Ok(PullResponse {
            changes: batch,
            next_cursor,
            total_estimate,
            batch_number: consumed / (limit as u64) + 1,
        })
    }

    /// Number of stored nodes for a user (diagnostics).
    pub fn node_count(&self, user_id: &str) -> usize {
        let namespaces = self.namespaces.lock();
        namespaces.get(user_id).map(|n| n.nodes.len()).unwrap_or(0)
    }
}

fn apply(namespace: &mut Namespace, payload: PushPayload, response: &mut PushResponse) {
    namespace.next_seq += 1;
    response.applied.push(AppliedRef {
        id: payload.id.clone(),
    });
    let seq = namespace.next_seq;
    namespace.nodes.insert(
        payload.id.clone(),
        StoredPayload {
            payload,
            server_seq: seq,
        },
    );
}

/// Equal vectors with equal content are an idempotent re-push.
/// Checksums compare when present (the only primitive for Private
/// tier); Standard-tier payloads without checksums compare data.
fn same_content(a: &PushPayload, b: &PushPayload) -> bool {
    match (&a.content_checksum, &b.content_checksum) {
        (Some(ca), Some(cb)) => ca == cb,
        _ => a.data == b.data,
    }
}

fn remaining_ms(expires_at: Instant, now: Instant) -> u64 {
    expires_at.saturating_duration_since(now).as_millis() as u64
}

// ── HTTP surface ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PullParams {
    cursor: Option<String>,
    limit: Option<usize>,
}

/// Largest accepted request body (a full 100-payload batch with
/// embeddings fits comfortably).
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Build the relay router.
pub fn router(core: Arc<RelayCore>) -> Router {
    Router::new()
        .route("/sync/push", post(push_handler))
        .route("/sync/pull", get(pull_handler))
        .route("/sync/lock", post(lock_handler).delete(unlock_handler))
        .layer(tower_http::limit::RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(tower_http::timeout::TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(core)
}

/// Serve the relay on the given address until the task is dropped.
pub async fn serve(core: Arc<RelayCore>, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Relay listening");
    axum::serve(listener, router(core)).await?;
    Ok(())
}

struct RequestContext {
    user_id: String,
    device_id: String,
    schema_version: u32,
}

fn context(headers: &HeaderMap) -> RequestContext {
    let get = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let user = get(HEADER_USER_ID);
    RequestContext {
        user_id: if user.is_empty() {
            "default".to_string()
        } else {
            user
        },
        device_id: get(HEADER_DEVICE_ID),
        schema_version: get(HEADER_SCHEMA_VERSION).parse().unwrap_or(0),
    }
}

fn with_server_time(status: StatusCode, body: impl serde::Serialize) -> Response {
    (
        status,
        [(HEADER_SERVER_TIME, Utc::now().to_rfc3339())],
        Json(serde_json::to_value(body).unwrap_or_default()),
    )
        .into_response()
}

fn error_response(error: SyncError) -> Response {
    match error {
        SyncError::LockHeld { retry_after_ms } => with_server_time(
            StatusCode::LOCKED,
            LockRejection {
                retry_after_ms,
                expired: false,
            },
        ),
        SyncError::LockExpired => with_server_time(
            StatusCode::LOCKED,
            LockRejection {
                retry_after_ms: 0,
                expired: true,
            },
        ),
        SyncError::SchemaTooOld {
            min_version,
            upgrade_url,
            message,
        } => with_server_time(
            StatusCode::UPGRADE_REQUIRED,
            UpgradeRequired {
                min_version,
                upgrade_url,
                message,
            },
        ),
        other => {
            tracing::warn!("Relay internal error: {other}");
            with_server_time(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({"error": other.to_string()}),
            )
        }
    }
}

async fn push_handler(
    State(core): State<Arc<RelayCore>>,
    headers: HeaderMap,
    Json(request): Json<PushRequest>,
) -> Response {
    let ctx = context(&headers);
    match core.push(
        &ctx.user_id,
        &ctx.device_id,
        ctx.schema_version,
        request.payloads,
    ) {
        Ok(response) => with_server_time(StatusCode::OK, response),
        Err(error) => error_response(error),
    }
}

async fn pull_handler(
    State(core): State<Arc<RelayCore>>,
    headers: HeaderMap,
    Query(params): Query<PullParams>,
) -> Response {
    let ctx = context(&headers);
    match core.pull(
        &ctx.user_id,
        ctx.schema_version,
        params.cursor.as_deref(),
        params.limit.unwrap_or(MAX_PULL_LIMIT),
    ) {
        Ok(response) => with_server_time(StatusCode::OK, response),
        Err(error) => error_response(error),
    }
}

async fn lock_handler(State(core): State<Arc<RelayCore>>, headers: HeaderMap) -> Response {
    let ctx = context(&headers);
    match core.acquire_lock(&ctx.user_id, &ctx.device_id) {
        Ok(grant) => with_server_time(StatusCode::OK, grant),
        Err(error) => error_response(error),
    }
}

async fn unlock_handler(State(core): State<Arc<RelayCore>>, headers: HeaderMap) -> Response {
    let ctx = context(&headers);
    core.release_lock(&ctx.user_id, &ctx.device_id);
    with_server_time(StatusCode::OK, serde_json::json!({"released": true}))
}
