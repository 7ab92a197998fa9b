//! Sync wire protocol and relay client.
//!
//! Payload shapes shared by the client and the relay, plus the HTTP
//! client that pushes and pulls batches under the relay's 30-second
//! namespace lock.
//!
//! Every request carries `X-Device-Id` and `X-Schema-Version`; every
//! response carries `X-Server-Time`, which feeds the clock-drift
//! tracker. On schema mismatch the relay answers `426 Upgrade
//! Required` and no state changes.

use crate::error::{Result, SyncError};
use crate::sync::changeset::ChangeSet;
use crate::sync::vector::VersionVector;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Request header: originating device.
pub const HEADER_DEVICE_ID: &str = "X-Device-Id";
/// Request header: client schema version.
pub const HEADER_SCHEMA_VERSION: &str = "X-Schema-Version";
/// Request header: user namespace (auth-provider stand-in).
pub const HEADER_USER_ID: &str = "X-User-Id";
/// Response header: relay wall clock (RFC 3339).
pub const HEADER_SERVER_TIME: &str = "X-Server-Time";

/// Maximum payloads per pull batch.
pub const MAX_PULL_LIMIT: usize = 100;

// ── Wire types ──────────────────────────────────────────────────

/// One node's worth of changes on the wire.
///
/// Standard tier carries `change_set` and `data` in plaintext.
/// Private tier omits both; the relay sees only
/// `(id, version, encrypted blob, checksum)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPayload {
    pub id: String,
    pub version: VersionVector,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_set: Option<ChangeSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_checksum: Option<String>,
    /// Base64 AEAD ciphertext (Private tier).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_embedding: Option<String>,
    /// Base64 96-bit nonce (Private tier).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_version: Option<u32>,
    /// Drift-adjusted modification instant, the fold ordering input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<DateTime<Utc>>,
}

/// Body of `POST /sync/push`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub device_id: String,
    pub payloads: Vec<PushPayload>,
}

/// A payload the relay accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedRef {
    pub id: String,
}

/// A payload the relay rejected: the caller is behind or concurrent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRef {
    pub id: String,
    pub remote_version: VersionVector,
}

/// Reply to `POST /sync/push`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushResponse {
    pub applied: Vec<AppliedRef>,
    pub conflicts: Vec<ConflictRef>,
}

/// Reply to `GET /sync/pull`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub changes: Vec<PushPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub total_estimate: u64,
    pub batch_number: u64,
}

/// Body of a `426 Upgrade Required` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeRequired {
    pub min_version: String,
    pub upgrade_url: String,
    pub message: String,
}

/// Body of a `423 Locked` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRejection {
    /// Back-off hint.
    pub retry_after_ms: u64,
    /// True when the caller's own lock expired mid-operation.
    #[serde(default)]
    pub expired: bool,
}

/// Reply to `POST /sync/lock`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockGrant {
    pub token: String,
    pub ttl_ms: u64,
}

// ── HTTP client ─────────────────────────────────────────────────

/// A response body plus the relay's clock at reply time.
#[derive(Debug)]
pub struct Timed<T> {
    pub body: T,
    pub server_time: DateTime<Utc>,
}

/// HTTP client for the relay sync surface.
pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
    device_id: String,
    user_id: String,
    schema_version: u32,
    max_retries: u32,
    retry_base_delay_ms: u64,
}

impl RelayClient {
    pub fn new(
        base_url: &str,
        device_id: &str,
        user_id: &str,
        schema_version: u32,
        max_retries: u32,
        retry_base_delay_ms: u64,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            schema_version,
            max_retries,
            retry_base_delay_ms,
        }
    }

    /// Push a batch of payloads. Retries lock contention with
    /// jittered exponential backoff; schema and integrity failures
    /// surface immediately.
    pub async fn push(&self, payloads: Vec<PushPayload>) -> Result<Timed<PushResponse>> {
        let request = PushRequest {
            device_id: self.device_id.clone(),
            payloads,
        };
        self.with_retry(|| self.push_once(&request)).await
    }

    async fn push_once(&self, request: &PushRequest) -> Result<Timed<PushResponse>> {
        let response = self
            .http
            .post(format!("{}/sync/push", self.base_url))
            .header(HEADER_DEVICE_ID, &self.device_id)
            .header(HEADER_USER_ID, &self.user_id)
            .header(HEADER_SCHEMA_VERSION, self.schema_version.to_string())
            .json(request)
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        Self::decode(response).await
    }

    /// Pull one batch of changes after the cursor.
    pub async fn pull(
        &self,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Timed<PullResponse>> {
        let mut url = format!(
            "{}/sync/pull?limit={}",
            self.base_url,
            limit.min(MAX_PULL_LIMIT)
        );
        if let Some(cursor) = cursor {
            url.push_str(&format!("&cursor={cursor}"));
        }

        let send = || async {
            let response = self
                .http
                .get(&url)
                .header(HEADER_DEVICE_ID, &self.device_id)
                .header(HEADER_USER_ID, &self.user_id)
                .header(HEADER_SCHEMA_VERSION, self.schema_version.to_string())
                .send()
                .await
                .map_err(|e| SyncError::Transport(e.to_string()))?;
            Self::decode(response).await
        };
        self.with_retry(send).await
    }

    /// Explicitly acquire the namespace lock for a multi-step
    /// operation. The lock is implicit on push.
    pub async fn acquire_lock(&self) -> Result<Timed<LockGrant>> {
        let response = self
            .http
            .post(format!("{}/sync/lock", self.base_url))
            .header(HEADER_DEVICE_ID, &self.device_id)
            .header(HEADER_USER_ID, &self.user_id)
            .header(HEADER_SCHEMA_VERSION, self.schema_version.to_string())
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Self::decode(response).await
    }

    /// Release an explicitly held lock.
    pub async fn release_lock(&self) -> Result<()> {
        self.http
            .delete(format!("{}/sync/lock", self.base_url))
            .header(HEADER_DEVICE_ID, &self.device_id)
            .header(HEADER_USER_ID, &self.user_id)
            .header(HEADER_SCHEMA_VERSION, self.schema_version.to_string())
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn with_retry<T, F, Fut>(&self, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.backoff_delay(attempt, &e);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Relay call failed, backing off: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32, error: &SyncError) -> Duration {
        let base = match error {
            // Honor the relay's hint when it sent one
            SyncError::LockHeld { retry_after_ms } => *retry_after_ms,
            _ => self.retry_base_delay_ms,
        };
        let exp = base.saturating_mul(1 << attempt.min(8));
        let jitter = rand::thread_rng().gen_range(0..=base / 2 + 1);
        Duration::from_millis(exp + jitter)
    }

    /// Map an HTTP response to a typed result, extracting
    /// `X-Server-Time`.
    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<Timed<T>> {
        let server_time = response
            .headers()
            .get(HEADER_SERVER_TIME)
            .and_then(|raw| raw.to_str().ok())
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let status = response.status().as_u16();
        match status {
            200 => {
                let body = response
                    .json::<T>()
                    .await
                    .map_err(|e| SyncError::Transport(format!("malformed relay reply: {e}")))?;
                Ok(Timed { body, server_time })
            }
            423 => {
                let rejection = response
                    .json::<LockRejection>()
                    .await
                    .unwrap_or(LockRejection {
                        retry_after_ms: 1_000,
                        expired: false,
                    });
                if rejection.expired {
                    Err(SyncError::LockExpired)
                } else {
                    Err(SyncError::LockHeld {
                        retry_after_ms: rejection.retry_after_ms,
                    })
                }
            }
            426 => {
                let upgrade = response.json::<UpgradeRequired>().await.map_err(|e| {
                    SyncError::Transport(format!("malformed upgrade reply: {e}"))
                })?;
                Err(SyncError::SchemaTooOld {
                    min_version: upgrade.min_version,
                    upgrade_url: upgrade.upgrade_url,
                    message: upgrade.message,
                })
            }
            other => Err(SyncError::Transport(format!(
                "relay returned HTTP {other}"
            ))),
        }
    }
}
