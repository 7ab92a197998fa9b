//! Data model for synced nodes.
//!
//! A node is an opaque payload plus sync metadata. The payload is a
//! typed record whose syncable fields live in five sections (`content`,
//! `organization`, `neural`, `temporal`, `state`); everything else is
//! derived locally and never transmitted.
//!
//! The syncable field set is closed and versioned — it is part of the
//! wire contract, and adding a field is a protocol-version bump.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire protocol schema version advertised in `X-Schema-Version`.
pub const SCHEMA_VERSION: u32 = 1;

/// The closed set of syncable dotted field paths (13 entries).
pub const SYNCABLE_FIELDS: [&str; 13] = [
    "content.title",
    "content.body",
    "content.summary",
    "organization.tags",
    "organization.cluster_memberships",
    "neural.stability",
    "neural.retrievability",
    "neural.difficulty",
    "neural.importance",
    "temporal.last_accessed",
    "temporal.access_count",
    "state.lifecycle",
    "state.flags",
];

/// Length of the random token suffix in a device id.
const DEVICE_TOKEN_LEN: usize = 12;

// ── Payload ─────────────────────────────────────────────────────

/// Membership of a node in a cluster, with retrieval strength.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMembership {
    pub cluster_id: String,
    pub strength: f64,
    #[serde(default)]
    pub pinned: bool,
}

/// Prose content of a memory node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// User-facing organization: tags and cluster memberships.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrganizationSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_memberships: Option<Vec<ClusterMembership>>,
}

/// Spaced-repetition learning signals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NeuralSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stability: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrievability: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importance: Option<f64>,
}

/// Access recency and counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemporalSection {
    /// ISO-8601 instant of the most recent access.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_count: Option<i64>,
}

/// Lifecycle state and user flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<String>>,
}

/// The typed syncable payload of a node.
///
/// Sections serialize with absent (not null) missing fields so that
/// deep equality can tell "unset" from "explicitly null".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePayload {
    #[serde(default)]
    pub content: ContentSection,
    #[serde(default)]
    pub organization: OrganizationSection,
    #[serde(default)]
    pub neural: NeuralSection,
    #[serde(default)]
    pub temporal: TemporalSection,
    #[serde(default)]
    pub state: StateSection,
}

impl NodePayload {
    /// Serialize into the JSON value form that diff/merge operate on.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Deserialize from the JSON value form. Unknown sections are dropped.
    pub fn from_value(value: &Value) -> serde_json::Result<Self> {
        serde_json::from_value(value.clone())
    }
}

// ── Dotted-path access ──────────────────────────────────────────

/// Read a dotted path out of a JSON value.
///
/// Missing intermediate containers read as `None` (never a panic).
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Write a dotted path into a JSON value, creating intermediate
/// objects as needed. A non-object intermediate is replaced.
pub fn set_path(value: &mut Value, path: &str, new_value: Value) {
    let mut current = value;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(serde_json::Map::new());
        }
        let map = current.as_object_mut().expect("just ensured object");
        if i == segments.len() - 1 {
            map.insert((*segment).to_string(), new_value);
            return;
        }
        current = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
}

/// Remove a dotted path from a JSON value. No-op if absent.
pub fn remove_path(value: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = value;
    for segment in &segments[..segments.len() - 1] {
        match current.get_mut(*segment) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Some(map) = current.as_object_mut() {
        map.remove(segments[segments.len() - 1]);
    }
}

/// Deep equality over JSON values.
///
/// `serde_json::Value` equality already compares sequences in order,
/// maps by key, and scalars without coercion; the wrapper exists so
/// callers compare `Option<&Value>` — distinguishing an absent field
/// from an explicit `null`.
pub fn deep_equal(a: Option<&Value>, b: Option<&Value>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Privacy mode for a user's namespace.
///
/// Standard: the relay sees plaintext and field-level merge happens
/// server-agnostically on each device. Private: the relay stores only
/// authenticated ciphertext plus a content checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivacyTier {
    Standard,
    Private,
}

// ── Sync metadata ───────────────────────────────────────────────

/// Sync status of a node on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Snapshot equals payload; vector is a prefix of or equal to the relay's.
    Synced,
    /// Local changes await the next push.
    Pending,
    /// At least one unresolved conflict exists for this node.
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Conflict => "conflict",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "synced" => Some(SyncStatus::Synced),
            "pending" => Some(SyncStatus::Pending),
            "conflict" => Some(SyncStatus::Conflict),
            _ => None,
        }
    }
}

/// Immutable record of the payload the relay held after the most
/// recent successful push/pull for a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub node_id: String,
    pub snapshot: Value,
    pub synced_at: DateTime<Utc>,
}

// ── Devices ─────────────────────────────────────────────────────

/// Platform a device runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Mac,
    Win,
    Web,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Android => "android",
            Platform::Mac => "mac",
            Platform::Win => "win",
            Platform::Web => "web",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ios" => Some(Platform::Ios),
            "android" => Some(Platform::Android),
            "mac" => Some(Platform::Mac),
            "win" => Some(Platform::Win),
            "web" => Some(Platform::Web),
            _ => None,
        }
    }
}

/// A device known to this user's sync mesh.
///
/// Device ids are prefixed with the platform plus a random 12-char
/// token and are never reassigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub platform: Platform,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// Exponential moving average of clock drift vs server time.
    pub clock_drift_ms: f64,
    pub schema_version: u32,
}

impl DeviceRecord {
    /// Generate a fresh device record for this platform.
    pub fn generate(platform: Platform, display_name: &str) -> Self {
        let now = Utc::now();
        Self {
            device_id: generate_device_id(platform),
            platform,
            display_name: display_name.to_string(),
            created_at: now,
            last_active_at: now,
            clock_drift_ms: 0.0,
            schema_version: SCHEMA_VERSION,
        }
    }
}

/// Build a device id of the form `{platform}-{12 random alphanumerics}`.
pub fn generate_device_id(platform: Platform) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let token: String = (0..DEVICE_TOKEN_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{}-{}", platform.as_str(), token)
}
