//! Private-tier key hierarchy.
//!
//! Passkey-backed secret → HKDF-SHA-256 → versioned *master key*
//! (memory-only, never persisted) → three purpose keys
//! (content/embedding/metadata), re-derived on demand. The relay
//! stores no key material; a key-version record carries only the
//! derivation salt and a lifecycle status.
//!
//! Key handles zero their bytes on drop and cannot be formatted or
//! serialized — the raw bytes are reachable only through `reveal()`,
//! used by the AEAD codec.

use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::collections::HashMap;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of derivation salts and derived keys (bytes).
pub const SALT_SIZE: usize = 32;

/// HKDF info string for the master key stage.
const MASTER_INFO: &[u8] = b"nous-master";

// ── Key handles ─────────────────────────────────────────────────

/// A 256-bit master key. Memory-only; zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    /// Expose the raw bytes. Only the AEAD call sites use this.
    pub fn reveal(&self) -> &[u8; 32] {
        &self.0
    }

    /// Rewrap recovered bytes into a handle (mnemonic recovery path).
    pub(crate) fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey(<redacted>)")
    }
}

/// A purpose-scoped key derived from a master key.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; 32]);

impl DerivedKey {
    /// Expose the raw bytes. Only the AEAD call sites use this.
    pub fn reveal(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

/// What a derived key is allowed to encrypt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPurpose {
    Content,
    Embedding,
    Metadata,
}

impl KeyPurpose {
    /// Fixed HKDF info string for this purpose (wire contract).
    pub fn info(&self) -> &'static [u8] {
        match self {
            KeyPurpose::Content => b"nous-content",
            KeyPurpose::Embedding => b"nous-embedding",
            KeyPurpose::Metadata => b"nous-metadata",
        }
    }
}

// ── Key version records ─────────────────────────────────────────

/// Lifecycle status of a key version.
///
/// A user owns an ordered list of versions; at most one is `active`
/// at a time and at most one is `rotating`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Active,
    Rotating,
    Deprecated,
    Expired,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Rotating => "rotating",
            KeyStatus::Deprecated => "deprecated",
            KeyStatus::Expired => "expired",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(KeyStatus::Active),
            "rotating" => Some(KeyStatus::Rotating),
            "deprecated" => Some(KeyStatus::Deprecated),
            "expired" => Some(KeyStatus::Expired),
            _ => None,
        }
    }
}

/// Persisted metadata for one key generation. Holds no key material.
#[derive(Debug, Clone)]
pub struct KeyVersionRecord {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub derivation_salt: [u8; SALT_SIZE],
    pub status: KeyStatus,
}

impl KeyVersionRecord {
    /// Create a record for a new version with a fresh random salt.
    pub fn generate(version: u32, status: KeyStatus) -> Self {
        let mut salt = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self {
            version,
            created_at: Utc::now(),
            derivation_salt: salt,
            status,
        }
    }
}

// ── Derivation ──────────────────────────────────────────────────

/// Derive the master key for a version from the passkey-backed secret
/// and that version's salt.
pub fn derive_master(secret: &[u8], salt: &[u8; SALT_SIZE]) -> MasterKey {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut okm = [0u8; 32];
    hkdf.expand(MASTER_INFO, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    MasterKey(okm)
}

/// Derive a purpose key from a master key.
pub fn derive_purpose(master: &MasterKey, purpose: KeyPurpose) -> DerivedKey {
    let hkdf = Hkdf::<Sha256>::new(None, master.reveal());
    let mut okm = [0u8; 32];
    hkdf.expand(purpose.info(), &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    DerivedKey(okm)
}

// ── Hierarchy ───────────────────────────────────────────────────

/// The passkey-backed secret, zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct RootSecret(Vec<u8>);

/// In-memory view of the user's key generations.
///
/// Holds the root secret (while unlocked) and the per-version salts;
/// masters and purpose keys are derived on demand and dropped after
/// use. `lock()` drops the secret — reads then fail with
/// `KeyVersionMissing` until the hierarchy is unlocked again.
pub struct KeyHierarchy {
    secret: Option<RootSecret>,
    salts: HashMap<u32, [u8; SALT_SIZE]>,
    active_version: Option<u32>,
}

impl KeyHierarchy {
    pub fn new() -> Self {
        Self {
            secret: None,
            salts: HashMap::new(),
            active_version: None,
        }
    }

    /// Install the passkey-backed secret.
    pub fn unlock(&mut self, secret: Vec<u8>) {
        self.secret = Some(RootSecret(secret));
    }

    /// Drop the secret; key material is zeroed. Call on background
    /// transition.
    pub fn lock(&mut self) {
        self.secret = None;
    }

    pub fn is_unlocked(&self) -> bool {
        self.secret.is_some()
    }

    /// Register a version's salt (and track the active version).
    pub fn register_version(&mut self, record: &KeyVersionRecord) {
        self.salts.insert(record.version, record.derivation_salt);
        if record.status == KeyStatus::Active {
            self.active_version = Some(record.version);
        }
    }

    /// The version new writes must use. While a rotation is in
    /// progress the caller passes the rotating version explicitly.
    pub fn active_version(&self) -> Option<u32> {
        self.active_version
    }

    pub fn set_active_version(&mut self, version: u32) {
        self.active_version = Some(version);
    }

    /// Derive the master key for a version.
    pub fn master_for(&self, version: u32) -> Result<MasterKey> {
        let secret = self
            .secret
            .as_ref()
            .ok_or(SyncError::KeyVersionMissing { version })?;
        let salt = self
            .salts
            .get(&version)
            .ok_or(SyncError::KeyVersionMissing { version })?;
        Ok(derive_master(&secret.0, salt))
    }

    /// Derive the purpose key for a version.
    pub fn derived_for(&self, version: u32, purpose: KeyPurpose) -> Result<DerivedKey> {
        let master = self.master_for(version)?;
        Ok(derive_purpose(&master, purpose))
    }
}

impl Default for KeyHierarchy {
    fn default() -> Self {
        Self::new()
    }
}
