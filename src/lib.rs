//! Nous Sync Engine — the distributed synchronization core of the Nous
//! personal knowledge graph.
//!
//! Keeps a user's devices eventually consistent with a central relay
//! while tolerating arbitrary offline periods, concurrent edits, device
//! loss, schema upgrades, and two privacy modes (Standard: relay sees
//! plaintext; Private: relay sees only authenticated ciphertext).
//!
//! ## Architecture
//! - [`sync::vector`] — per-device logical clocks (compare/merge/compact)
//! - [`sync::changeset`] — field-level deltas against last-synced snapshots
//! - [`sync::merge`] — per-field auto-merge of concurrent change sets
//! - [`sync::protocol`] / [`sync::relay`] — push/pull under a 30 s relay lock
//! - [`crypto`] — Private-tier key hierarchy, AEAD codec, key rotation
//! - [`conflict`] — unresolved conflicts, history, notification state
//! - [`health`] — offline-state machine and capability gating

pub mod config;
pub mod conflict;
pub mod crypto;
pub mod error;
pub mod health;
pub mod model;
pub mod store;
pub mod sync;

pub use config::EngineConfig;
pub use error::SyncError;
pub use model::{DeviceRecord, NodePayload, Platform, PrivacyTier, SyncStatus};
pub use sync::engine::NousSyncEngine;
pub use sync::vector::{VectorOrdering, VersionVector};
