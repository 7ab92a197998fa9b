//! Private-tier AEAD codec.
//!
//! Bridges the auto-merge engine (which needs plaintext) and the relay
//! (which never sees it). Payloads are AES-256-GCM encrypted under the
//! per-version content key; the checksum over the pre-encryption
//! plaintext is bound into the associated data, so the tag
//! authenticates both the ciphertext and the only comparison primitive
//! the relay ever sees.

use crate::crypto::keys::{KeyHierarchy, KeyPurpose};
use crate::error::{Result, SyncError};
use crate::sync::vector::VersionVector;
use aes_gcm::aead::{Aead, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Nonce size for AES-256-GCM (12 bytes / 96 bits).
const NONCE_SIZE: usize = 12;

/// An encrypted node body ready for the wire or local storage.
#[derive(Debug, Clone)]
pub struct SealedNode {
    pub encrypted_payload: Vec<u8>,
    pub encrypted_embedding: Option<Vec<u8>>,
    pub nonce: [u8; NONCE_SIZE],
    pub encryption_version: u32,
    pub content_checksum: String,
}

/// Hex SHA-256 over plaintext bytes — the content checksum.
pub fn content_checksum(plaintext: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext);
    hex::encode(hasher.finalize())
}

/// Encrypt a node payload (and optional embedding) under the given
/// key version.
pub fn seal_node(
    keys: &KeyHierarchy,
    version: u32,
    plaintext: &[u8],
    embedding: Option<&[u8]>,
) -> Result<SealedNode> {
    let checksum = content_checksum(plaintext);

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let content_key = keys.derived_for(version, KeyPurpose::Content)?;
    let cipher = Aes256Gcm::new_from_slice(content_key.reveal())
        .map_err(|e| SyncError::IntegrityError {
            context: format!("cipher init failed: {e}"),
        })?;

    let encrypted_payload = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: checksum.as_bytes(),
            },
        )
        .map_err(|e| SyncError::IntegrityError {
            context: format!("payload encryption failed: {e}"),
        })?;

    let encrypted_embedding = match embedding {
        Some(bytes) => {
            let embedding_key = keys.derived_for(version, KeyPurpose::Embedding)?;
            let cipher = Aes256Gcm::new_from_slice(embedding_key.reveal()).map_err(|e| {
                SyncError::IntegrityError {
                    context: format!("cipher init failed: {e}"),
                }
            })?;
            Some(
                cipher
                    .encrypt(nonce, bytes)
                    .map_err(|e| SyncError::IntegrityError {
                        context: format!("embedding encryption failed: {e}"),
                    })?,
            )
        }
        None => None,
    };

    Ok(SealedNode {
        encrypted_payload,
        encrypted_embedding,
        nonce: nonce_bytes,
        encryption_version: version,
        content_checksum: checksum,
    })
}

/// Decrypt a sealed node, dispatching on its `encryption_version`.
///
/// Fails with `KeyVersionMissing` for unknown versions and
/// `IntegrityError` when the AEAD tag or the checksum does not match.
pub fn open_node(keys: &KeyHierarchy, sealed: &SealedNode) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
    let content_key = keys.derived_for(sealed.encryption_version, KeyPurpose::Content)?;
    let cipher = Aes256Gcm::new_from_slice(content_key.reveal())
        .map_err(|e| SyncError::IntegrityError {
            context: format!("cipher init failed: {e}"),
        })?;

    let nonce = Nonce::from_slice(&sealed.nonce);
    let plaintext = cipher
        .decrypt(
            nonce,
            Payload {
                msg: &sealed.encrypted_payload,
                aad: sealed.content_checksum.as_bytes(),
            },
        )
        .map_err(|_| SyncError::IntegrityError {
            context: "AEAD tag verification failed".into(),
        })?;

    // The checksum rode in the associated data; re-verify it against
    // the recovered plaintext (I4).
    if content_checksum(&plaintext) != sealed.content_checksum {
        return Err(SyncError::IntegrityError {
            context: "content checksum mismatch after decryption".into(),
        });
    }

    let embedding = match &sealed.encrypted_embedding {
        Some(bytes) => {
            let embedding_key =
                keys.derived_for(sealed.encryption_version, KeyPurpose::Embedding)?;
            let cipher = Aes256Gcm::new_from_slice(embedding_key.reveal()).map_err(|e| {
                SyncError::IntegrityError {
                    context: format!("cipher init failed: {e}"),
                }
            })?;
            Some(
                cipher
                    .decrypt(nonce, bytes.as_slice())
                    .map_err(|_| SyncError::IntegrityError {
                        context: "embedding AEAD tag verification failed".into(),
                    })?,
            )
        }
        None => None,
    };

    Ok((plaintext, embedding))
}

/// Private-tier conflict detection.
///
/// The relay cannot compare fields, so conflict is declared iff the
/// checksums differ AND the version vectors are concurrent.
/// Semantically identical concurrent edits (same plaintext, same
/// checksum) resolve as non-conflict.
pub fn checksums_conflict(
    local_checksum: &str,
    remote_checksum: &str,
    local_vector: &VersionVector,
    remote_vector: &VersionVector,
) -> bool {
    local_checksum != remote_checksum && local_vector.is_concurrent_with(remote_vector)
}
