//! Mnemonic recovery for the Private-tier master key.
//!
//! A 24-word BIP-39 mnemonic encrypts a copy of the master key.
//! Losing the passkey plus the mnemonic is unrecoverable by design —
//! the relay cannot decrypt. Setup forces verification of three
//! random mnemonic words; a 7-day email-recoverable grace period
//! follows first activation.

use crate::crypto::keys::MasterKey;
use crate::error::{Result, SyncError};
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use bip39::Mnemonic;
use chrono::{DateTime, Duration, Utc};
use hkdf::Hkdf;
use rand::{Rng, RngCore};
use sha2::Sha256;

/// Nonce size for AES-256-GCM.
const NONCE_SIZE: usize = 12;

/// Entropy bytes for a 24-word mnemonic.
const MNEMONIC_ENTROPY_BYTES: usize = 32;

/// Words the user must re-enter at setup.
const VERIFY_WORD_COUNT: usize = 3;

/// Days after first activation during which email recovery works.
const GRACE_PERIOD_DAYS: i64 = 7;

/// HKDF info string for the mnemonic wrap key.
const WRAP_INFO: &[u8] = b"nous-recovery-wrap";

/// A freshly generated recovery kit: the mnemonic to show the user
/// once, and the wrapped master key to persist.
pub struct RecoveryKit {
    pub mnemonic: Mnemonic,
    /// `[nonce (12 bytes)][ciphertext]` of the master key bytes.
    pub wrapped_master: Vec<u8>,
}

/// Derive the AES wrap key from the mnemonic seed.
fn wrap_key(mnemonic: &Mnemonic) -> [u8; 32] {
    let seed = mnemonic.to_seed("");
    let hkdf = Hkdf::<Sha256>::new(None, &seed);
    let mut okm = [0u8; 32];
    hkdf.expand(WRAP_INFO, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// Generate a 24-word mnemonic and wrap a copy of the master key
/// under it.
pub fn generate_kit(master: &MasterKey) -> Result<RecoveryKit> {
    let mut entropy = [0u8; MNEMONIC_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut entropy);
    let mnemonic = Mnemonic::from_entropy(&entropy).map_err(|e| SyncError::IntegrityError {
        context: format!("mnemonic generation failed: {e}"),
    })?;

    let key = wrap_key(&mnemonic);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| SyncError::IntegrityError {
        context: format!("cipher init failed: {e}"),
    })?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, master.reveal().as_slice())
        .map_err(|e| SyncError::IntegrityError {
            context: format!("master key wrap failed: {e}"),
        })?;

    let mut wrapped_master = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    wrapped_master.extend_from_slice(&nonce_bytes);
    wrapped_master.extend_from_slice(&ciphertext);

    Ok(RecoveryKit {
        mnemonic,
        wrapped_master,
    })
}

/// Recover the master key from a mnemonic phrase and the persisted
/// wrapped copy.
pub fn recover_master(phrase: &str, wrapped: &[u8]) -> Result<MasterKey> {
    let mnemonic = Mnemonic::parse_normalized(phrase).map_err(|_| SyncError::IntegrityError {
        context: "invalid recovery mnemonic".into(),
    })?;

    if wrapped.len() < NONCE_SIZE {
        return Err(SyncError::IntegrityError {
            context: "wrapped master key too short".into(),
        });
    }
    let (nonce_bytes, ciphertext) = wrapped.split_at(NONCE_SIZE);

    let key = wrap_key(&mnemonic);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| SyncError::IntegrityError {
        context: format!("cipher init failed: {e}"),
    })?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| SyncError::IntegrityError {
            context: "mnemonic does not match wrapped master key".into(),
        })?;

    let bytes: [u8; 32] = plaintext
        .as_slice()
        .try_into()
        .map_err(|_| SyncError::IntegrityError {
            context: "recovered master key has wrong length".into(),
        })?;
    Ok(MasterKey::from_bytes(bytes))
}

/// Pick three distinct random word positions for setup verification.
pub fn verification_challenge(mnemonic: &Mnemonic) -> Vec<usize> {
    let word_count = mnemonic.word_count();
    let mut rng = rand::thread_rng();
    let mut indices = Vec::with_capacity(VERIFY_WORD_COUNT);
    while indices.len() < VERIFY_WORD_COUNT {
        let index = rng.gen_range(0..word_count);
        if !indices.contains(&index) {
            indices.push(index);
        }
    }
    indices
}

/// Check the user's answers against the mnemonic.
pub fn verify_words(mnemonic: &Mnemonic, answers: &[(usize, &str)]) -> bool {
    let words: Vec<&str> = mnemonic.words().collect();
    answers.len() == VERIFY_WORD_COUNT
        && answers.iter().all(|(index, answer)| {
            words
                .get(*index)
                .is_some_and(|word| word.eq_ignore_ascii_case(answer.trim()))
        })
}

/// The email-recoverable window after first activation.
#[derive(Debug, Clone, Copy)]
pub struct GracePeriod {
    pub activated_at: DateTime<Utc>,
}

impl GracePeriod {
    pub fn new(activated_at: DateTime<Utc>) -> Self {
        Self { activated_at }
    }

    /// True while email recovery is still possible.
    pub fn is_email_recoverable(&self, now: DateTime<Utc>) -> bool {
        now - self.activated_at < Duration::days(GRACE_PERIOD_DAYS)
    }
}
