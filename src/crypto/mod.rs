//! Private-tier cryptography: key hierarchy, AEAD codec, rotation,
//! and mnemonic recovery.

pub mod codec;
pub mod keys;
pub mod recovery;
pub mod rotation;

pub use codec::{open_node, seal_node, SealedNode};
pub use keys::{KeyHierarchy, KeyPurpose, KeyStatus, KeyVersionRecord, MasterKey};
pub use rotation::{RotationEngine, RotationEnvironment, RotationPhase, RotationProgress};
