//! Synchronization core: version vectors, change sets, auto-merge,
//! and the push/pull protocol against the relay.

pub mod changeset;
pub mod engine;
pub mod merge;
pub mod protocol;
pub mod relay;
pub mod vector;

pub use changeset::{apply_change_set, compute_change_set, ChangeSet, FieldChange};
pub use engine::NousSyncEngine;
pub use merge::{auto_merge, MergeOutcome, MergeStatus};
pub use vector::{VectorOrdering, VersionVector};
