//! Transcript reconciliation: merges authoritative-but-lagging thread
//! snapshots with live event streams into one duplicate-free transcript.
//!
//! Everything here is synchronous; callers pass the current time in.

mod applier;
mod candidate;
pub mod config;
mod conversation;
pub mod error;
pub mod key;
pub mod lifecycle;
pub mod merge;
pub mod store;
pub mod text;

pub use applier::{EventOutcome, IgnoreReason};
pub use config::ReconcileConfig;
pub use conversation::{ConversationState, SnapshotApply};
pub use error::TranscriptError;
pub use key::{turn_prefix, KeyIndex, ReconciliationKey};
pub use lifecycle::{SnapshotTransition, TurnLifecycleTracker, TurnState};
pub use merge::{MergeOptions, MergeOutcome, MergeResult, ReconciliationEngine};
pub use store::TranscriptStore;
