//! mdr-reconcile
//!
//! Deterministic field-level merge of per-source snapshots into one
//! canonical record per key. Pure logic only; persistence and locking live
//! in mdr-db / mdr-runtime.

pub mod engine;
pub mod priority;

pub use engine::{merge, volatile_winner, MergeError, VolatileWinner};
pub use priority::{SourcePriority, DEFAULT_UNKNOWN_RANK};
