//! mdr-testkit
//!
//! Test doubles for the ingestion pipeline: an in-memory store with real
//! per-key locks, a scripted source adapter, and payload fixtures.

pub mod fixtures;
mod memory_store;
mod scripted_source;

pub use memory_store::InMemoryStore;
pub use scripted_source::{ScriptedSource, Step};
