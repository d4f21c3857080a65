//! Memory engine orchestrating embedding, storage, indexing and enrichment.
//!
//! Provides the high-level async API for adding, searching, updating and
//! deleting notes, with LLM enrichment running in bounded background tasks.

mod audit;
mod crud;
mod enrich;
mod locks;
mod search;

// pub(crate): module internals hidden; public items re-exported explicitly via lib.rs
pub(crate) mod store;

pub use audit::AuditReport;
pub use store::{MAX_INPUT_LENGTH, MAX_SEARCH_LIMIT, MemoryEngine};
