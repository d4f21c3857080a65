//! amem - persistent agentic memory for AI agents.
//!
//! Notes are stored durably with their embeddings, found again by semantic
//! search, and enriched in the background by a language model that derives
//! tags, a category, a short context and links to related notes.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use amem::{Config, MemoryEngine, OnnxEmbedder, build_provider};
//!
//! # async fn run() -> Result<(), amem::Error> {
//! let config = Config::load()?;
//! let embedder = Arc::new(
//!     OnnxEmbedder::load(&config.embedding_model, Some(&config.model_cache)).await?,
//! );
//! let llm = build_provider(&config.llm)?;
//! let engine = MemoryEngine::open(config, embedder, llm).await?;
//!
//! let id = engine
//!     .add_note("The user prefers dark mode", &["ui"], None)
//!     .await?;
//! engine.wait_for_enrichment(&id, Duration::from_secs(60)).await?;
//!
//! for note in engine.search_agentic("UI preferences", 5).await? {
//!     println!("{:.2}: {} {:?}", note.similarity.unwrap_or(0.0), note.content, note.tags);
//! }
//!
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//!
//! [`MemoryEngine`] is a cheap `Arc` handle: clone it into as many tasks as
//! needed. Searches run in parallel; mutations of one note are serialized.

pub mod config;
pub mod embedding;
pub mod enrichment;
pub mod errors;
pub mod index;
pub mod llm;
pub mod logging;
pub mod memory;
pub mod note;
pub mod sqlite;

// Re-export public API
pub use config::{Config, EnrichmentMode};
pub use embedding::{EMBEDDING_DIMS, EmbeddingProvider, HashingEmbedder, OnnxEmbedder};
pub use enrichment::{EnrichmentOutcome, EnrichmentPipeline, EnrichmentResult, NeighborSearch};
pub use errors::Error;
pub use index::{DistanceMetric, VectorIndex};
pub use llm::{LanguageModelProvider, LlmBackend, LlmConfig, build_provider};
pub use logging::init_logging;
pub use memory::{AuditReport, MAX_INPUT_LENGTH, MAX_SEARCH_LIMIT, MemoryEngine};
pub use note::{EnrichRequest, EnrichmentStatus, Note, NotePatch};
pub use sqlite::NoteStore;
