//! Core engine struct combining the note store, vector index and providers.

use std::collections::HashSet;
use std::path::{Component, Path};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Semaphore, watch};
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use super::locks::NoteLocks;
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::enrichment::{EnrichmentConfig, EnrichmentPipeline};
use crate::errors::Error;
use crate::index::{DistanceMetric, VectorIndex};
use crate::llm::LanguageModelProvider;
use crate::sqlite::NoteStore;
use crate::sqlite::embedding::check_finite;

/// Maximum allowed input length (100,000 characters).
pub const MAX_INPUT_LENGTH: usize = 100_000;
/// Maximum allowed limit for search operations.
pub const MAX_SEARCH_LIMIT: usize = 10_000;

const META_DIMENSIONS: &str = "dimensions";
const META_METRIC: &str = "metric";
const META_MODEL: &str = "embedding_model";

pub(crate) struct Inner {
    pub(crate) store: NoteStore,
    pub(crate) index: VectorIndex,
    pub(crate) embedder: Arc<dyn EmbeddingProvider>,
    pub(crate) pipeline: EnrichmentPipeline,
    pub(crate) config: Config,
    pub(crate) locks: NoteLocks,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) tracker: TaskTracker,
    /// Notes with an enrichment task queued or running.
    pub(crate) in_flight: Mutex<HashSet<String>>,
    /// Bumped whenever an enrichment task finishes.
    pub(crate) settled: watch::Sender<u64>,
}

/// Agentic memory engine: durable notes, semantic search and background
/// LLM enrichment.
///
/// Cheap to clone; all clones share one store, index and task pool. Every
/// operation takes `&self` and is safe to call concurrently.
#[derive(Clone)]
pub struct MemoryEngine {
    pub(crate) inner: Arc<Inner>,
}

impl MemoryEngine {
    /// Open (or create) the store described by `config`.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated before anything touches disk
    /// * `embedder` - Shared embedding provider; its dimensionality is fixed
    ///   into the store on first open
    /// * `llm` - Shared language-model backend used for enrichment
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Configuration is invalid
    /// - Database path contains path traversal sequences (e.g., "../")
    /// - The store was created with a different dimensionality or metric
    /// - The database or a stored embedding cannot be read
    pub async fn open(
        config: Config,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LanguageModelProvider>,
    ) -> Result<Self, Error> {
        config.validate()?;

        // Path traversal guard: reject parent directory components (works on all platforms)
        if config
            .database_path
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(Error::Config(
                "Invalid database path: contains '..' which may escape the intended directory"
                    .to_string(),
            ));
        }
        config.ensure_directories()?;

        let store = NoteStore::open(&config.database_path)?;
        let dimensions = check_store_meta(&store, embedder.as_ref(), config.distance_metric)?;
        let index = load_index(&store, &config, dimensions)?;

        let pipeline = EnrichmentPipeline::new(llm, EnrichmentConfig::from(&config));
        let (settled, _) = watch::channel(0u64);
        let permits = Arc::new(Semaphore::new(config.enrichment_concurrency));

        let engine = MemoryEngine {
            inner: Arc::new(Inner {
                store,
                index,
                embedder,
                pipeline,
                config,
                locks: NoteLocks::default(),
                permits,
                tracker: TaskTracker::new(),
                in_flight: Mutex::new(HashSet::new()),
                settled,
            }),
        };

        let report = engine.repair()?;
        let resumed = engine.resume_pending()?;
        info!(
            path = %engine.inner.config.database_path.display(),
            notes = report.store_count,
            repaired = !report.is_consistent(),
            resumed,
            "memory engine opened"
        );

        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Number of stored notes.
    pub fn len(&self) -> Result<usize, Error> {
        self.inner.store.count()
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.len()? == 0)
    }

    /// Validate input length (rejects empty and whitespace-only inputs).
    pub(crate) fn validate_input_length(text: &str) -> Result<(), Error> {
        if text.trim().is_empty() {
            return Err(Error::EmptyInput);
        }
        if text.len() > MAX_INPUT_LENGTH {
            return Err(Error::InputTooLong {
                max_length: MAX_INPUT_LENGTH,
                actual_length: text.len(),
            });
        }
        Ok(())
    }

    /// Embed `text` within the configured timeout and check the result fits
    /// the store.
    pub(crate) async fn embed(&self, text: &str) -> Result<Vec<f32>, Error> {
        let seconds = self.inner.config.embed_timeout_secs;
        let vector = tokio::time::timeout(
            self.inner.config.embed_timeout(),
            self.inner.embedder.embed(text),
        )
        .await
        .map_err(|_| Error::Timeout {
            operation: "embedding".to_string(),
            seconds,
        })??;

        let expected = self.inner.index.dimensions();
        if vector.len() != expected {
            return Err(Error::DimensionMismatch {
                expected,
                actual: vector.len(),
            });
        }
        check_finite(&vector)?;
        // A zero vector is equidistant from everything and can never be found.
        if vector.iter().all(|x| *x == 0.0) {
            return Err(Error::InvalidEmbedding(
                "embedding has zero norm; the text has no embeddable content".to_string(),
            ));
        }
        Ok(vector)
    }
}

/// Validate limit is within acceptable bounds.
pub(crate) fn validate_limit(limit: usize) -> Result<(), Error> {
    if limit == 0 {
        return Err(Error::InvalidLimit(
            "Limit must be greater than 0".to_string(),
        ));
    }
    if limit > MAX_SEARCH_LIMIT {
        return Err(Error::InvalidLimit(format!(
            "Limit {} exceeds maximum allowed ({})",
            limit, MAX_SEARCH_LIMIT
        )));
    }
    Ok(())
}

/// Compare the store's recorded facts with the current setup, recording them
/// on first open. Returns the store's dimensionality.
fn check_store_meta(
    store: &NoteStore,
    embedder: &dyn EmbeddingProvider,
    metric: DistanceMetric,
) -> Result<usize, Error> {
    let dimensions = embedder.dimensions();

    match store.meta(META_DIMENSIONS)? {
        Some(recorded) => {
            let recorded: usize = recorded.parse().map_err(|_| {
                Error::Consistency(format!("stored dimensionality '{recorded}' is not a number"))
            })?;
            if recorded != dimensions {
                return Err(Error::Config(format!(
                    "store holds {recorded}-dimensional embeddings but embedder {} produces {dimensions}",
                    embedder.model_name()
                )));
            }
        }
        None => store.set_meta(META_DIMENSIONS, &dimensions.to_string())?,
    }

    match store.meta(META_METRIC)? {
        Some(recorded) => {
            let recorded: DistanceMetric = recorded.parse()?;
            if recorded != metric {
                return Err(Error::Config(format!(
                    "store was created with the {} metric, configured metric is {}",
                    recorded.as_str(),
                    metric.as_str()
                )));
            }
        }
        None => store.set_meta(META_METRIC, metric.as_str())?,
    }

    match store.meta(META_MODEL)? {
        Some(recorded) if recorded != embedder.model_name() => {
            warn!(
                recorded = %recorded,
                configured = embedder.model_name(),
                "embedding model differs from the one that built this store"
            );
        }
        Some(_) => {}
        None => store.set_meta(META_MODEL, embedder.model_name())?,
    }

    Ok(dimensions)
}

/// Load the index snapshot if it matches the store, otherwise rebuild.
fn load_index(store: &NoteStore, config: &Config, dimensions: usize) -> Result<VectorIndex, Error> {
    if let Some(path) = &config.index_path {
        if let Some(index) = load_snapshot(path, dimensions, config.distance_metric) {
            return Ok(index);
        }
    }

    let index = VectorIndex::new(dimensions, config.distance_metric);
    index.rebuild(store.embeddings()?)?;
    info!(entries = index.len(), "vector index rebuilt from store");
    Ok(index)
}

fn load_snapshot(path: &Path, dimensions: usize, metric: DistanceMetric) -> Option<VectorIndex> {
    match VectorIndex::load(path) {
        Ok(Some(index)) if index.dimensions() == dimensions && index.metric() == metric => {
            info!(path = %path.display(), entries = index.len(), "vector index snapshot loaded");
            Some(index)
        }
        Ok(Some(_)) => {
            warn!(path = %path.display(), "index snapshot does not match the store, rebuilding");
            None
        }
        Ok(None) => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "index snapshot unreadable, rebuilding");
            None
        }
    }
}
