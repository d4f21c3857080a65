//! In-memory exact nearest-neighbour index over note embeddings.
//!
//! The index maps note ids to vectors under a distance metric fixed when the
//! store is created. It can be snapshotted to a JSON file and is always
//! rebuildable from the note store, which keeps the canonical embeddings.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::errors::Error;
use crate::sqlite::embedding::{check_finite, cosine_similarity, l2_distance};

const SNAPSHOT_VERSION: u32 = 1;

/// Distance metric used for nearest-neighbour queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// `1 - cosine similarity`, in `[0, 2]`.
    #[default]
    Cosine,
    /// Euclidean distance.
    L2,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::L2 => "l2",
        }
    }

    /// Distance between two vectors (lower is closer).
    pub fn distance(&self, a: &[f32], b: &[f32]) -> Result<f64, Error> {
        match self {
            DistanceMetric::Cosine => Ok(1.0 - cosine_similarity(a, b)?),
            DistanceMetric::L2 => l2_distance(a, b),
        }
    }

    /// Map a distance back to a similarity score (higher is closer).
    pub fn similarity(&self, distance: f64) -> f64 {
        match self {
            DistanceMetric::Cosine => 1.0 - distance,
            DistanceMetric::L2 => 1.0 / (1.0 + distance),
        }
    }
}

impl std::str::FromStr for DistanceMetric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "l2" | "euclidean" => Ok(DistanceMetric::L2),
            other => Err(Error::Config(format!(
                "Unknown distance metric: {other} (expected cosine or l2)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    revision: u64,
    vector: Vec<f32>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    metric: DistanceMetric,
    dimensions: usize,
    entries: Vec<SnapshotEntry>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotEntry {
    id: String,
    revision: u64,
    vector: Vec<f32>,
}

/// Exact (linear scan) vector index keyed by note id.
pub struct VectorIndex {
    dimensions: usize,
    metric: DistanceMetric,
    entries: RwLock<HashMap<String, Entry>>,
}

impl VectorIndex {
    pub fn new(dimensions: usize, metric: DistanceMetric) -> Self {
        VectorIndex {
            dimensions,
            metric,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    fn check_vector(&self, vector: &[f32]) -> Result<(), Error> {
        if vector.len() != self.dimensions {
            return Err(Error::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        check_finite(vector)
    }

    /// Insert or replace the vector for `id`.
    ///
    /// `revision` is the note's content revision the vector was derived from.
    pub fn insert(&self, id: &str, revision: u64, vector: Vec<f32>) -> Result<(), Error> {
        self.check_vector(&vector)?;
        self.entries
            .write()
            .insert(id.to_string(), Entry { revision, vector });
        Ok(())
    }

    /// Remove the vector for `id`. Returns false if it was not present.
    pub fn remove(&self, id: &str) -> bool {
        self.entries.write().remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Content revision each vector was indexed at.
    pub fn revisions(&self) -> HashMap<String, u64> {
        self.entries
            .read()
            .iter()
            .map(|(id, e)| (id.clone(), e.revision))
            .collect()
    }

    /// The `k` nearest vectors to `vector`, closest first.
    ///
    /// Returns `(id, distance)` pairs; an empty index yields an empty result.
    /// Ties are broken by id.
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<(String, f64)>, Error> {
        self.check_vector(vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let entries = self.entries.read();
        let mut scored = Vec::with_capacity(entries.len());
        for (id, entry) in entries.iter() {
            let distance = self.metric.distance(vector, &entry.vector)?;
            scored.push((id.clone(), distance));
        }
        drop(entries);

        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    /// Replace the whole index with `entries`.
    ///
    /// Every vector is validated before the swap, so a failed rebuild leaves
    /// the previous contents in place.
    pub fn rebuild(&self, entries: Vec<(String, u64, Vec<f32>)>) -> Result<(), Error> {
        let mut fresh = HashMap::with_capacity(entries.len());
        for (id, revision, vector) in entries {
            self.check_vector(&vector)?;
            fresh.insert(id, Entry { revision, vector });
        }
        let count = fresh.len();
        *self.entries.write() = fresh;
        debug!(entries = count, "vector index rebuilt");
        Ok(())
    }

    /// Write a snapshot to `path` atomically (synced unique temp file + rename).
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let snapshot = {
            let entries = self.entries.read();
            let mut list: Vec<SnapshotEntry> = entries
                .iter()
                .map(|(id, e)| SnapshotEntry {
                    id: id.clone(),
                    revision: e.revision,
                    vector: e.vector.clone(),
                })
                .collect();
            list.sort_by(|a, b| a.id.cmp(&b.id));
            Snapshot {
                version: SNAPSHOT_VERSION,
                metric: self.metric,
                dimensions: self.dimensions,
                entries: list,
            }
        };

        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(&serde_json::to_vec(&snapshot)?)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| Error::Io(e.error))?;
        debug!(path = %path.display(), entries = snapshot.entries.len(), "vector index saved");
        Ok(())
    }

    /// Load a snapshot from `path`.
    ///
    /// Returns `Ok(None)` if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns error if the file is unreadable, corrupt, or contains a vector
    /// that violates its declared dimensions.
    pub fn load(path: &Path) -> Result<Option<Self>, Error> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Consistency(format!(
                "unsupported index snapshot version {}",
                snapshot.version
            )));
        }

        let index = VectorIndex::new(snapshot.dimensions, snapshot.metric);
        index.rebuild(
            snapshot
                .entries
                .into_iter()
                .map(|e| (e.id, e.revision, e.vector))
                .collect(),
        )?;
        Ok(Some(index))
    }
}
