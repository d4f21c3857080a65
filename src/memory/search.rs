//! Semantic search over the vector index.

use tracing::warn;

use crate::enrichment::NeighborSearch;
use crate::errors::Error;
use crate::note::Note;

use super::store::{Inner, MemoryEngine, validate_limit};

/// Query rounds when orphaned index entries had to be dropped.
const MAX_QUERY_ROUNDS: usize = 2;

impl Inner {
    /// Hydrate the `k` nearest index entries into notes.
    ///
    /// Index ids without a store row are removed from the index and the
    /// query is repeated once so the caller still gets up to `k` results.
    fn nearest(&self, vector: &[f32], k: usize, exclude: Option<&str>) -> Result<Vec<Note>, Error> {
        let fetch = k + usize::from(exclude.is_some());
        let metric = self.index.metric();

        let mut notes = Vec::new();
        for _ in 0..MAX_QUERY_ROUNDS {
            notes.clear();
            let mut orphans = 0;
            for (id, distance) in self.index.query(vector, fetch)? {
                if exclude == Some(id.as_str()) {
                    continue;
                }
                match self.store.get(&id)? {
                    Some(mut note) => {
                        note.similarity = Some(metric.similarity(distance));
                        notes.push(note);
                    }
                    None => {
                        // Also reached between a delete's store and index removal.
                        if self.index.remove(&id) {
                            warn!(note_id = %id, "index entry has no stored note, removed");
                        }
                        orphans += 1;
                    }
                }
            }
            if orphans == 0 {
                break;
            }
        }
        notes.truncate(k);
        Ok(notes)
    }
}

impl NeighborSearch for Inner {
    fn neighbors(&self, note: &Note, k: usize) -> Result<Vec<Note>, Error> {
        if k == 0 {
            return Ok(Vec::new());
        }
        self.nearest(&note.embedding, k, Some(&note.id))
    }
}

impl MemoryEngine {
    #[must_use = "handle the error or results may be lost"]
    /// Search notes by semantic similarity.
    ///
    /// Embeds the query and returns the nearest notes, most similar first,
    /// each with `similarity` populated. Notes below the configured
    /// similarity floor are dropped.
    ///
    /// # Arguments
    ///
    /// * `query` - Search query text (1 to 100,000 characters)
    /// * `k` - Maximum number of results (1 to MAX_SEARCH_LIMIT)
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Query is empty or exceeds 100,000 characters
    /// - `k` is 0 or exceeds MAX_SEARCH_LIMIT
    /// - Embedding fails or times out
    /// - Database operations fail
    pub async fn search_agentic(&self, query: &str, k: usize) -> Result<Vec<Note>, Error> {
        // Validate limit to prevent resource exhaustion
        validate_limit(k)?;

        let query = query.trim();
        Self::validate_input_length(query)?;

        let embedding = self.embed(query).await?;
        let floor = self.inner.config.search_similarity_floor;

        let mut notes = self.inner.nearest(&embedding, k, None)?;
        notes.retain(|n| n.similarity.unwrap_or(0.0) >= floor);
        self.filter_dangling_links(&mut notes)?;
        Ok(notes)
    }
}
