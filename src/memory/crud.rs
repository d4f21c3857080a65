//! Add, read, update and delete operations.

use tracing::{debug, info, warn};

use crate::errors::Error;
use crate::note::{
    EnrichRequest, EnrichmentStatus, Note, NotePatch, normalize_label, normalize_links,
    normalize_tags, validate_tags,
};
use crate::sqlite::NoteUpdate;

use super::store::{MemoryEngine, validate_limit};

impl MemoryEngine {
    #[must_use = "handle the error or results may be lost"]
    /// Add a note and schedule its enrichment.
    ///
    /// The note is durable and searchable when this returns. Enrichment runs
    /// in the background unless the engine is configured for inline
    /// enrichment, in which case it has settled (successfully or not) first.
    ///
    /// # Arguments
    ///
    /// * `content` - Text to remember (1 to 100,000 characters)
    /// * `tags` - User-supplied tags, kept ahead of derived ones
    /// * `category` - User-supplied category; derived when `None`
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Input is empty or exceeds 100,000 characters
    /// - More than `MAX_TAGS` tags, or a tag longer than `MAX_TAG_LENGTH`
    /// - Embedding fails or times out (nothing is written)
    /// - The store or index rejects the note (nothing is left behind)
    pub async fn add_note(
        &self,
        content: &str,
        tags: &[&str],
        category: Option<&str>,
    ) -> Result<String, Error> {
        Self::validate_input_length(content)?;
        validate_tags(tags)?;
        let embedding = self.embed(content).await?;

        let note = Note::new(
            content.to_string(),
            embedding,
            tags.iter().map(|t| t.to_string()).collect(),
            category.map(str::to_string),
        );
        self.inner.store.put(&note)?;

        if let Err(e) = self
            .inner
            .index
            .insert(&note.id, note.revision, note.embedding.clone())
        {
            if let Err(rollback) = self.inner.store.delete(&note.id) {
                warn!(note_id = %note.id, error = %rollback, "failed to roll back note after index error");
            }
            return Err(e);
        }

        info!(note_id = %note.id, tags = note.tags.len(), "note added");

        if self.claim_enrichment(&note.id) == EnrichRequest::Scheduled {
            self.dispatch_enrichment(note.id.clone()).await;
        }
        Ok(note.id)
    }

    #[must_use = "handle the error or results may be lost"]
    /// Get a note by id, with dangling links removed.
    ///
    /// Returns `None` if the note doesn't exist.
    pub async fn get_note(&self, id: &str) -> Result<Option<Note>, Error> {
        let Some(mut note) = self.inner.store.get(id)? else {
            return Ok(None);
        };
        self.filter_dangling_links(std::slice::from_mut(&mut note))?;
        Ok(Some(note))
    }

    #[must_use = "handle the error or results may be lost"]
    /// List the most recent notes, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Limit is 0
    /// - Limit exceeds MAX_SEARCH_LIMIT
    pub async fn list_notes(&self, limit: usize) -> Result<Vec<Note>, Error> {
        validate_limit(limit)?;
        let mut notes = self.inner.store.list_recent(limit)?;
        self.filter_dangling_links(&mut notes)?;
        Ok(notes)
    }

    #[must_use = "handle the error or results may be lost"]
    /// Apply a partial update.
    ///
    /// New content is re-embedded, stored together with its vector, re-indexed
    /// and re-enriched. Other fields are stored as given.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The patch is empty, or new content or tags are invalid (nothing changes)
    /// - The note doesn't exist (`Error::NotFound`)
    /// - Embedding fails or times out (nothing changes)
    pub async fn update_note(&self, id: &str, patch: NotePatch) -> Result<Note, Error> {
        if patch.is_empty() {
            return Err(Error::Validation("update contains no fields".to_string()));
        }
        if let Some(content) = &patch.content {
            Self::validate_input_length(content)?;
        }
        if let Some(tags) = &patch.tags {
            validate_tags(tags.as_slice())?;
        }
        if self.inner.store.get(id)?.is_none() {
            return Err(Error::NotFound(id.to_string()));
        }

        let embedding = match &patch.content {
            Some(content) => Some(self.embed(content).await?),
            None => None,
        };
        let content_changed = patch.content.is_some();

        let update = NoteUpdate {
            content: patch.content,
            embedding,
            tags: patch.tags.map(normalize_tags),
            category: patch.category.map(|c| normalize_label(Some(c))),
            context: patch.context.map(|c| normalize_label(Some(c))),
            links: patch.links.map(|links| normalize_links(id, links)),
            enrichment: content_changed.then_some(EnrichmentStatus::Pending),
        };

        let guard = self.inner.locks.lock(id).await;
        let note = self
            .inner
            .store
            .update_fields(id, update)?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let mut request = None;
        if content_changed {
            self.inner
                .index
                .insert(id, note.revision, note.embedding.clone())?;
            request = Some(self.claim_enrichment(id));
        }
        drop(guard);

        debug!(note_id = %id, revision = note.revision, content_changed, "note updated");
        if request == Some(EnrichRequest::Scheduled) {
            self.dispatch_enrichment(id.to_string()).await;
        }

        let mut note = note;
        self.filter_dangling_links(std::slice::from_mut(&mut note))?;
        Ok(note)
    }

    #[must_use = "handle the error or results may be lost"]
    /// Delete a note from the store and the index.
    ///
    /// Reads that start after this returns never see the note. An enrichment
    /// task still running for it discards its result.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the note doesn't exist; nothing changes.
    pub async fn delete_note(&self, id: &str) -> Result<(), Error> {
        let guard = self.inner.locks.lock(id).await;
        if !self.inner.store.delete(id)? {
            return Err(Error::NotFound(id.to_string()));
        }
        if !self.inner.index.remove(id) {
            warn!(note_id = %id, "deleted note had no vector in the index");
        }
        drop(guard);

        info!(note_id = %id, "note deleted");
        Ok(())
    }

    #[must_use = "handle the error or results may be lost"]
    /// Notes this note links to, in link order, skipping dangling links.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the note doesn't exist.
    pub async fn linked_notes(&self, id: &str) -> Result<Vec<Note>, Error> {
        let note = self
            .inner
            .store
            .get(id)?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let mut linked = Vec::with_capacity(note.links.len());
        for link in &note.links {
            if let Some(target) = self.inner.store.get(link)? {
                linked.push(target);
            }
        }
        self.filter_dangling_links(&mut linked)?;
        Ok(linked)
    }

    /// Drop links whose target no longer exists.
    pub(crate) fn filter_dangling_links(&self, notes: &mut [Note]) -> Result<(), Error> {
        let targets: Vec<String> = notes
            .iter()
            .flat_map(|n| n.links.iter().cloned())
            .collect();
        if targets.is_empty() {
            return Ok(());
        }
        let existing = self.inner.store.existing_ids(&targets)?;
        for note in notes.iter_mut() {
            note.links.retain(|link| existing.contains(link));
        }
        Ok(())
    }
}
