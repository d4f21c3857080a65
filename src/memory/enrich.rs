//! Enrichment scheduling and application.
//!
//! A task owns its note id from claim to release (the `in_flight` set);
//! further requests for that id are coalesced into the running task. The
//! per-note lock is held only to mark the note `Enriching` and to apply the
//! result, never across the language-model call.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::EnrichmentMode;
use crate::enrichment::EnrichmentOutcome;
use crate::errors::Error;
use crate::note::{EnrichRequest, EnrichmentStatus, Note, merge_tags, normalize_links};
use crate::sqlite::NoteUpdate;

use super::store::MemoryEngine;

/// Enrichment passes per task before giving up on a note whose content keeps
/// changing.
const MAX_ENRICHMENT_PASSES: usize = 3;

enum Applied {
    Done,
    /// The note was deleted meanwhile.
    Discarded,
    /// Content changed meanwhile.
    Stale,
}

impl MemoryEngine {
    #[must_use = "handle the error or results may be lost"]
    /// Request a fresh enrichment of an existing note.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the note doesn't exist.
    pub async fn reenrich(&self, id: &str) -> Result<EnrichRequest, Error> {
        if self.inner.store.get(id)?.is_none() {
            return Err(Error::NotFound(id.to_string()));
        }
        let request = self.claim_enrichment(id);
        if request == EnrichRequest::Scheduled {
            self.dispatch_enrichment(id.to_string()).await;
        }
        Ok(request)
    }

    #[must_use = "handle the error or results may be lost"]
    /// Wait until enrichment of `id` has settled.
    ///
    /// Returns the final status (`Enriched` or `Fallback`) once no task is
    /// queued or running for the note.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The note doesn't exist or is deleted while waiting (`Error::NotFound`)
    /// - `timeout` elapses first (`Error::Timeout`)
    pub async fn wait_for_enrichment(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<EnrichmentStatus, Error> {
        let deadline = Instant::now() + timeout;
        let mut settled = self.inner.settled.subscribe();
        loop {
            let note = self
                .inner
                .store
                .get(id)?
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            let running = self.inner.in_flight.lock().contains(id);
            if !running && note.enrichment.is_settled() {
                return Ok(note.enrichment);
            }

            match tokio::time::timeout_at(deadline, settled.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(Error::Task("enrichment notifications closed".to_string()));
                }
                Err(_) => {
                    return Err(Error::Timeout {
                        operation: format!("waiting for enrichment of {id}"),
                        seconds: timeout.as_secs(),
                    });
                }
            }
        }
    }

    /// Mark `id` as owned by an enrichment task.
    pub(crate) fn claim_enrichment(&self, id: &str) -> EnrichRequest {
        if self.inner.tracker.is_closed() {
            debug!(note_id = %id, "engine shutting down, enrichment deferred");
            return EnrichRequest::Deferred;
        }
        if self.inner.in_flight.lock().insert(id.to_string()) {
            EnrichRequest::Scheduled
        } else {
            EnrichRequest::Coalesced
        }
    }

    /// Run the task for a claimed id, inline or in the background per config.
    pub(crate) async fn dispatch_enrichment(&self, id: String) {
        match self.inner.config.enrichment_mode {
            EnrichmentMode::Background => self.spawn_enrichment(id),
            EnrichmentMode::Inline => self.run_enrichment(id).await,
        }
    }

    pub(crate) fn spawn_enrichment(&self, id: String) {
        let engine = self.clone();
        self.inner
            .tracker
            .spawn(async move { engine.run_enrichment(id).await });
    }

    /// Claim and spawn enrichment for notes a previous process left
    /// unfinished. Returns how many were scheduled.
    pub(crate) fn resume_pending(&self) -> Result<usize, Error> {
        let mut scheduled = 0;
        for id in self.inner.store.pending_enrichment()? {
            if self.claim_enrichment(&id) == EnrichRequest::Scheduled {
                self.spawn_enrichment(id);
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    async fn run_enrichment(&self, id: String) {
        self.enrichment_passes(&id).await;
    }

    async fn enrichment_passes(&self, id: &str) {
        let Ok(_permit) = self.inner.permits.clone().acquire_owned().await else {
            self.finish_enrichment(id);
            return;
        };

        let mut pass = 0;
        loop {
            pass += 1;

            let snapshot = {
                let _guard = self.inner.locks.lock(id).await;
                match self
                    .inner
                    .store
                    .update_fields(id, NoteUpdate::status(EnrichmentStatus::Enriching))
                {
                    Ok(Some(note)) => note,
                    Ok(None) => {
                        debug!(note_id = %id, "note deleted before enrichment started");
                        self.finish_enrichment(id);
                        return;
                    }
                    Err(e) => {
                        warn!(note_id = %id, error = %e, "failed to mark note as enriching");
                        self.finish_enrichment(id);
                        return;
                    }
                }
            };

            let outcome = self.inner.pipeline.enrich(&snapshot, self.inner.as_ref()).await;

            let _guard = self.inner.locks.lock(id).await;
            match self.apply_enrichment(&snapshot, outcome) {
                Ok(Applied::Stale) if pass < MAX_ENRICHMENT_PASSES => {
                    debug!(note_id = %id, pass, "content changed during enrichment, retrying");
                    continue;
                }
                Ok(Applied::Stale) => {
                    warn!(note_id = %id, passes = pass, "content kept changing, enrichment left pending");
                    if let Err(e) = self
                        .inner
                        .store
                        .update_fields(id, NoteUpdate::status(EnrichmentStatus::Pending))
                    {
                        warn!(note_id = %id, error = %e, "failed to reset enrichment status");
                    }
                }
                Ok(Applied::Discarded) => {
                    debug!(note_id = %id, "note deleted during enrichment, result discarded");
                }
                Ok(Applied::Done) => {}
                Err(e) => {
                    warn!(note_id = %id, error = %e, "failed to apply enrichment");
                }
            }
            self.finish_enrichment(id);
            return;
        }
    }

    /// Merge `outcome` into the note if it still has the revision the
    /// outcome was derived from. Caller holds the note lock.
    fn apply_enrichment(&self, snapshot: &Note, outcome: EnrichmentOutcome) -> Result<Applied, Error> {
        let Some(current) = self.inner.store.get(&snapshot.id)? else {
            return Ok(Applied::Discarded);
        };
        if current.revision != snapshot.revision {
            return Ok(Applied::Stale);
        }

        let result = outcome.result;
        let category = match current.category {
            Some(_) => None,
            None => result.category.map(Some),
        };
        let update = NoteUpdate {
            tags: Some(merge_tags(&current.tags, &result.tags)),
            category,
            context: result.context.map(Some),
            links: Some(normalize_links(
                &current.id,
                current.links.iter().chain(result.links.iter()),
            )),
            enrichment: Some(outcome.status),
            ..Default::default()
        };
        self.inner.store.update_fields(&current.id, update)?;

        debug!(
            note_id = %current.id,
            status = outcome.status.as_str(),
            attempts = outcome.attempts,
            "enrichment applied"
        );
        Ok(Applied::Done)
    }

    /// Release the claim on `id` and wake waiters. Caller holds the note
    /// lock when one is held by the task.
    fn finish_enrichment(&self, id: &str) {
        self.inner.in_flight.lock().remove(id);
        self.inner.settled.send_modify(|n| *n = n.wrapping_add(1));
    }
}
