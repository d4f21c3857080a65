//! Store/index consistency checks, repair and lifecycle.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{info, warn};

use crate::errors::Error;

use super::store::MemoryEngine;

/// Differences between the note store and the vector index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub store_count: usize,
    pub index_count: usize,
    /// Stored notes without a vector.
    pub missing_from_index: Vec<String>,
    /// Vectors without a stored note.
    pub orphaned_in_index: Vec<String>,
    /// Vectors derived from an older revision of the note's content.
    pub stale_in_index: Vec<String>,
}

impl AuditReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_from_index.is_empty()
            && self.orphaned_in_index.is_empty()
            && self.stale_in_index.is_empty()
    }
}

impl MemoryEngine {
    #[must_use = "handle the error or results may be lost"]
    /// Compare store and index.
    ///
    /// Operations in flight while the audit runs may show up as transient
    /// differences.
    pub fn audit(&self) -> Result<AuditReport, Error> {
        let stored = self.inner.store.revisions()?;
        let indexed = self.inner.index.revisions();

        let mut missing_from_index = Vec::new();
        let mut stale_in_index = Vec::new();
        for (id, revision) in &stored {
            match indexed.get(id) {
                None => missing_from_index.push(id.clone()),
                Some(indexed_revision) if indexed_revision != revision => {
                    stale_in_index.push(id.clone())
                }
                Some(_) => {}
            }
        }
        let mut orphaned_in_index: Vec<String> = indexed
            .keys()
            .filter(|id| !stored.contains_key(*id))
            .cloned()
            .collect();

        missing_from_index.sort();
        stale_in_index.sort();
        orphaned_in_index.sort();

        Ok(AuditReport {
            store_count: stored.len(),
            index_count: indexed.len(),
            missing_from_index,
            orphaned_in_index,
            stale_in_index,
        })
    }

    #[must_use = "handle the error or results may be lost"]
    /// Bring the index in line with the store.
    ///
    /// Missing and stale vectors are re-inserted from stored embeddings and
    /// orphans are removed. Returns the report observed before repair.
    ///
    /// # Errors
    ///
    /// Returns `Error::Consistency` if a stored embedding cannot be indexed.
    pub fn repair(&self) -> Result<AuditReport, Error> {
        let report = self.audit()?;
        if report.is_consistent() {
            return Ok(report);
        }

        let reinsert: HashSet<&String> = report
            .missing_from_index
            .iter()
            .chain(report.stale_in_index.iter())
            .collect();
        for id in reinsert {
            // The note may have been deleted since the audit.
            let Some(note) = self.inner.store.get(id)? else {
                continue;
            };
            self.inner
                .index
                .insert(&note.id, note.revision, note.embedding)
                .map_err(|e| {
                    Error::Consistency(format!("cannot index stored note {id}: {e}"))
                })?;
        }

        for id in &report.orphaned_in_index {
            if self.inner.store.get(id)?.is_none() {
                self.inner.index.remove(id);
            }
        }

        warn!(
            missing = report.missing_from_index.len(),
            stale = report.stale_in_index.len(),
            orphaned = report.orphaned_in_index.len(),
            "store and index disagreed, index repaired"
        );
        Ok(report)
    }

    #[must_use = "handle the error or results may be lost"]
    /// Discard the index and rebuild it from stored embeddings.
    pub fn rebuild_index(&self) -> Result<(), Error> {
        self.inner.index.rebuild(self.inner.store.embeddings()?)?;
        info!(entries = self.inner.index.len(), "vector index rebuilt");
        Ok(())
    }

    #[must_use = "handle the error or results may be lost"]
    /// Write the index snapshot. No-op when no snapshot path is configured.
    pub fn flush(&self) -> Result<(), Error> {
        if let Some(path) = &self.inner.config.index_path {
            self.inner.index.save(path)?;
        }
        Ok(())
    }

    #[must_use = "handle the error or results may be lost"]
    /// Stop scheduling enrichment, wait for running tasks and flush.
    ///
    /// Notes whose enrichment was not started stay pending and are resumed on
    /// the next open. Other operations keep working on this handle.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.flush()?;
        info!("memory engine shut down");
        Ok(())
    }
}
