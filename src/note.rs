//! Note data types.

use std::collections::HashSet;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Maximum number of tags kept on a single note.
pub const MAX_TAGS: usize = 16;

/// Maximum length of a single tag (in characters).
pub const MAX_TAG_LENGTH: usize = 64;

/// Progress of the enrichment pipeline for one note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    /// Stored, enrichment not started yet.
    Pending,
    /// Enrichment task is running; further requests are coalesced.
    Enriching,
    /// Derived fields were produced by the language model.
    Enriched,
    /// The language model failed; only user-supplied fields are present.
    Fallback,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Enriching => "enriching",
            EnrichmentStatus::Enriched => "enriched",
            EnrichmentStatus::Fallback => "fallback",
        }
    }

    /// Whether enrichment has reached a terminal state.
    pub fn is_settled(&self) -> bool {
        matches!(self, EnrichmentStatus::Enriched | EnrichmentStatus::Fallback)
    }
}

impl std::str::FromStr for EnrichmentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EnrichmentStatus::Pending),
            "enriching" => Ok(EnrichmentStatus::Enriching),
            "enriched" => Ok(EnrichmentStatus::Enriched),
            "fallback" => Ok(EnrichmentStatus::Fallback),
            other => Err(Error::Validation(format!(
                "unknown enrichment status: {other}"
            ))),
        }
    }
}

/// A single stored memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
    pub tags: Vec<String>,
    pub category: Option<String>,
    pub context: Option<String>,
    /// Directed links to other note ids.
    pub links: Vec<String>,
    /// Content generation, bumped whenever content changes.
    pub revision: u64,
    pub enrichment: EnrichmentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Similarity to the query (search results only).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub similarity: Option<f64>,
}

impl Note {
    /// Build a fresh note at revision 1 with a random id.
    pub fn new(
        content: String,
        embedding: Vec<f32>,
        tags: Vec<String>,
        category: Option<String>,
    ) -> Self {
        // Stored timestamps carry microsecond precision.
        let now = Utc::now().trunc_subsecs(6);
        Note {
            id: uuid::Uuid::new_v4().to_string(),
            content,
            embedding,
            tags: normalize_tags(tags),
            category: normalize_label(category),
            context: None,
            links: Vec::new(),
            revision: 1,
            enrichment: EnrichmentStatus::Pending,
            created_at: now,
            updated_at: now,
            similarity: None,
        }
    }
}

/// Partial update of a note. Only `Some` fields change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotePatch {
    pub content: Option<String>,
    pub tags: Option<Vec<String>>,
    pub category: Option<String>,
    pub context: Option<String>,
    pub links: Option<Vec<String>>,
}

impl NotePatch {
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.tags.is_none()
            && self.category.is_none()
            && self.context.is_none()
            && self.links.is_none()
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn links<I, S>(mut self, links: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.links = Some(links.into_iter().map(Into::into).collect());
        self
    }
}

/// Outcome of a re-enrichment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnrichRequest {
    /// A new enrichment task was started.
    Scheduled,
    /// An enrichment task for this note is already running and will pick up
    /// the latest content.
    Coalesced,
    /// The engine is shutting down; the note stays pending and is picked up
    /// the next time the store is opened.
    Deferred,
}

/// Trim, drop empties and duplicates (case-insensitive), cap count and length.
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.as_ref().trim();
        if tag.is_empty() {
            continue;
        }
        let tag: String = tag.chars().take(MAX_TAG_LENGTH).collect();
        if out.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
            continue;
        }
        out.push(tag);
        if out.len() == MAX_TAGS {
            break;
        }
    }
    out
}

/// Reject user-supplied tags that [`normalize_tags`] would otherwise cut.
///
/// # Errors
///
/// Returns `Error::Validation` if a tag is longer than `MAX_TAG_LENGTH`
/// characters or there are more than `MAX_TAGS` distinct tags.
pub fn validate_tags<S: AsRef<str>>(tags: &[S]) -> Result<(), Error> {
    let mut distinct = HashSet::new();
    for tag in tags {
        let tag = tag.as_ref().trim();
        if tag.chars().count() > MAX_TAG_LENGTH {
            let prefix: String = tag.chars().take(16).collect();
            return Err(Error::Validation(format!(
                "tag '{prefix}...' exceeds {MAX_TAG_LENGTH} characters"
            )));
        }
        if !tag.is_empty() {
            distinct.insert(tag.to_ascii_lowercase());
        }
    }
    if distinct.len() > MAX_TAGS {
        return Err(Error::Validation(format!(
            "{} tags given, at most {MAX_TAGS} allowed",
            distinct.len()
        )));
    }
    Ok(())
}

/// Merge user-supplied tags with derived ones; user tags keep their position.
pub fn merge_tags(existing: &[String], derived: &[String]) -> Vec<String> {
    normalize_tags(existing.iter().chain(derived.iter()))
}

/// Trim a single label, mapping blank to `None`.
pub fn normalize_label(label: Option<String>) -> Option<String> {
    label
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
}

/// Deduplicate link targets, dropping blanks and self references.
pub fn normalize_links<I, S>(self_id: &str, links: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out: Vec<String> = Vec::new();
    for link in links {
        let link = link.as_ref().trim();
        if link.is_empty() || link == self_id || !seen.insert(link.to_string()) {
            continue;
        }
        out.push(link.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_note_defaults() {
        let note = Note::new(
            "hello".to_string(),
            vec![1.0, 0.0],
            vec!["a".to_string()],
            Some("  ".to_string()),
        );
        assert_eq!(note.revision, 1);
        assert_eq!(note.enrichment, EnrichmentStatus::Pending);
        assert!(note.category.is_none());
        assert!(note.context.is_none());
        assert_eq!(note.created_at, note.updated_at);
        assert!(uuid::Uuid::parse_str(&note.id).is_ok());
    }

    #[test]
    fn test_normalize_tags_dedupes_case_insensitively() {
        let tags = normalize_tags(["Privacy", " privacy ", "", "local"]);
        assert_eq!(tags, vec!["Privacy".to_string(), "local".to_string()]);
    }

    #[test]
    fn test_normalize_tags_caps_count() {
        let many: Vec<String> = (0..40).map(|i| format!("tag{i}")).collect();
        assert_eq!(normalize_tags(many).len(), MAX_TAGS);
    }

    #[test]
    fn test_merge_tags_keeps_user_tags_first() {
        let merged = merge_tags(
            &["sovereign".to_string()],
            &["privacy".to_string(), "Sovereign".to_string()],
        );
        assert_eq!(merged, vec!["sovereign".to_string(), "privacy".to_string()]);
    }

    #[test]
    fn test_normalize_links_drops_self_and_duplicates() {
        let links = normalize_links("a", ["b", "a", "b", " ", "c"]);
        assert_eq!(links, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_validate_tags_rejects_what_normalizing_would_cut() {
        assert!(validate_tags(&["ui", "UI", " prefs ", ""]).is_ok());

        let too_long = "x".repeat(MAX_TAG_LENGTH + 1);
        assert!(matches!(
            validate_tags(&[too_long.as_str()]),
            Err(Error::Validation(_))
        ));

        let many: Vec<String> = (0..=MAX_TAGS).map(|i| format!("tag{i}")).collect();
        assert!(matches!(validate_tags(many.as_slice()), Err(Error::Validation(_))));
        assert!(validate_tags(&many[..MAX_TAGS]).is_ok());
    }

    #[test]
    fn test_unknown_status_rejected() {
        assert_eq!(
            "fallback".parse::<EnrichmentStatus>().unwrap(),
            EnrichmentStatus::Fallback
        );
        assert!("bogus".parse::<EnrichmentStatus>().is_err());
        assert!(!EnrichmentStatus::Enriching.is_settled());
    }

    #[test]
    fn test_patch_builder() {
        let patch = NotePatch::default().tags(["x"]).context("ctx");
        assert!(!patch.is_empty());
        assert!(patch.content.is_none());
        assert_eq!(patch.tags, Some(vec!["x".to_string()]));
        assert!(NotePatch::default().is_empty());
    }
}
