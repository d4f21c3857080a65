//! LLM-backed derivation of tags, category, context and links for a note.
//!
//! One prompt per attempt, bounded by a timeout, retried with exponential
//! backoff while the failure is transient. A permanent failure never propagates: the outcome is marked
//! `Fallback` and carries only the similarity-based link candidates.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::Error;
use crate::llm::LanguageModelProvider;
use crate::note::{EnrichmentStatus, Note, normalize_label, normalize_tags};

/// Upper bound on a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Candidate content is cut to this many characters in the prompt.
const CANDIDATE_PREVIEW_CHARS: usize = 500;

/// Read access to existing notes, used to find link candidates.
pub trait NeighborSearch: Send + Sync {
    /// Notes most similar to `note`, most similar first, `note` itself
    /// excluded, with `similarity` populated.
    fn neighbors(&self, note: &Note, k: usize) -> Result<Vec<Note>, Error>;
}

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    /// Budget for a single language-model call.
    pub timeout: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub link_candidates: usize,
    pub link_similarity_threshold: f64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        EnrichmentConfig::from(&Config::default())
    }
}

impl From<&Config> for EnrichmentConfig {
    fn from(config: &Config) -> Self {
        EnrichmentConfig {
            timeout: Duration::from_secs(config.llm_timeout_secs),
            max_attempts: config.max_attempts,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            link_candidates: config.link_candidates,
            link_similarity_threshold: config.link_similarity_threshold,
        }
    }
}

/// Fields derived for one note.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichmentResult {
    pub tags: Vec<String>,
    pub category: Option<String>,
    pub context: Option<String>,
    /// Ids of existing notes this note should link to.
    pub links: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EnrichmentOutcome {
    pub result: EnrichmentResult,
    /// `Enriched` or `Fallback`.
    pub status: EnrichmentStatus,
    /// Language-model calls made.
    pub attempts: u32,
}

pub struct EnrichmentPipeline {
    llm: Arc<dyn LanguageModelProvider>,
    config: EnrichmentConfig,
}

impl EnrichmentPipeline {
    pub fn new(llm: Arc<dyn LanguageModelProvider>, config: EnrichmentConfig) -> Self {
        EnrichmentPipeline { llm, config }
    }

    /// Derive enrichment fields for `note`. Never fails.
    pub async fn enrich(&self, note: &Note, existing: &dyn NeighborSearch) -> EnrichmentOutcome {
        let candidates = self.link_candidates(note, existing);
        let candidate_ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let prompt = build_prompt(note, &candidates);

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0;
        for attempt in 1..=max_attempts {
            attempts = attempt;
            match self.attempt(&prompt, &candidate_ids).await {
                Ok(result) => {
                    debug!(
                        note_id = %note.id,
                        provider = self.llm.name(),
                        attempt,
                        tags = result.tags.len(),
                        links = result.links.len(),
                        "enrichment succeeded"
                    );
                    return EnrichmentOutcome {
                        result,
                        status: EnrichmentStatus::Enriched,
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    warn!(
                        note_id = %note.id,
                        provider = self.llm.name(),
                        attempt,
                        max_attempts,
                        error = %e,
                        "enrichment attempt failed"
                    );
                    if !e.is_transient() {
                        break;
                    }
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(backoff_delay(self.config.retry_base_delay, attempt)).await;
            }
        }

        warn!(
            note_id = %note.id,
            provider = self.llm.name(),
            attempts,
            "enrichment failed permanently, keeping user-supplied fields"
        );
        EnrichmentOutcome {
            result: EnrichmentResult {
                links: candidate_ids,
                ..Default::default()
            },
            status: EnrichmentStatus::Fallback,
            attempts,
        }
    }

    async fn attempt(&self, prompt: &str, candidate_ids: &[String]) -> Result<EnrichmentResult, Error> {
        let seconds = self.config.timeout.as_secs();
        let reply = tokio::time::timeout(self.config.timeout, self.llm.generate(prompt))
            .await
            .map_err(|_| Error::Timeout {
                operation: "language model call".to_string(),
                seconds,
            })??;
        parse_response(&reply, candidate_ids)
    }

    fn link_candidates(&self, note: &Note, existing: &dyn NeighborSearch) -> Vec<Note> {
        if self.config.link_candidates == 0 {
            return Vec::new();
        }
        match existing.neighbors(note, self.config.link_candidates) {
            Ok(neighbors) => neighbors
                .into_iter()
                .filter(|n| n.id != note.id)
                .filter(|n| {
                    n.similarity.unwrap_or(0.0) >= self.config.link_similarity_threshold
                })
                .take(self.config.link_candidates)
                .collect(),
            Err(e) => {
                warn!(note_id = %note.id, error = %e, "neighbour search failed, no link candidates");
                Vec::new()
            }
        }
    }
}

/// `base * 2^(attempt-1)`, capped.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

fn build_prompt(note: &Note, candidates: &[Note]) -> String {
    let mut prompt = String::from(
        "Analyze the note below for an agent's long-term memory and return a JSON object \
         with these fields:\n\
         - \"tags\": 3 to 6 short lowercase topic tags\n\
         - \"category\": one short classification label\n\
         - \"context\": one or two sentences on what the note is about and when it is useful\n\
         - \"links\": ids of the related notes listed below that are genuinely connected \
         to this note (may be empty)\n\n",
    );

    prompt.push_str("Note:\n");
    prompt.push_str(&note.content);
    prompt.push_str("\n\n");

    if !note.tags.is_empty() {
        prompt.push_str(&format!("Existing tags: {}\n", note.tags.join(", ")));
    }
    if let Some(category) = &note.category {
        prompt.push_str(&format!("Existing category: {category}\n"));
    }

    if candidates.is_empty() {
        prompt.push_str("Related notes: none\n");
    } else {
        prompt.push_str("Related notes:\n");
        for candidate in candidates {
            let preview: String = candidate.content.chars().take(CANDIDATE_PREVIEW_CHARS).collect();
            prompt.push_str(&format!("- id: {}\n  content: {}\n", candidate.id, preview));
        }
    }

    prompt.push_str("\nRespond with the JSON object only.");
    prompt
}

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
    category: Option<String>,
    context: Option<String>,
    links: Option<Vec<String>>,
}

/// Outermost `{ ... }` in `text`, ignoring code fences and prose around it.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse a model reply into an [`EnrichmentResult`].
///
/// # Errors
///
/// Returns `Error::Provider` if the reply holds no JSON object, the object is
/// malformed, or it carries no tags, category or context at all.
pub fn parse_response(text: &str, candidate_ids: &[String]) -> Result<EnrichmentResult, Error> {
    let json = extract_json_object(text).ok_or_else(|| {
        Error::Provider("language model reply contains no JSON object".to_string())
    })?;
    let raw: RawAnalysis = serde_json::from_str(json)
        .map_err(|e| Error::Provider(format!("malformed enrichment JSON: {e}")))?;

    let tags = normalize_tags(raw.tags.iter().chain(raw.keywords.iter()));
    let category = normalize_label(raw.category);
    let context = normalize_label(raw.context);
    if tags.is_empty() && category.is_none() && context.is_none() {
        return Err(Error::Provider(
            "enrichment JSON has no tags, category or context".to_string(),
        ));
    }

    let links = match raw.links {
        Some(chosen) => {
            let chosen: Vec<String> = chosen.into_iter().map(|id| id.trim().to_string()).collect();
            candidate_ids
                .iter()
                .filter(|id| chosen.contains(id))
                .cloned()
                .collect()
        }
        None => candidate_ids.to_vec(),
    };

    Ok(EnrichmentResult {
        tags,
        category,
        context,
        links,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Replays canned replies in order; the last one repeats.
    struct ScriptedLlm {
        replies: Mutex<VecDeque<Result<String, String>>>,
        calls: AtomicU32,
    }

    impl ScriptedLlm {
        fn new(replies: Vec<Result<&str, &str>>) -> Self {
            ScriptedLlm {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LanguageModelProvider for ScriptedLlm {
        async fn generate(&self, _prompt: &str) -> Result<String, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock();
            let reply = if replies.len() > 1 {
                replies.pop_front()
            } else {
                replies.front().cloned()
            };
            match reply {
                Some(Ok(text)) => Ok(text),
                Some(Err(msg)) => Err(Error::Provider(msg)),
                None => Err(Error::Provider("no reply scripted".to_string())),
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    struct HangingLlm;

    #[async_trait]
    impl LanguageModelProvider for HangingLlm {
        async fn generate(&self, _prompt: &str) -> Result<String, Error> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }

        fn name(&self) -> &str {
            "hanging"
        }
    }

    struct FixedNeighbors(Vec<Note>);

    impl NeighborSearch for FixedNeighbors {
        fn neighbors(&self, _note: &Note, k: usize) -> Result<Vec<Note>, Error> {
            Ok(self.0.iter().take(k).cloned().collect())
        }
    }

    struct BrokenNeighbors;

    impl NeighborSearch for BrokenNeighbors {
        fn neighbors(&self, _note: &Note, _k: usize) -> Result<Vec<Note>, Error> {
            Err(Error::Consistency("index unavailable".to_string()))
        }
    }

    fn note(content: &str) -> Note {
        Note::new(content.to_string(), vec![1.0, 0.0], Vec::new(), None)
    }

    fn neighbor(content: &str, similarity: f64) -> Note {
        let mut n = note(content);
        n.similarity = Some(similarity);
        n
    }

    fn fast_config() -> EnrichmentConfig {
        EnrichmentConfig {
            timeout: Duration::from_millis(200),
            max_attempts: 3,
            retry_base_delay: Duration::ZERO,
            link_candidates: 3,
            link_similarity_threshold: 0.5,
        }
    }

    #[test]
    fn test_parse_response_with_code_fence() {
        let reply = "Sure! Here it is:\n```json\n{\"tags\": [\"UI\", \"ui\", \"dark-mode\"], \
                     \"category\": \"Preferences\", \"context\": \"Display settings.\"}\n```";
        let result = parse_response(reply, &[]).unwrap();
        assert_eq!(result.tags, vec!["UI".to_string(), "dark-mode".to_string()]);
        assert_eq!(result.category.as_deref(), Some("Preferences"));
        assert_eq!(result.context.as_deref(), Some("Display settings."));
    }

    #[test]
    fn test_parse_response_restricts_links_to_candidates() {
        let candidates = vec!["a".to_string(), "b".to_string()];
        let reply = r#"{"tags":["x"],"links":["b","hallucinated"]}"#;
        let result = parse_response(reply, &candidates).unwrap();
        assert_eq!(result.links, vec!["b".to_string()]);
    }

    #[test]
    fn test_parse_response_missing_links_keeps_candidates() {
        let candidates = vec!["a".to_string()];
        let result = parse_response(r#"{"category":"Work"}"#, &candidates).unwrap();
        assert_eq!(result.links, candidates);
    }

    #[test]
    fn test_parse_response_accepts_keywords() {
        let result = parse_response(r#"{"keywords":["rust","async"]}"#, &[]).unwrap();
        assert_eq!(result.tags, vec!["rust".to_string(), "async".to_string()]);
    }

    #[test]
    fn test_parse_response_rejects_garbage() {
        assert!(matches!(
            parse_response("I cannot help with that.", &[]),
            Err(Error::Provider(_))
        ));
        assert!(matches!(
            parse_response("{\"tags\": [unquoted]}", &[]),
            Err(Error::Provider(_))
        ));
        assert!(matches!(
            parse_response("{\"tags\": [], \"context\": \"  \"}", &[]),
            Err(Error::Provider(_))
        ));
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(2000));
        assert_eq!(backoff_delay(base, 20), MAX_BACKOFF);
    }

    #[test]
    fn test_prompt_lists_candidates() {
        let mut n = note("The user prefers dark mode");
        n.tags = vec!["ui".to_string()];
        let candidate = neighbor("Editor theme is solarized", 0.8);
        let prompt = build_prompt(&n, std::slice::from_ref(&candidate));
        assert!(prompt.contains("The user prefers dark mode"));
        assert!(prompt.contains("Existing tags: ui"));
        assert!(prompt.contains(&candidate.id));
    }

    #[tokio::test]
    async fn test_enrich_success_first_attempt() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(
            r#"{"tags":["ui","preferences"],"category":"Preferences","context":"UI settings."}"#,
        )]));
        let pipeline = EnrichmentPipeline::new(llm.clone(), fast_config());

        let outcome = pipeline
            .enrich(&note("The user prefers dark mode"), &FixedNeighbors(Vec::new()))
            .await;
        assert_eq!(outcome.status, EnrichmentStatus::Enriched);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result.category.as_deref(), Some("Preferences"));
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enrich_retries_then_succeeds() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Err("rate limited"),
            Ok("not json"),
            Ok(r#"{"tags":["retry"]}"#),
        ]));
        let pipeline = EnrichmentPipeline::new(llm.clone(), fast_config());

        let outcome = pipeline.enrich(&note("content"), &FixedNeighbors(Vec::new())).await;
        assert_eq!(outcome.status, EnrichmentStatus::Enriched);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.tags, vec!["retry".to_string()]);
    }

    #[tokio::test]
    async fn test_enrich_fallback_keeps_similarity_links() {
        let llm = Arc::new(ScriptedLlm::new(vec![Err("down")]));
        let pipeline = EnrichmentPipeline::new(llm.clone(), fast_config());
        let close = neighbor("close", 0.9);
        let far = neighbor("far", 0.1);

        let outcome = pipeline
            .enrich(&note("content"), &FixedNeighbors(vec![close.clone(), far]))
            .await;
        assert_eq!(outcome.status, EnrichmentStatus::Fallback);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.result.tags.is_empty());
        assert!(outcome.result.category.is_none());
        assert!(outcome.result.context.is_none());
        assert_eq!(outcome.result.links, vec![close.id]);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 3);
    }

    /// Fails with an error that retrying cannot fix.
    struct MisconfiguredLlm {
        calls: AtomicU32,
    }

    #[async_trait]
    impl LanguageModelProvider for MisconfiguredLlm {
        async fn generate(&self, _prompt: &str) -> Result<String, Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Config("missing credentials".to_string()))
        }

        fn name(&self) -> &str {
            "misconfigured"
        }
    }

    #[tokio::test]
    async fn test_enrich_stops_retrying_permanent_errors() {
        let llm = Arc::new(MisconfiguredLlm {
            calls: AtomicU32::new(0),
        });
        let pipeline = EnrichmentPipeline::new(llm.clone(), fast_config());
        let close = neighbor("close", 0.9);

        let outcome = pipeline
            .enrich(&note("content"), &FixedNeighbors(vec![close.clone()]))
            .await;
        assert_eq!(outcome.status, EnrichmentStatus::Fallback);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result.links, vec![close.id]);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enrich_times_out_each_attempt() {
        let config = EnrichmentConfig {
            timeout: Duration::from_millis(20),
            max_attempts: 2,
            ..fast_config()
        };
        let pipeline = EnrichmentPipeline::new(Arc::new(HangingLlm), config);

        let outcome = pipeline.enrich(&note("content"), &FixedNeighbors(Vec::new())).await;
        assert_eq!(outcome.status, EnrichmentStatus::Fallback);
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn test_enrich_survives_neighbor_failure() {
        let llm = Arc::new(ScriptedLlm::new(vec![Ok(r#"{"tags":["x"],"links":[]}"#)]));
        let pipeline = EnrichmentPipeline::new(llm, fast_config());

        let outcome = pipeline.enrich(&note("content"), &BrokenNeighbors).await;
        assert_eq!(outcome.status, EnrichmentStatus::Enriched);
        assert!(outcome.result.links.is_empty());
    }
}
