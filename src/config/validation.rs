//! Configuration validation logic.

use super::Config;
use crate::errors::Error;
use crate::llm::LlmBackend;

/// Upper bound for `max_attempts`.
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

/// Upper bound for `link_candidates`.
pub const MAX_LINK_CANDIDATES: usize = 20;

/// Validates configuration values.
pub struct ConfigValidator<'a> {
    config: &'a Config,
}

impl<'a> ConfigValidator<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Validate all configuration values for correctness and constraints.
    ///
    /// Checks that:
    /// - Similarity thresholds are between 0.0 and 1.0, not NaN or infinite
    /// - Timeouts are positive
    /// - Attempts, candidates and concurrency are within bounds
    /// - Model names and the database path are not empty
    /// - The OpenAI backend has a credential
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if any validation check fails.
    pub fn validate(&self) -> Result<(), Error> {
        validate_unit_interval(
            "link similarity threshold",
            self.config.link_similarity_threshold,
        )?;
        validate_unit_interval(
            "search similarity floor",
            self.config.search_similarity_floor,
        )?;
        self.validate_timeouts()?;
        self.validate_bounds()?;
        self.validate_names()?;
        self.validate_paths()?;
        self.validate_credential()?;

        Ok(())
    }

    fn validate_timeouts(&self) -> Result<(), Error> {
        if self.config.llm_timeout_secs == 0 {
            return Err(Error::Config(
                "LLM timeout must be greater than 0 seconds".to_string(),
            ));
        }
        if self.config.embed_timeout_secs == 0 {
            return Err(Error::Config(
                "Embedding timeout must be greater than 0 seconds".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_bounds(&self) -> Result<(), Error> {
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&self.config.max_attempts) {
            return Err(Error::Config(format!(
                "Invalid max attempts: {} (must be between 1 and {MAX_ATTEMPTS_LIMIT})",
                self.config.max_attempts
            )));
        }
        if self.config.link_candidates > MAX_LINK_CANDIDATES {
            return Err(Error::Config(format!(
                "Invalid link candidates: {} (maximum {MAX_LINK_CANDIDATES})",
                self.config.link_candidates
            )));
        }
        if self.config.enrichment_concurrency == 0 {
            return Err(Error::Config(
                "Enrichment concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_names(&self) -> Result<(), Error> {
        if self.config.embedding_model.trim().is_empty() {
            return Err(Error::Config("Embedding model cannot be empty".to_string()));
        }
        if self.config.llm.model.trim().is_empty() {
            return Err(Error::Config("LLM model cannot be empty".to_string()));
        }
        Ok(())
    }

    fn validate_paths(&self) -> Result<(), Error> {
        if self.config.database_path.as_os_str().is_empty() {
            return Err(Error::Config("Database path cannot be empty".to_string()));
        }
        if let Some(index_path) = &self.config.index_path {
            if index_path == &self.config.database_path {
                return Err(Error::Config(
                    "Index snapshot path must differ from the database path".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn validate_credential(&self) -> Result<(), Error> {
        if self.config.llm.backend == LlmBackend::OpenAi && self.config.llm.api_key.is_none() {
            return Err(Error::Config(
                "The openai backend requires an API key (AMEM_API_KEY or OPENAI_API_KEY)"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_unit_interval(name: &str, value: f64) -> Result<(), Error> {
    if value.is_nan() || value.is_infinite() {
        return Err(Error::Config(format!(
            "Invalid {name}: NaN and infinity are not allowed"
        )));
    }
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::Config(format!(
            "Invalid {name}: {value} (must be between 0.0 and 1.0)"
        )));
    }
    Ok(())
}
