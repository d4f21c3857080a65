//! Environment variable parsing utilities for configuration.

use std::path::PathBuf;
use std::str::FromStr;

use super::loader::{ConfigFile, LlmFile};
use super::paths;
use crate::errors::Error;

/// Parse environment variable value or return error if empty/whitespace.
fn parse_env_string(name: &str, value: &str) -> Result<String, Error> {
    if value.trim().is_empty() {
        return Err(Error::Config(format!("{name} cannot be empty")));
    }
    Ok(value.trim().to_string())
}

/// Parse environment variable as a path, expanding tilde.
fn parse_env_path(name: &str, value: &str) -> Result<PathBuf, Error> {
    if value.trim().is_empty() {
        return Err(Error::Config(format!("{name} cannot be empty")));
    }
    Ok(paths::expand_tilde_path(&PathBuf::from(value)))
}

/// Parse environment variable as a number; range checks happen in validation.
fn parse_env_number<T>(name: &str, value: &str) -> Result<T, Error>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if value.trim().is_empty() {
        return Err(Error::Config(format!("{name} cannot be empty")));
    }
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {name} value: {e}")))
}

/// Parse an enum-valued variable through its `FromStr` impl.
fn parse_env_enum<T>(name: &str, value: &str) -> Result<T, Error>
where
    T: FromStr<Err = Error>,
{
    if value.trim().is_empty() {
        return Err(Error::Config(format!("{name} cannot be empty")));
    }
    value
        .parse()
        .map_err(|e| Error::Config(format!("Invalid {name} value: {e}")))
}

fn read<F, T>(lookup: &F, name: &str, parse: fn(&str, &str) -> Result<T, Error>) -> Result<Option<T>, Error>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).map(|value| parse(name, &value)).transpose()
}

/// Build the environment layer from `AMEM_*` variables.
///
/// `lookup` resolves a variable name to its value; production code passes
/// `std::env::var`.
pub fn env_layer<F>(lookup: &F) -> Result<ConfigFile, Error>
where
    F: Fn(&str) -> Option<String>,
{
    let api_key = match read(lookup, "AMEM_API_KEY", parse_env_string)? {
        Some(key) => Some(key),
        None => read(lookup, "OPENAI_API_KEY", parse_env_string)?,
    };

    Ok(ConfigFile {
        database_path: read(lookup, "AMEM_DATABASE_PATH", parse_env_path)?,
        index_path: read(lookup, "AMEM_INDEX_PATH", parse_env_path)?,
        embedding_model: read(lookup, "AMEM_EMBEDDING_MODEL", parse_env_string)?,
        model_cache: read(lookup, "AMEM_MODEL_CACHE", parse_env_path)?,
        distance_metric: read(lookup, "AMEM_DISTANCE_METRIC", parse_env_enum)?,
        llm: LlmFile {
            backend: read(lookup, "AMEM_LLM_BACKEND", parse_env_enum)?,
            model: read(lookup, "AMEM_LLM_MODEL", parse_env_string)?,
            api_key,
            base_url: read(lookup, "AMEM_LLM_BASE_URL", parse_env_string)?,
        },
        llm_timeout_secs: read(lookup, "AMEM_LLM_TIMEOUT_SECS", parse_env_number)?,
        embed_timeout_secs: read(lookup, "AMEM_EMBED_TIMEOUT_SECS", parse_env_number)?,
        max_attempts: read(lookup, "AMEM_MAX_ATTEMPTS", parse_env_number)?,
        retry_base_delay_ms: None,
        link_similarity_threshold: read(
            lookup,
            "AMEM_LINK_SIMILARITY_THRESHOLD",
            parse_env_number,
        )?,
        search_similarity_floor: None,
        link_candidates: read(lookup, "AMEM_LINK_CANDIDATES", parse_env_number)?,
        enrichment_concurrency: read(lookup, "AMEM_ENRICHMENT_CONCURRENCY", parse_env_number)?,
        enrichment_mode: read(lookup, "AMEM_ENRICHMENT_MODE", parse_env_enum)?,
    })
}
