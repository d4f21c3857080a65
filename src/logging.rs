//! Optional `tracing` subscriber setup for hosts that have none of their own.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

use crate::errors::Error;

static INITIALIZED: OnceLock<()> = OnceLock::new();

/// Install a global fmt subscriber.
///
/// The filter comes from `AMEM_LOG`, then `RUST_LOG`, then `default_filter`
/// (for example `"amem=info"`). Calling this again is a no-op.
///
/// # Errors
///
/// Returns `Error::Config` if `default_filter` is not a valid filter, or if
/// another global subscriber was installed by someone else.
pub fn init_logging(default_filter: &str) -> Result<(), Error> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_from_env("AMEM_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| Error::Config(format!("Invalid log filter '{default_filter}': {e}")))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))?;

    let _ = INITIALIZED.set(());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_is_idempotent() {
        if init_logging("amem=debug").is_ok() {
            assert!(init_logging("amem=debug").is_ok());
        }
    }
}
