//! Path expansion utilities for tilde (`~`) substitution.

use std::path::{Path, PathBuf};

/// Expand a leading `~` to the home directory, in place.
pub fn expand_tilde(path: &mut PathBuf) {
    let expanded = expand_tilde_path(path);
    *path = expanded;
}

/// Expand a leading `~` to the home directory.
///
/// Paths without a leading `~`, or systems without a home directory, are
/// returned unchanged.
pub fn expand_tilde_path(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
