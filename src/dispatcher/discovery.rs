//! Test file discovery
//!
//! Directory arguments are walked and filtered by suffix; file arguments pass
//! through as given. Order follows the arguments, with directory contents
//! sorted by name so two runs over the same tree agree.

use std::collections::HashSet;
use std::path::Path;
use walkdir::WalkDir;

use crate::config::ConfigError;

/// Expand `paths` into an ordered, duplicate-free list of test files
pub fn discover<S: AsRef<str>>(paths: &[S], suffix: &str) -> Result<Vec<String>, ConfigError> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();

    for arg in paths {
        let arg = arg.as_ref();
        let metadata = std::fs::metadata(arg).map_err(|source| ConfigError::MissingPath {
            path: arg.to_string(),
            source,
        })?;

        if !metadata.is_dir() {
            if seen.insert(arg.to_string()) {
                files.push(arg.to_string());
            }
            continue;
        }

        for entry in WalkDir::new(arg).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(|e| ConfigError::MissingPath {
                path: e.path().map(|p| p.display().to_string()).unwrap_or_else(|| arg.to_string()),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() || !has_suffix(entry.path(), suffix) {
                continue;
            }

            let file = entry.path().to_string_lossy().into_owned();
            if seen.insert(file.clone()) {
                files.push(file);
            }
        }
    }

    Ok(files)
}

fn has_suffix(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.ends_with(suffix))
        .unwrap_or(false)
}
