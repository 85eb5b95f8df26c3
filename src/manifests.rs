//! Loading constraint manifests from disk.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use constraint_reconciler::{Constraint, InMemoryResourceStore};
use tracing::{debug, info};

const PATTERNS: [&str; 3] = ["*.yaml", "*.yml", "*.json"];

/// Manifest files in `dir`, sorted by path.
///
/// # Errors
///
/// Returns an error if `dir` does not exist or a glob pattern is invalid.
pub fn discover(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        anyhow::bail!("manifest directory does not exist: {}", dir.display());
    }

    let mut paths = Vec::new();
    for pattern in PATTERNS {
        let full = dir.join(pattern);
        let entries = glob::glob(&full.to_string_lossy())
            .with_context(|| format!("invalid manifest pattern {}", full.display()))?;
        paths.extend(entries.filter_map(std::result::Result::ok));
    }
    paths.sort();
    Ok(paths)
}

/// Parse every constraint in `path`. YAML files may hold several documents.
///
/// # Errors
///
/// Returns an error if the file cannot be read or a document is not a valid
/// constraint.
pub fn parse(path: &Path) -> Result<Vec<Constraint>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;

    if path.extension().is_some_and(|e| e == "json") {
        let constraint: Constraint = serde_json::from_str(&content)
            .with_context(|| format!("invalid constraint in {}", path.display()))?;
        return Ok(vec![constraint]);
    }

    serde_yaml::Deserializer::from_str(&content)
        .map(|document| {
            serde::Deserialize::deserialize(document)
                .with_context(|| format!("invalid constraint in {}", path.display()))
        })
        .collect()
}

/// Load all manifests in `dir` into `store`. Returns the number loaded.
///
/// # Errors
///
/// Returns an error on the first unreadable manifest or rejected create.
pub async fn load_into(dir: &Path, store: &InMemoryResourceStore) -> Result<usize> {
    let mut loaded = 0usize;
    for path in discover(dir)? {
        for constraint in parse(&path)? {
            debug!(key = %constraint.key(), path = %path.display(), "Loading constraint");
            store
                .apply(constraint)
                .await
                .with_context(|| format!("failed to store constraint from {}", path.display()))?;
            loaded = loaded.saturating_add(1);
        }
    }
    info!(count = loaded, dir = %dir.display(), "Constraint manifests loaded");
    Ok(loaded)
}
