use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::SourceConfig;
use crate::identity;
use crate::models::LocalSet;

/// A file matched by the pattern but left out of the local set.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub relative_path: String,
    pub reason: String,
}

/// Result of walking the source root.
#[derive(Debug, Default)]
pub struct LocalScan {
    pub files: LocalSet,
    /// Files that matched but were filtered out (empty or unsupported).
    pub skipped: Vec<SkippedFile>,
    /// Relative paths whose content could not be read. Remote objects for
    /// these paths must not be treated as orphans.
    pub unreadable: BTreeSet<String>,
}

/// Walk `source.root`, filter by pattern and eligibility, and derive an
/// identity for every remaining file.
///
/// Walk errors on the root itself are fatal; a failure to read or hash one
/// file only excludes that file.
pub fn scan_local(source: &SourceConfig, namespace: &str) -> Result<LocalScan> {
    let root = &source.root;
    if !root.is_dir() {
        bail!("Source root does not exist: {}", root.display());
    }

    let include_set = build_globset(std::slice::from_ref(&source.pattern))?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(source.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut candidates: Vec<(PathBuf, String)> = Vec::new();
    let mut scan = LocalScan::default();

    let walker = WalkDir::new(root).follow_links(source.follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => return Err(err.into()),
            Err(err) => {
                tracing::warn!(error = %err, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = identity::normalize_relative(relative);

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if !include_set.is_match(&rel_str) {
            continue;
        }

        let size = match entry.metadata() {
            Ok(meta) => meta.len(),
            Err(err) => {
                tracing::warn!(path = %rel_str, error = %err, "failed to stat file");
                scan.unreadable.insert(rel_str);
                continue;
            }
        };

        if let Some(reason) = identity::eligibility(path, size) {
            tracing::debug!(path = %rel_str, reason = reason.as_str(), "skipping file");
            scan.skipped.push(SkippedFile {
                relative_path: rel_str,
                reason: reason.as_str().to_string(),
            });
            continue;
        }

        candidates.push((path.to_path_buf(), rel_str));
    }

    // Sort for deterministic ordering
    candidates.sort_by(|a, b| a.1.cmp(&b.1));
    scan.skipped.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    for (path, rel_str) in candidates {
        match identity::derive(namespace, &path, Path::new(&rel_str)) {
            Ok(file) if file.size_bytes == 0 => {
                // Truncated between stat and read.
                scan.skipped.push(SkippedFile {
                    relative_path: rel_str,
                    reason: identity::SkipReason::Empty.as_str().to_string(),
                });
            }
            Ok(file) => {
                scan.files.insert(file.identity.key(), file);
            }
            Err(err) => {
                let error = format!("{:#}", err);
                tracing::warn!(path = %rel_str, error = %error, "failed to read file");
                scan.unreadable.insert(rel_str);
            }
        }
    }

    Ok(scan)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
