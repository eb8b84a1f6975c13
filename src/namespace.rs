//! Namespace key resolution.
//!
//! The namespace scopes which remote objects and which index belong to this
//! sync target. An explicit key always wins; otherwise it is derived from
//! the CI repository identifier, the git `origin` remote, or finally the
//! source directory name.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::Command;

use crate::config::Config;

/// Resolve the namespace key for this run.
pub fn resolve_namespace(config: &Config) -> Result<String> {
    if let Some(key) = &config.namespace.key {
        return Ok(key.trim().to_string());
    }

    if let Ok(repo) = std::env::var("GITHUB_REPOSITORY") {
        if let Some(key) = sanitize(&repo) {
            tracing::debug!(namespace = %key, "namespace from GITHUB_REPOSITORY");
            return Ok(key);
        }
    }

    match git_origin_url(&config.source.root) {
        Ok(url) => {
            if let Some(key) = repo_from_remote_url(&url).as_deref().and_then(sanitize) {
                tracing::debug!(namespace = %key, "namespace from git origin");
                return Ok(key);
            }
        }
        Err(err) => tracing::debug!(error = %err, "no git origin remote"),
    }

    let dir_name = std::fs::canonicalize(&config.source.root)
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()));
    if let Some(key) = dir_name.as_deref().and_then(sanitize) {
        tracing::debug!(namespace = %key, "namespace from directory name");
        return Ok(key);
    }

    bail!("Could not derive a namespace key; set namespace.key or pass --namespace")
}

fn git_origin_url(repo_dir: &Path) -> Result<String> {
    let output = Command::new("git")
        .args(["remote", "get-url", "origin"])
        .current_dir(repo_dir)
        .output()
        .with_context(|| "Failed to execute 'git remote'. Is git installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git remote get-url failed: {}", stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Reduce a git remote URL to `owner/repo`.
///
/// Handles `https://host/owner/repo(.git)`, `ssh://git@host/owner/repo` and
/// scp-like `git@host:owner/repo.git`.
pub fn repo_from_remote_url(url: &str) -> Option<String> {
    let url = url.trim().trim_end_matches('/');
    let url = url.strip_suffix(".git").unwrap_or(url);

    let path = if let Some((_, rest)) = url.split_once("://") {
        rest.split_once('/').map(|(_, p)| p)?
    } else if let Some((_, rest)) = url.split_once(':') {
        rest
    } else {
        url
    };

    let mut parts = path.rsplit('/').filter(|s| !s.is_empty());
    let repo = parts.next()?;
    match parts.next() {
        Some(owner) => Some(format!("{}/{}", owner, repo)),
        None => Some(repo.to_string()),
    }
}

/// Turn an identifier into a usable key: `/` becomes `-`, blanks are rejected.
fn sanitize(raw: &str) -> Option<String> {
    let key = raw.trim().replace('/', "-");
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}
