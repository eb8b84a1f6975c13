//! Identity derivation for local files.
//!
//! A file's identity combines the run's namespace, a SHA-256 fingerprint of
//! its full byte stream and its path relative to the source root. Metadata
//! such as mtime never enters the fingerprint, so touching a file is a no-op
//! while any content change yields a new identity.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::models::{Identity, LocalFile};

/// Extensions accepted by the remote index, compared case-insensitively.
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "c", "cpp", "cs", "css", "doc", "docx", "go", "html", "java", "js", "json", "md", "pdf",
    "php", "pptx", "py", "rb", "sh", "tex", "ts", "txt",
];

/// Why a file was left out of the local set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnsupportedExtension,
    Empty,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::UnsupportedExtension => "unsupported extension",
            SkipReason::Empty => "empty file",
        }
    }
}

pub fn is_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            SUPPORTED_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

/// Pre-condition check applied before any hashing.
pub fn eligibility(path: &Path, size_bytes: u64) -> Option<SkipReason> {
    if !is_supported_extension(path) {
        Some(SkipReason::UnsupportedExtension)
    } else if size_bytes == 0 {
        Some(SkipReason::Empty)
    } else {
        None
    }
}

/// Hex SHA-256 of everything `reader` yields.
pub fn fingerprint_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of an in-memory buffer; equal to [`fingerprint_reader`] over
/// the same bytes.
pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Normalize a relative path to forward slashes.
pub fn normalize_relative(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Derive the identity of an eligible file by streaming its content.
pub fn derive(namespace: &str, absolute_path: &Path, relative: &Path) -> Result<LocalFile> {
    let file = File::open(absolute_path)
        .with_context(|| format!("Failed to open {}", absolute_path.display()))?;
    let size_bytes = file
        .metadata()
        .with_context(|| format!("Failed to stat {}", absolute_path.display()))?
        .len();
    let fingerprint = fingerprint_reader(io::BufReader::new(file))
        .with_context(|| format!("Failed to hash {}", absolute_path.display()))?;

    Ok(LocalFile {
        identity: Identity::new(namespace, &fingerprint, &normalize_relative(relative)),
        absolute_path: absolute_path.to_path_buf(),
        size_bytes,
    })
}
