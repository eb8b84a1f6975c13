//! Core data models used throughout vecsync.
//!
//! These types describe the two sides being reconciled (local files and
//! remote objects), the plan that connects them, and the per-phase reports
//! produced when a plan is applied.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Length of a hex-encoded SHA-256 fingerprint.
pub const FINGERPRINT_LEN: usize = 64;

/// Metadata key carrying the namespace on the remote index.
pub const NAMESPACE_TAG: &str = "vecsync_namespace";

/// Immutable identity of a local file: namespace, content fingerprint and
/// path relative to the source root.
///
/// Serialized as `"{namespace}-{fingerprint}/{relative_path}"`, which is the
/// name the remote object is uploaded under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Identity {
    pub namespace: String,
    pub fingerprint: String,
    pub relative_path: String,
}

impl Identity {
    pub fn new(namespace: &str, fingerprint: &str, relative_path: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            fingerprint: fingerprint.to_string(),
            relative_path: relative_path.to_string(),
        }
    }

    /// The opaque key used as the remote object name.
    pub fn key(&self) -> String {
        format!(
            "{}-{}/{}",
            self.namespace, self.fingerprint, self.relative_path
        )
    }

    /// Parse a remote object name as an identity of `namespace`.
    ///
    /// Fails unless the name is `"{namespace}-"` followed by a full
    /// lowercase hex fingerprint, a `/` and a non-empty relative path. A
    /// namespace `foo` therefore never claims names belonging to `foo-bar`.
    pub fn parse(namespace: &str, name: &str) -> Result<Self> {
        let Some(rest) = name
            .strip_prefix(namespace)
            .and_then(|r| r.strip_prefix('-'))
        else {
            bail!("'{}' is not in namespace '{}'", name, namespace);
        };
        let Some((fingerprint, relative_path)) = rest.split_once('/') else {
            bail!("'{}' has no relative path", name);
        };
        if fingerprint.len() != FINGERPRINT_LEN
            || !fingerprint
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            bail!("'{}' does not carry a content fingerprint", name);
        }
        if relative_path.is_empty() {
            bail!("'{}' has an empty relative path", name);
        }
        Ok(Self::new(namespace, fingerprint, relative_path))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// A supported, non-empty local file with its derived identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalFile {
    pub identity: Identity,
    pub absolute_path: PathBuf,
    pub size_bytes: u64,
}

/// Local set keyed by serialized identity.
pub type LocalSet = BTreeMap<String, LocalFile>;

/// An object in the remote collection. Its identity is `id`; `name` may
/// repeat across objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
}

/// A remote index and its metadata tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexInfo {
    pub id: String,
    pub name: String,
    pub metadata: BTreeMap<String, String>,
}

impl IndexInfo {
    /// Whether this index is tagged with `namespace`.
    pub fn is_tagged(&self, namespace: &str) -> bool {
        self.metadata.get(NAMESPACE_TAG).map(String::as_str) == Some(namespace)
    }
}

/// One membership record of an index.
///
/// `live` is false for records the backend keeps around after linking
/// failed or was cancelled. Such an object is not searchable, but the
/// record still has to be removed before the object is deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMember {
    pub object_id: String,
    pub live: bool,
}

impl IndexMember {
    pub fn live(object_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            live: true,
        }
    }
}

/// A remote object scheduled for removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedDelete {
    pub object: RemoteObject,
    /// Whether the index holds a membership record for the object (live or
    /// not) that must be removed before deletion.
    pub linked: bool,
}

/// The three-way diff consumed by the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub to_create_and_link: Vec<LocalFile>,
    pub to_link_only: Vec<RemoteObject>,
    pub to_delete: Vec<PlannedDelete>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.to_create_and_link.is_empty()
            && self.to_link_only.is_empty()
            && self.to_delete.is_empty()
    }
}

/// Lifecycle state of a batched link request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    #[serde(alias = "cancelling")]
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, BatchState::InProgress)
    }
}

/// Per-item counts reported for a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchCounts {
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total: u64,
}

/// Status of a batched link request as last reported by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchStatus {
    pub id: String,
    pub state: BatchState,
    pub counts: BatchCounts,
}

/// A single item that failed during a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    /// Object id or identity key the failure refers to.
    pub subject: String,
    pub error: String,
}

/// Outcome of one executor phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<ItemFailure>,
}

impl PhaseReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub(crate) fn fail(&mut self, subject: impl Into<String>, error: &anyhow::Error) {
        self.failures.push(ItemFailure {
            subject: subject.into(),
            error: format!("{:#}", error),
        });
    }
}

/// Outcome of applying a full plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionReport {
    pub delete: PhaseReport,
    pub upload: PhaseReport,
    pub create_link: PhaseReport,
    pub link_only: PhaseReport,
}

impl ExecutionReport {
    pub fn has_failures(&self) -> bool {
        self.failure_count() > 0
    }

    pub fn failure_count(&self) -> usize {
        self.delete.failed()
            + self.upload.failed()
            + self.create_link.failed()
            + self.link_only.failed()
    }
}
