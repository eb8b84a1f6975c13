//! Index resolution.
//!
//! Exactly one index is authoritative per namespace. It is located by its
//! [`NAMESPACE_TAG`] metadata, never by display name, scanning every page of
//! the index listing; the first match in page order wins. When nothing
//! carries the tag, [`create_index`] makes a new one with the tag set, which
//! a sync does only after the remote snapshot has been read in full. Tags on
//! existing indexes are never modified.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use futures::TryStreamExt;

use crate::models::{IndexInfo, NAMESPACE_TAG};
use crate::remote::{paginate, RemoteApi};

/// Find the index tagged with `namespace` without creating anything.
pub async fn find_index(api: &dyn RemoteApi, namespace: &str) -> Result<Option<IndexInfo>> {
    let mut indexes = paginate(|cursor| api.list_indexes(cursor));
    while let Some(index) = indexes
        .try_next()
        .await
        .context("Failed to list remote indexes")?
    {
        if index.is_tagged(namespace) {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

/// Create a new index tagged with `namespace`.
pub async fn create_index(
    api: &dyn RemoteApi,
    namespace: &str,
    display_name: &str,
) -> Result<IndexInfo> {
    let mut metadata = BTreeMap::new();
    metadata.insert(NAMESPACE_TAG.to_string(), namespace.to_string());
    let index = api
        .create_index(display_name, &metadata)
        .await
        .with_context(|| format!("Failed to create index for namespace '{}'", namespace))?;
    tracing::info!(index = %index.id, namespace, "created index");
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRemote;

    fn tag(namespace: &str) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        metadata.insert(NAMESPACE_TAG.to_string(), namespace.to_string());
        metadata
    }

    #[tokio::test]
    async fn finds_tagged_index_on_a_later_page() {
        let remote = MemoryRemote::new().with_page_size(2);
        remote.seed_index("ns", BTreeMap::new());
        remote.seed_index("a", tag("other"));
        remote.seed_index("b", tag("other2"));
        let wanted = remote.seed_index("display label", tag("ns"));

        let index = find_index(&remote, "ns").await.unwrap();
        assert_eq!(index, Some(wanted));
        assert_eq!(remote.indexes().len(), 4);
    }

    #[tokio::test]
    async fn first_match_wins() {
        let remote = MemoryRemote::new().with_page_size(1);
        let first = remote.seed_index("one", tag("ns"));
        remote.seed_index("two", tag("ns"));

        assert_eq!(find_index(&remote, "ns").await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn name_alone_does_not_match() {
        let remote = MemoryRemote::new();
        remote.seed_index("ns", BTreeMap::new());
        assert_eq!(find_index(&remote, "ns").await.unwrap(), None);
    }

    #[tokio::test]
    async fn creates_and_tags_when_missing() {
        let remote = MemoryRemote::new();
        assert_eq!(find_index(&remote, "ns").await.unwrap(), None);
        let created = create_index(&remote, "ns", "Handbook").await.unwrap();
        assert_eq!(created.name, "Handbook");
        assert!(created.is_tagged("ns"));

        let found = find_index(&remote, "ns").await.unwrap();
        assert_eq!(found, Some(created));
        assert_eq!(remote.indexes().len(), 1);
    }

    #[tokio::test]
    async fn creation_failure_is_an_error() {
        let remote = MemoryRemote::new();
        remote.fail_create_index();
        assert!(create_index(&remote, "ns", "ns").await.is_err());
        assert!(remote.indexes().is_empty());
    }
}
