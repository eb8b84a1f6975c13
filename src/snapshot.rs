//! Remote snapshot reading.
//!
//! Reads every page of the namespace's objects and of the index membership
//! list into memory. Any page failure aborts the read: a partial snapshot
//! would make live objects look orphaned.

use std::collections::HashSet;

use anyhow::{Context, Result};
use futures::TryStreamExt;

use crate::models::{Identity, RemoteObject};
use crate::remote::{collect_all, paginate, RemoteApi};

/// Remote state for one namespace at the start of a run.
#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    /// Objects whose names are identities of the namespace, in scan order.
    pub objects: Vec<RemoteObject>,
    /// Ids of objects live in the resolved index.
    pub links: HashSet<String>,
    /// Ids with a membership record that is not live (linking failed or was
    /// cancelled). Not searchable, but must be unlinked before deletion.
    pub dead_links: HashSet<String>,
}

impl RemoteSnapshot {
    /// Whether `object_id` has any membership record in the index.
    pub fn has_membership(&self, object_id: &str) -> bool {
        self.links.contains(object_id) || self.dead_links.contains(object_id)
    }
}

/// Prefix every object name of `namespace` starts with.
pub fn namespace_prefix(namespace: &str) -> String {
    format!("{}-", namespace)
}

/// Page through all objects of `namespace`.
///
/// Objects whose names merely share the prefix but do not parse as an
/// identity of this namespace are left out.
pub async fn read_objects(api: &dyn RemoteApi, namespace: &str) -> Result<Vec<RemoteObject>> {
    let prefix = namespace_prefix(namespace);
    paginate(|cursor| api.list_objects(&prefix, cursor))
        .try_filter(|object| {
            futures::future::ready(Identity::parse(namespace, &object.name).is_ok())
        })
        .try_collect()
        .await
        .context("Failed to list remote objects")
}

/// Page through the membership records of `index_id`, split into live and
/// dead ids.
pub async fn read_links(
    api: &dyn RemoteApi,
    index_id: &str,
) -> Result<(HashSet<String>, HashSet<String>)> {
    let members = collect_all(paginate(|cursor| api.list_members(index_id, cursor)))
        .await
        .with_context(|| format!("Failed to list members of index {}", index_id))?;
    let (live, dead): (Vec<_>, Vec<_>) = members.into_iter().partition(|m| m.live);
    Ok((
        live.into_iter().map(|m| m.object_id).collect(),
        dead.into_iter().map(|m| m.object_id).collect(),
    ))
}

/// Read the full snapshot. `index_id` is `None` when the index does not
/// exist yet (dry runs), in which case nothing is linked.
pub async fn read_snapshot(
    api: &dyn RemoteApi,
    namespace: &str,
    index_id: Option<&str>,
) -> Result<RemoteSnapshot> {
    let objects = read_objects(api, namespace).await?;
    let (links, dead_links) = match index_id {
        Some(index_id) => read_links(api, index_id).await?,
        None => Default::default(),
    };
    tracing::info!(
        objects = objects.len(),
        linked = links.len(),
        dead = dead_links.len(),
        "read remote snapshot"
    );
    Ok(RemoteSnapshot {
        objects,
        links,
        dead_links,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRemote;
    use crate::models::Identity;
    use std::collections::BTreeMap;

    fn fp(c: char) -> String {
        std::iter::repeat(c).take(64).collect()
    }

    #[tokio::test]
    async fn reads_only_own_namespace_across_pages() {
        let remote = MemoryRemote::new().with_page_size(2);
        let mine: Vec<_> = ["a.md", "b.md", "c/d.md"]
            .iter()
            .map(|p| remote.seed_object(&Identity::new("ns", &fp('a'), p).key()))
            .collect();
        remote.seed_object(&Identity::new("ns-extra", &fp('b'), "a.md").key());
        remote.seed_object("ns-notes.md");
        remote.seed_object(&Identity::new("other", &fp('c'), "a.md").key());

        let index = remote.seed_index("ns", BTreeMap::new());
        remote.link(&index.id, &mine[1].id);

        let snapshot = read_snapshot(&remote, "ns", Some(&index.id)).await.unwrap();
        assert_eq!(snapshot.objects, mine);
        assert_eq!(snapshot.links.len(), 1);
        assert!(snapshot.links.contains(&mine[1].id));
    }

    #[tokio::test]
    async fn failed_memberships_are_kept_apart() {
        let remote = MemoryRemote::new();
        let a = remote.seed_object(&Identity::new("ns", &fp('a'), "a.md").key());
        let b = remote.seed_object(&Identity::new("ns", &fp('b'), "b.md").key());
        let index = remote.seed_index("ns", BTreeMap::new());
        remote.link(&index.id, &a.id);
        remote.link_failed(&index.id, &b.id);

        let snapshot = read_snapshot(&remote, "ns", Some(&index.id)).await.unwrap();
        assert_eq!(snapshot.links, HashSet::from([a.id.clone()]));
        assert_eq!(snapshot.dead_links, HashSet::from([b.id.clone()]));
        assert!(snapshot.has_membership(&a.id));
        assert!(snapshot.has_membership(&b.id));
    }

    #[tokio::test]
    async fn page_failure_aborts() {
        let remote = MemoryRemote::new().with_page_size(1);
        for p in ["a.md", "b.md", "c.md"] {
            remote.seed_object(&Identity::new("ns", &fp('a'), p).key());
        }
        remote.fail_list_objects_at_page(2);

        assert!(read_snapshot(&remote, "ns", None).await.is_err());
    }

    #[tokio::test]
    async fn missing_index_means_no_links() {
        let remote = MemoryRemote::new();
        let snapshot = read_snapshot(&remote, "ns", None).await.unwrap();
        assert!(snapshot.objects.is_empty());
        assert!(snapshot.links.is_empty());
    }
}
