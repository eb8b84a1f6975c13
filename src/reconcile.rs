//! Reconciliation of the local set against a remote snapshot.
//!
//! [`reconcile`] is a pure function. It never performs I/O and builds each
//! of the three plan lists independently from the inputs:
//!
//! - **create and link**: local identities with no remote object of that name.
//! - **link only**: local identities whose kept remote object is not linked
//!   into the index (an earlier run uploaded but never attached it).
//! - **delete**: every remote object that is not the kept object of a live
//!   local identity. This covers removed files, files whose content changed
//!   (the old name no longer matches), and duplicate uploads of one identity.
//!
//! When several remote objects share a live name, the first linked one in
//! scan order is kept; failing that, the first one in scan order.
//!
//! Lists are sorted (creates by identity key, link-only and deletes by
//! object id) so equal inputs always give equal plans.
//!
//! [`reconcile_scan`] works from a full [`RemoteSnapshot`]: a delete is
//! marked linked when the index holds any membership record for the object,
//! live or not, so the executor removes the record first.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::local_fs::LocalScan;
use crate::models::{Identity, LocalSet, Plan, PlannedDelete, RemoteObject};
use crate::snapshot::RemoteSnapshot;

/// Compute the plan that makes the remote match `local`.
pub fn reconcile(
    local: &LocalSet,
    remote_objects: &[RemoteObject],
    remote_links: &HashSet<String>,
) -> Plan {
    let kept = kept_objects(local, remote_objects, remote_links);

    let mut to_create_and_link: Vec<_> = local
        .iter()
        .filter(|(key, _)| !kept.contains_key(key.as_str()))
        .map(|(_, file)| file.clone())
        .collect();
    to_create_and_link.sort_by(|a, b| a.identity.key().cmp(&b.identity.key()));

    let mut to_link_only: Vec<_> = kept
        .values()
        .filter(|object| !remote_links.contains(&object.id))
        .map(|object| (*object).clone())
        .collect();
    to_link_only.sort_by(|a, b| a.id.cmp(&b.id));

    let kept_ids: HashSet<&str> = kept.values().map(|o| o.id.as_str()).collect();
    let mut seen = HashSet::new();
    let mut to_delete: Vec<_> = remote_objects
        .iter()
        .filter(|object| !kept_ids.contains(object.id.as_str()))
        .filter(|object| seen.insert(object.id.as_str()))
        .map(|object| PlannedDelete {
            object: object.clone(),
            linked: remote_links.contains(&object.id),
        })
        .collect();
    to_delete.sort_by(|a, b| a.object.id.cmp(&b.object.id));

    Plan {
        to_create_and_link,
        to_link_only,
        to_delete,
    }
}

/// Reconcile a full local scan against a remote snapshot.
///
/// Identical to [`reconcile`] on `scan.files` and the live links, except
/// that remote objects for paths that exist locally but could not be read
/// are left alone (an unreadable file is not evidence that its remote copy
/// is stale), and dead membership records count as links to remove.
pub fn reconcile_scan(scan: &LocalScan, namespace: &str, snapshot: &RemoteSnapshot) -> Plan {
    let mut plan = reconcile(&scan.files, &snapshot.objects, &snapshot.links);
    for planned in &mut plan.to_delete {
        planned.linked = snapshot.has_membership(&planned.object.id);
    }
    if !scan.unreadable.is_empty() {
        plan.to_delete.retain(|d| !is_protected(&scan.unreadable, namespace, &d.object.name));
    }
    plan
}

fn is_protected(unreadable: &BTreeSet<String>, namespace: &str, name: &str) -> bool {
    Identity::parse(namespace, name)
        .map(|identity| unreadable.contains(&identity.relative_path))
        .unwrap_or(false)
}

/// For each live local key, the remote object that represents it.
fn kept_objects<'a>(
    local: &LocalSet,
    remote_objects: &'a [RemoteObject],
    remote_links: &HashSet<String>,
) -> HashMap<&'a str, &'a RemoteObject> {
    let mut kept: HashMap<&'a str, &'a RemoteObject> = HashMap::new();
    for object in remote_objects {
        if !local.contains_key(&object.name) {
            continue;
        }
        let linked = remote_links.contains(&object.id);
        kept.entry(object.name.as_str())
            .and_modify(|current| {
                if linked && !remote_links.contains(&current.id) {
                    *current = object;
                }
            })
            .or_insert(object);
    }
    kept
}
