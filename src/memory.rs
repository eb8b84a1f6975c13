//! In-memory [`RemoteApi`] implementation for tests and local experiments.
//!
//! Keeps objects, indexes, memberships and link batches in insertion order
//! behind a `Mutex`. Listings are paginated with a configurable page size.
//! Within this crate's own tests, individual operations can also be made to
//! fail so that partial-failure behavior can be exercised without a
//! network.
//!
//! Deleting an object leaves its membership records in place, so a caller
//! that skips the unlink step leaves a dangling record behind. Deleting or
//! unlinking something that is already gone succeeds.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::models::{
    BatchCounts, BatchState, BatchStatus, IndexInfo, IndexMember, RemoteObject,
};
use crate::remote::{Page, RemoteApi};

struct StoredObject {
    object: RemoteObject,
    size: usize,
}

struct StoredBatch {
    index_id: String,
    object_ids: Vec<String>,
    failed: Vec<String>,
    polls_left: u32,
    state: BatchState,
}

#[derive(Default)]
struct Faults {
    list_objects_fail_at_page: Option<usize>,
    delete: HashSet<String>,
    upload: HashSet<String>,
    link: HashSet<String>,
    unlink: HashSet<String>,
    create_index: bool,
    batch_polls: u32,
    stall_batches: bool,
}

#[derive(Default)]
struct State {
    objects: Vec<StoredObject>,
    indexes: Vec<IndexInfo>,
    members: HashMap<String, Vec<IndexMember>>,
    batches: HashMap<String, StoredBatch>,
    faults: Faults,
    in_flight: usize,
    max_in_flight: usize,
    uploads: usize,
}

/// In-memory remote for tests.
pub struct MemoryRemote {
    page_size: usize,
    max_batch_len: usize,
    latency: Duration,
    state: Mutex<State>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            page_size: 100,
            max_batch_len: usize::MAX,
            latency: Duration::ZERO,
            state: Mutex::new(State::default()),
        }
    }

    /// Serve listings `page_size` items at a time.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Reject link batches longer than `len`.
    pub fn with_max_batch_len(mut self, len: usize) -> Self {
        self.max_batch_len = len.max(1);
        self
    }

    /// Number of link batches submitted so far.
    pub fn batch_count(&self) -> usize {
        self.state().batches.len()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── seeding and inspection ────────────────────────────────────────

    /// Store an object without linking it anywhere.
    pub fn seed_object(&self, name: &str) -> RemoteObject {
        let object = RemoteObject {
            id: new_id("file"),
            name: name.to_string(),
        };
        self.state().objects.push(StoredObject {
            object: object.clone(),
            size: 0,
        });
        object
    }

    pub fn seed_index(&self, name: &str, metadata: BTreeMap<String, String>) -> IndexInfo {
        let index = IndexInfo {
            id: new_id("vs"),
            name: name.to_string(),
            metadata,
        };
        self.state().indexes.push(index.clone());
        index
    }

    /// Link an existing object into an index.
    pub fn link(&self, index_id: &str, object_id: &str) {
        add_member(&mut self.state(), index_id, IndexMember::live(object_id));
    }

    /// Record a membership whose linking failed: listed, but not live.
    pub fn link_failed(&self, index_id: &str, object_id: &str) {
        add_member(
            &mut self.state(),
            index_id,
            IndexMember {
                object_id: object_id.to_string(),
                live: false,
            },
        );
    }

    pub fn objects(&self) -> Vec<RemoteObject> {
        self.state()
            .objects
            .iter()
            .map(|s| s.object.clone())
            .collect()
    }

    pub fn indexes(&self) -> Vec<IndexInfo> {
        self.state().indexes.clone()
    }

    /// Ids of the objects live in an index.
    pub fn members(&self, index_id: &str) -> Vec<String> {
        self.memberships(index_id)
            .into_iter()
            .filter(|m| m.live)
            .map(|m| m.object_id)
            .collect()
    }

    /// Every membership record of an index, live or not.
    pub fn memberships(&self, index_id: &str) -> Vec<IndexMember> {
        self.state()
            .members
            .get(index_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Size in bytes of the upload stored under `object_id`.
    pub fn object_size(&self, object_id: &str) -> Option<usize> {
        self.state()
            .objects
            .iter()
            .find(|s| s.object.id == object_id)
            .map(|s| s.size)
    }

    /// Number of successful uploads so far.
    pub fn upload_count(&self) -> usize {
        self.state().uploads
    }

    // ── internals ─────────────────────────────────────────────────────

    async fn enter(&self) {
        {
            let mut state = self.state();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn leave(&self) {
        self.state().in_flight -= 1;
    }

    fn page_of<T: Clone>(&self, items: &[T], cursor: Option<String>) -> Result<Page<T>> {
        let offset = parse_cursor(cursor)?;
        let end = (offset + self.page_size).min(items.len());
        let page = items.get(offset..end).map(<[T]>::to_vec).unwrap_or_default();
        let next_cursor = (end < items.len()).then(|| end.to_string());
        Ok(Page {
            items: page,
            next_cursor,
        })
    }
}

/// Fault injection and concurrency tracking for this crate's own tests.
#[cfg(test)]
impl MemoryRemote {
    /// Delay every upload and delete, to make concurrency observable.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Highest number of uploads/deletes observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    /// Make the object listing fail when page `page` (0-based) is requested.
    pub fn fail_list_objects_at_page(&self, page: usize) {
        self.state().faults.list_objects_fail_at_page = Some(page);
    }

    pub fn fail_delete(&self, object_id: &str) {
        self.state().faults.delete.insert(object_id.to_string());
    }

    pub fn fail_upload(&self, name: &str) {
        self.state().faults.upload.insert(name.to_string());
    }

    /// Report `object_id` as failed in any batch it is submitted in.
    pub fn fail_link(&self, object_id: &str) {
        self.state().faults.link.insert(object_id.to_string());
    }

    /// Make every upload whose name contains `fragment` fail to link.
    pub fn fail_link_by_name(&self, fragment: &str) {
        self.state()
            .faults
            .link
            .insert(format!("name:{}", fragment));
    }

    pub fn fail_unlink(&self, object_id: &str) {
        self.state().faults.unlink.insert(object_id.to_string());
    }

    pub fn fail_create_index(&self) {
        self.state().faults.create_index = true;
    }

    /// Keep batches in progress for `polls` status checks before completing.
    pub fn set_batch_polls(&self, polls: u32) {
        self.state().faults.batch_polls = polls;
    }

    /// Never complete any batch.
    pub fn stall_batches(&self) {
        self.state().faults.stall_batches = true;
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

fn parse_cursor(cursor: Option<String>) -> Result<usize> {
    match cursor {
        None => Ok(0),
        Some(c) => c
            .parse()
            .map_err(|_| anyhow!("invalid page cursor '{}'", c)),
    }
}

fn add_member(state: &mut State, index_id: &str, member: IndexMember) {
    let members = state.members.entry(index_id.to_string()).or_default();
    match members.iter_mut().find(|m| m.object_id == member.object_id) {
        Some(existing) => existing.live = member.live,
        None => members.push(member),
    }
}

/// Apply a finished batch's memberships and record its failures.
fn complete_batch(state: &mut State, batch_id: &str) {
    let Some(batch) = state.batches.get(batch_id) else {
        return;
    };
    let index_id = batch.index_id.clone();
    let object_ids = batch.object_ids.clone();

    let mut failed = Vec::new();
    for id in &object_ids {
        let name = state
            .objects
            .iter()
            .find(|s| &s.object.id == id)
            .map(|s| s.object.name.clone());
        let faulted = state.faults.link.contains(id)
            || name.as_ref().map_or(true, |n| {
                state
                    .faults
                    .link
                    .iter()
                    .filter_map(|f| f.strip_prefix("name:"))
                    .any(|fragment| n.contains(fragment))
            });
        if faulted {
            failed.push(id.clone());
            continue;
        }
        add_member(state, &index_id, IndexMember::live(id.as_str()));
    }

    if let Some(batch) = state.batches.get_mut(batch_id) {
        batch.failed = failed;
        batch.state = BatchState::Completed;
    }
}

fn batch_status(batch_id: &str, batch: &StoredBatch) -> BatchStatus {
    let total = batch.object_ids.len() as u64;
    let failed = batch.failed.len() as u64;
    let counts = match batch.state {
        BatchState::InProgress => BatchCounts {
            in_progress: total,
            total,
            ..Default::default()
        },
        _ => BatchCounts {
            completed: total - failed,
            failed,
            total,
            ..Default::default()
        },
    };
    BatchStatus {
        id: batch_id.to_string(),
        state: batch.state,
        counts,
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    fn backend(&self) -> &str {
        "memory"
    }

    fn max_batch_len(&self) -> usize {
        self.max_batch_len
    }

    async fn list_objects(
        &self,
        prefix: &str,
        cursor: Option<String>,
    ) -> Result<Page<RemoteObject>> {
        let state = self.state();
        let offset = parse_cursor(cursor.clone())?;
        if let Some(fail_page) = state.faults.list_objects_fail_at_page {
            if offset / self.page_size >= fail_page {
                bail!("object listing failed (injected)");
            }
        }
        let matching: Vec<RemoteObject> = state
            .objects
            .iter()
            .filter(|s| s.object.name.starts_with(prefix))
            .map(|s| s.object.clone())
            .collect();
        self.page_of(&matching, cursor)
    }

    async fn create_object(&self, name: &str, bytes: Vec<u8>) -> Result<RemoteObject> {
        self.enter().await;
        let result = {
            let mut state = self.state();
            if state.faults.upload.contains(name) {
                Err(anyhow!("upload of '{}' failed (injected)", name))
            } else {
                let object = RemoteObject {
                    id: new_id("file"),
                    name: name.to_string(),
                };
                state.objects.push(StoredObject {
                    object: object.clone(),
                    size: bytes.len(),
                });
                state.uploads += 1;
                Ok(object)
            }
        };
        self.leave();
        result
    }

    async fn delete_object(&self, object_id: &str) -> Result<()> {
        self.enter().await;
        let result = {
            let mut state = self.state();
            if state.faults.delete.contains(object_id) {
                Err(anyhow!("delete of '{}' failed (injected)", object_id))
            } else {
                state.objects.retain(|s| s.object.id != object_id);
                Ok(())
            }
        };
        self.leave();
        result
    }

    async fn list_indexes(&self, cursor: Option<String>) -> Result<Page<IndexInfo>> {
        let indexes = self.state().indexes.clone();
        self.page_of(&indexes, cursor)
    }

    async fn create_index(
        &self,
        name: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<IndexInfo> {
        if self.state().faults.create_index {
            bail!("index creation failed (injected)");
        }
        Ok(self.seed_index(name, metadata.clone()))
    }

    async fn list_members(
        &self,
        index_id: &str,
        cursor: Option<String>,
    ) -> Result<Page<IndexMember>> {
        let members = self.memberships(index_id);
        self.page_of(&members, cursor)
    }

    async fn add_members_batch(
        &self,
        index_id: &str,
        object_ids: &[String],
    ) -> Result<BatchStatus> {
        if object_ids.len() > self.max_batch_len {
            bail!("batch of {} exceeds {}", object_ids.len(), self.max_batch_len);
        }
        let mut state = self.state();
        if !state.indexes.iter().any(|i| i.id == index_id) {
            bail!("no such index: {}", index_id);
        }
        let batch_id = new_id("batch");
        let polls_left = state.faults.batch_polls;
        state.batches.insert(
            batch_id.clone(),
            StoredBatch {
                index_id: index_id.to_string(),
                object_ids: object_ids.to_vec(),
                failed: Vec::new(),
                polls_left,
                state: BatchState::InProgress,
            },
        );
        if polls_left == 0 && !state.faults.stall_batches {
            complete_batch(&mut state, &batch_id);
        }
        let batch = state
            .batches
            .get(&batch_id)
            .ok_or_else(|| anyhow!("batch vanished: {}", batch_id))?;
        Ok(batch_status(&batch_id, batch))
    }

    async fn get_batch(&self, index_id: &str, batch_id: &str) -> Result<BatchStatus> {
        let mut state = self.state();
        let stalled = state.faults.stall_batches;
        let due = match state.batches.get_mut(batch_id) {
            Some(batch) if batch.index_id == index_id => {
                if batch.state == BatchState::InProgress && !stalled {
                    batch.polls_left = batch.polls_left.saturating_sub(1);
                    batch.polls_left == 0
                } else {
                    false
                }
            }
            _ => bail!("no such batch: {}", batch_id),
        };
        if due {
            complete_batch(&mut state, batch_id);
        }
        let batch = state
            .batches
            .get(batch_id)
            .ok_or_else(|| anyhow!("batch vanished: {}", batch_id))?;
        Ok(batch_status(batch_id, batch))
    }

    async fn list_batch_failures(
        &self,
        index_id: &str,
        batch_id: &str,
        cursor: Option<String>,
    ) -> Result<Page<String>> {
        let failed = {
            let state = self.state();
            match state.batches.get(batch_id) {
                Some(batch) if batch.index_id == index_id => batch.failed.clone(),
                _ => bail!("no such batch: {}", batch_id),
            }
        };
        self.page_of(&failed, cursor)
    }

    async fn remove_member(&self, index_id: &str, object_id: &str) -> Result<()> {
        let mut state = self.state();
        if state.faults.unlink.contains(object_id) {
            bail!("unlink of '{}' failed (injected)", object_id);
        }
        if let Some(members) = state.members.get_mut(index_id) {
            members.retain(|m| m.object_id != object_id);
        }
        Ok(())
    }
}
