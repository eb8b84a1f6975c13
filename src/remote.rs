//! The remote object collection and index contract.
//!
//! [`RemoteApi`] is the only seam between the sync engine and the service
//! holding the uploaded objects and the searchable index. One handle is
//! created per run and passed explicitly to the index resolver, snapshot
//! reader and executor.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`list_objects`](RemoteApi::list_objects) | Page through objects, optionally narrowed by name prefix |
//! | [`create_object`](RemoteApi::create_object) | Upload bytes under a name |
//! | [`delete_object`](RemoteApi::delete_object) | Delete an object |
//! | [`list_indexes`](RemoteApi::list_indexes) | Page through indexes with their metadata |
//! | [`create_index`](RemoteApi::create_index) | Create an index with metadata tags |
//! | [`list_members`](RemoteApi::list_members) | Page through the membership records of an index |
//! | [`add_members_batch`](RemoteApi::add_members_batch) | Link many objects in one pollable batch |
//! | [`get_batch`](RemoteApi::get_batch) | Poll a batch |
//! | [`list_batch_failures`](RemoteApi::list_batch_failures) | Page through object ids a batch failed to link |
//! | [`remove_member`](RemoteApi::remove_member) | Unlink one object from an index |
//!
//! Every listing is cursor based. [`paginate`] turns such a method into a
//! lazy stream of items that keeps fetching until the remote stops handing
//! out a cursor.

use std::collections::BTreeMap;
use std::future::Future;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::models::{BatchStatus, IndexInfo, IndexMember, RemoteObject};

/// One page of a listing. `next_cursor` is `Some` while more pages exist.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Short backend label used in logs (e.g. `"openai"`).
    fn backend(&self) -> &str;

    /// Most object ids a single [`add_members_batch`](Self::add_members_batch)
    /// call accepts.
    fn max_batch_len(&self) -> usize {
        usize::MAX
    }

    /// List objects. Backends may narrow by `prefix` server-side; callers
    /// must still filter the results themselves.
    async fn list_objects(&self, prefix: &str, cursor: Option<String>)
        -> Result<Page<RemoteObject>>;

    async fn create_object(&self, name: &str, bytes: Vec<u8>) -> Result<RemoteObject>;

    /// Delete an object. Deleting an object that is already gone succeeds.
    async fn delete_object(&self, object_id: &str) -> Result<()>;

    async fn list_indexes(&self, cursor: Option<String>) -> Result<Page<IndexInfo>>;

    async fn create_index(
        &self,
        name: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<IndexInfo>;

    /// List every membership record of an index, including ones whose
    /// linking failed.
    async fn list_members(
        &self,
        index_id: &str,
        cursor: Option<String>,
    ) -> Result<Page<IndexMember>>;

    async fn add_members_batch(&self, index_id: &str, object_ids: &[String])
        -> Result<BatchStatus>;

    async fn get_batch(&self, index_id: &str, batch_id: &str) -> Result<BatchStatus>;

    async fn list_batch_failures(
        &self,
        index_id: &str,
        batch_id: &str,
        cursor: Option<String>,
    ) -> Result<Page<String>>;

    /// Unlink an object. Unlinking a record that is already gone succeeds.
    async fn remove_member(&self, index_id: &str, object_id: &str) -> Result<()>;
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Lazily walk a cursor-paginated listing, yielding items in page order.
///
/// Any page error ends the stream with that error. A remote that hands back
/// the cursor it was just given is reported as an error rather than looped
/// on forever.
pub fn paginate<'a, T, F, Fut>(fetch: F) -> BoxStream<'a, Result<T>>
where
    T: Send + 'a,
    F: FnMut(Option<String>) -> Fut + Send + 'a,
    Fut: Future<Output = Result<Page<T>>> + Send + 'a,
{
    stream::try_unfold((fetch, Cursor::Start), |(mut fetch, cursor)| async move {
        let token = match cursor {
            Cursor::Done => return Ok(None),
            Cursor::Start => None,
            Cursor::Next(token) => Some(token),
        };
        let page = fetch(token.clone()).await?;
        let next = match page.next_cursor {
            Some(next) if token.as_deref() == Some(next.as_str()) => {
                bail!("Remote returned the same page cursor twice: {}", next)
            }
            Some(next) => Cursor::Next(next),
            None => Cursor::Done,
        };
        Ok::<_, anyhow::Error>(Some((page.items, (fetch, next))))
    })
    .map_ok(|items| stream::iter(items.into_iter().map(Ok::<T, anyhow::Error>)))
    .try_flatten()
    .boxed()
}

/// Drain a paginated listing into memory.
pub async fn collect_all<T>(pages: BoxStream<'_, Result<T>>) -> Result<Vec<T>> {
    pages.try_collect().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn numbered_pages(
        pages: usize,
        per_page: usize,
        calls: Arc<AtomicUsize>,
    ) -> impl FnMut(Option<String>) -> futures::future::Ready<Result<Page<usize>>> {
        move |cursor| {
            calls.fetch_add(1, Ordering::SeqCst);
            let n: usize = cursor.map(|c| c.parse().unwrap()).unwrap_or(0);
            let items = (n * per_page..(n + 1) * per_page).collect();
            let next_cursor = (n + 1 < pages).then(|| (n + 1).to_string());
            futures::future::ready(Ok(Page { items, next_cursor }))
        }
    }

    #[tokio::test]
    async fn walks_every_page_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let all = collect_all(paginate(numbered_pages(4, 3, calls.clone())))
            .await
            .unwrap();
        assert_eq!(all, (0..12).collect::<Vec<_>>());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn is_lazy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut items = paginate(numbered_pages(10, 2, calls.clone()));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(items.next().await.unwrap().unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_pages_with_cursor_keep_going() {
        let mut served = 0;
        let fetch = move |_cursor: Option<String>| {
            served += 1;
            let page = match served {
                1 => Page {
                    items: vec![],
                    next_cursor: Some("a".to_string()),
                },
                _ => Page::last(vec![7]),
            };
            futures::future::ready(Ok(page))
        };
        assert_eq!(collect_all(paginate(fetch)).await.unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn page_error_is_fatal() {
        let mut served = 0;
        let fetch = move |_cursor: Option<String>| {
            served += 1;
            let result = if served == 1 {
                Ok(Page {
                    items: vec![1],
                    next_cursor: Some("x".to_string()),
                })
            } else {
                Err(anyhow::anyhow!("HTTP 500"))
            };
            futures::future::ready(result)
        };
        let err = collect_all(paginate(fetch)).await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn repeated_cursor_is_an_error() {
        let fetch = |_cursor: Option<String>| {
            futures::future::ready(Ok(Page {
                items: vec![1],
                next_cursor: Some("same".to_string()),
            }))
        };
        assert!(collect_all(paginate(fetch)).await.is_err());
    }
}
