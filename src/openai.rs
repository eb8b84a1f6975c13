//! OpenAI Files + Vector Stores backend.
//!
//! Maps the [`RemoteApi`] contract onto the OpenAI REST API:
//!
//! | Contract | Endpoint |
//! |----------|----------|
//! | objects | `/files` (`purpose=assistants`) |
//! | indexes | `/vector_stores` |
//! | members | `/vector_stores/{id}/files` |
//! | link batches | `/vector_stores/{id}/file_batches` |
//!
//! # Retry Strategy
//!
//! Every request uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - Network errors → retry
//! - Other HTTP errors → fail immediately
//!
//! Delays are 1s, 2s, 4s, … capped at 32s, up to `remote.max_retries`
//! retries.
//!
//! A retried request may already have taken effect on the server. For
//! deletes and unlinks a 404 on any attempt therefore counts as success. An
//! upload retried after its response was lost can store the file twice; the
//! next run sees two objects with one name and deletes the extra copy.
//!
//! Listings follow `has_more` and pass the last id of a page as the `after`
//! cursor of the next.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::RemoteConfig;
use crate::models::{
    BatchCounts, BatchState, BatchStatus, IndexInfo, IndexMember, RemoteObject,
};
use crate::remote::{Page, RemoteApi};

/// Most file ids one vector-store file batch accepts.
const MAX_BATCH_LEN: usize = 500;

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
    filename: String,
}

#[derive(Debug, Deserialize)]
struct VectorStore {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct VectorStoreFile {
    id: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileBatch {
    id: String,
    status: BatchState,
    #[serde(default)]
    file_counts: BatchCounts,
}

#[derive(Debug, Deserialize)]
struct Deleted {
    id: String,
    deleted: bool,
}

impl From<FileObject> for RemoteObject {
    fn from(file: FileObject) -> Self {
        RemoteObject {
            id: file.id,
            name: file.filename,
        }
    }
}

impl From<VectorStore> for IndexInfo {
    fn from(store: VectorStore) -> Self {
        IndexInfo {
            id: store.id,
            name: store.name.unwrap_or_default(),
            metadata: store.metadata.unwrap_or_default(),
        }
    }
}

impl From<VectorStoreFile> for IndexMember {
    fn from(file: VectorStoreFile) -> Self {
        IndexMember {
            live: is_live_member(&file),
            object_id: file.id,
        }
    }
}

impl From<FileBatch> for BatchStatus {
    fn from(batch: FileBatch) -> Self {
        BatchStatus {
            id: batch.id,
            state: batch.status,
            counts: batch.file_counts,
        }
    }
}

/// Convert a list response into a [`Page`], deriving the next cursor.
fn into_page<T, U>(
    list: ListResponse<T>,
    id_of: impl Fn(&T) -> &str,
    convert: impl FnMut(T) -> Option<U>,
) -> Result<Page<U>> {
    let next_cursor = if list.has_more {
        let last = list
            .last_id
            .clone()
            .or_else(|| list.data.last().map(|item| id_of(item).to_string()));
        match last {
            Some(last) => Some(last),
            None => bail!("Remote reported more results after an empty page"),
        }
    } else {
        None
    };
    Ok(Page {
        items: list.data.into_iter().filter_map(convert).collect(),
        next_cursor,
    })
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << (attempt.saturating_sub(1)).min(5))
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// A non-retryable HTTP error response.
#[derive(Debug)]
struct HttpError {
    what: String,
    status: StatusCode,
    body: String,
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} failed: HTTP {}: {}", self.what, self.status, self.body)
    }
}

impl std::error::Error for HttpError {}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<HttpError>()
        .map_or(false, |e| e.status == StatusCode::NOT_FOUND)
}

/// A vector-store membership is live unless it failed or was cancelled.
/// Dead ones are linked again on the next run, and still unlinked before
/// their file is deleted.
fn is_live_member(file: &VectorStoreFile) -> bool {
    !matches!(file.status.as_deref(), Some("failed") | Some("cancelled"))
}

/// [`RemoteApi`] over the OpenAI HTTP API.
pub struct OpenAiRemote {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
    page_size: usize,
}

impl OpenAiRemote {
    /// Build a client from configuration, reading the API key from the
    /// environment variable named by `remote.api_key_env`.
    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .map_err(|_| anyhow!("{} environment variable not set", config.api_key_env))?;
        if api_key.trim().is_empty() {
            bail!("{} environment variable is empty", config.api_key_env);
        }
        Self::new(config, api_key)
    }

    pub fn new(config: &RemoteConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
            page_size: config.page_size,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    fn list_query(&self, cursor: Option<String>) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("limit", self.page_size.to_string()),
            ("order", "asc".to_string()),
        ];
        if let Some(after) = cursor {
            query.push(("after", after));
        }
        query
    }

    /// Send a request with retry/backoff and decode the JSON body.
    ///
    /// `build` is called once per attempt so that bodies which cannot be
    /// cloned (multipart uploads) are rebuilt.
    async fn send<T: DeserializeOwned>(
        &self,
        what: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<T> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = backoff(attempt);
                tracing::debug!(what, attempt, delay_secs = delay.as_secs(), "retrying request");
                tokio::time::sleep(delay).await;
            }

            match build().send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response
                            .json::<T>()
                            .await
                            .with_context(|| format!("Invalid response to {}", what));
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if is_retryable(status) {
                        last_err = Some(anyhow!("{} failed: HTTP {}: {}", what, status, body_text));
                        continue;
                    }
                    return Err(HttpError {
                        what: what.to_string(),
                        status,
                        body: body_text,
                    }
                    .into());
                }
                Err(e) => {
                    last_err = Some(anyhow::Error::new(e).context(format!("{} failed", what)));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("{} failed after retries", what)))
    }

    /// DELETE `path`. A 404 means an earlier attempt or run already did it.
    async fn delete(&self, what: &str, path: &str) -> Result<()> {
        let sent: Result<Deleted> = self
            .send(what, || self.request(Method::DELETE, path))
            .await;
        let deleted = match sent {
            Ok(deleted) => deleted,
            Err(err) if is_not_found(&err) => {
                tracing::debug!(what, "already gone");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if !deleted.deleted {
            bail!("{} was not deleted: {}", what, deleted.id);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for OpenAiRemote {
    fn backend(&self) -> &str {
        "openai"
    }

    fn max_batch_len(&self) -> usize {
        MAX_BATCH_LEN
    }

    async fn list_objects(
        &self,
        prefix: &str,
        cursor: Option<String>,
    ) -> Result<Page<RemoteObject>> {
        let mut query = self.list_query(cursor);
        query.push(("purpose", "assistants".to_string()));
        let list: ListResponse<FileObject> = self
            .send("list files", || self.request(Method::GET, "files").query(&query))
            .await?;
        into_page(
            list,
            |file| file.id.as_str(),
            |file| file.filename.starts_with(prefix).then(|| file.into()),
        )
    }

    async fn create_object(&self, name: &str, bytes: Vec<u8>) -> Result<RemoteObject> {
        let what = format!("upload {}", name);
        let file: FileObject = self
            .send(&what, || {
                let part = reqwest::multipart::Part::bytes(bytes.clone()).file_name(name.to_string());
                let form = reqwest::multipart::Form::new()
                    .text("purpose", "assistants")
                    .part("file", part);
                self.request(Method::POST, "files").multipart(form)
            })
            .await?;
        Ok(file.into())
    }

    async fn delete_object(&self, object_id: &str) -> Result<()> {
        self.delete(&format!("delete file {}", object_id), &format!("files/{}", object_id))
            .await
    }

    async fn list_indexes(&self, cursor: Option<String>) -> Result<Page<IndexInfo>> {
        let query = self.list_query(cursor);
        let list: ListResponse<VectorStore> = self
            .send("list vector stores", || {
                self.request(Method::GET, "vector_stores").query(&query)
            })
            .await?;
        into_page(list, |store| store.id.as_str(), |store| Some(store.into()))
    }

    async fn create_index(
        &self,
        name: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<IndexInfo> {
        let body = serde_json::json!({
            "name": name,
            "metadata": metadata,
        });
        let store: VectorStore = self
            .send("create vector store", || {
                self.request(Method::POST, "vector_stores").json(&body)
            })
            .await?;
        Ok(store.into())
    }

    async fn list_members(
        &self,
        index_id: &str,
        cursor: Option<String>,
    ) -> Result<Page<IndexMember>> {
        let path = format!("vector_stores/{}/files", index_id);
        let query = self.list_query(cursor);
        let list: ListResponse<VectorStoreFile> = self
            .send("list vector store files", || {
                self.request(Method::GET, &path).query(&query)
            })
            .await?;
        into_page(
            list,
            |file| file.id.as_str(),
            |file| Some(file.into()),
        )
    }

    async fn add_members_batch(
        &self,
        index_id: &str,
        object_ids: &[String],
    ) -> Result<BatchStatus> {
        if object_ids.len() > MAX_BATCH_LEN {
            bail!(
                "File batch of {} exceeds the limit of {}",
                object_ids.len(),
                MAX_BATCH_LEN
            );
        }
        let path = format!("vector_stores/{}/file_batches", index_id);
        let body = serde_json::json!({ "file_ids": object_ids });
        let batch: FileBatch = self
            .send("create file batch", || {
                self.request(Method::POST, &path).json(&body)
            })
            .await?;
        Ok(batch.into())
    }

    async fn get_batch(&self, index_id: &str, batch_id: &str) -> Result<BatchStatus> {
        let path = format!("vector_stores/{}/file_batches/{}", index_id, batch_id);
        let batch: FileBatch = self
            .send("get file batch", || self.request(Method::GET, &path))
            .await?;
        Ok(batch.into())
    }

    async fn list_batch_failures(
        &self,
        index_id: &str,
        batch_id: &str,
        cursor: Option<String>,
    ) -> Result<Page<String>> {
        let path = format!("vector_stores/{}/file_batches/{}/files", index_id, batch_id);
        let mut query = self.list_query(cursor);
        query.push(("filter", "failed".to_string()));
        let list: ListResponse<VectorStoreFile> = self
            .send("list failed batch files", || {
                self.request(Method::GET, &path).query(&query)
            })
            .await?;
        into_page(list, |file| file.id.as_str(), |file| Some(file.id))
    }

    async fn remove_member(&self, index_id: &str, object_id: &str) -> Result<()> {
        self.delete(
            &format!("unlink file {}", object_id),
            &format!("vector_stores/{}/files/{}", index_id, object_id),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn remote(base_url: &str) -> OpenAiRemote {
        let config = RemoteConfig {
            base_url: base_url.to_string(),
            ..Default::default()
        };
        OpenAiRemote::new(&config, "sk-test".to_string()).unwrap()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let secs: Vec<u64> = (1..=8).map(|a| backoff(a).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 32, 32]);
    }

    #[test]
    fn retry_classification() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
        assert!(!is_retryable(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn urls_join_cleanly() {
        let api = remote("https://api.example.com/v1/");
        assert_eq!(api.url("/files"), "https://api.example.com/v1/files");
        assert_eq!(
            api.url("vector_stores/vs_1/files"),
            "https://api.example.com/v1/vector_stores/vs_1/files"
        );
    }

    #[test]
    fn file_page_uses_last_id_and_prefix() {
        let json = r#"{
            "object": "list",
            "data": [
                {"id": "file-1", "filename": "ns-aa/a.md", "bytes": 3},
                {"id": "file-2", "filename": "other.md", "bytes": 4}
            ],
            "has_more": true
        }"#;
        let list: ListResponse<FileObject> = serde_json::from_str(json).unwrap();
        let page = into_page(
            list,
            |f| f.id.as_str(),
            |f| f.filename.starts_with("ns-").then(|| RemoteObject::from(f)),
        )
        .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].id, "file-1");
        assert_eq!(page.next_cursor.as_deref(), Some("file-2"));
    }

    #[test]
    fn explicit_last_id_wins() {
        let json = r#"{"data": [{"id": "vs_1", "name": null}], "has_more": true, "last_id": "vs_9"}"#;
        let list: ListResponse<VectorStore> = serde_json::from_str(json).unwrap();
        let page = into_page(list, |s| s.id.as_str(), |s| Some(IndexInfo::from(s))).unwrap();
        assert_eq!(page.next_cursor.as_deref(), Some("vs_9"));
        assert_eq!(page.items[0].name, "");
        assert!(page.items[0].metadata.is_empty());
    }

    #[test]
    fn empty_page_claiming_more_is_an_error() {
        let json = r#"{"data": [], "has_more": true}"#;
        let list: ListResponse<VectorStore> = serde_json::from_str(json).unwrap();
        assert!(into_page(list, |s| s.id.as_str(), |s| Some(IndexInfo::from(s))).is_err());
    }

    #[test]
    fn failed_memberships_are_not_live() {
        let json = r#"{"data": [
            {"id": "file-1", "status": "completed"},
            {"id": "file-2", "status": "failed"},
            {"id": "file-3", "status": "in_progress"},
            {"id": "file-4"}
        ], "has_more": false}"#;
        let list: ListResponse<VectorStoreFile> = serde_json::from_str(json).unwrap();
        let page = into_page(list, |f| f.id.as_str(), |f| Some(IndexMember::from(f))).unwrap();
        let live: Vec<_> = page
            .items
            .iter()
            .map(|m| (m.object_id.as_str(), m.live))
            .collect();
        assert_eq!(
            live,
            vec![
                ("file-1", true),
                ("file-2", false),
                ("file-3", true),
                ("file-4", true)
            ]
        );
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn batch_status_parsing() {
        let json = r#"{
            "id": "vsfb_1",
            "object": "vector_store.file_batch",
            "status": "completed",
            "file_counts": {"in_progress": 0, "completed": 2, "failed": 1, "cancelled": 0, "total": 3}
        }"#;
        let status: BatchStatus = serde_json::from_str::<FileBatch>(json).unwrap().into();
        assert_eq!(status.state, BatchState::Completed);
        assert_eq!(status.counts.failed, 1);
        assert_eq!(status.counts.total, 3);

        let cancelling: FileBatch =
            serde_json::from_str(r#"{"id": "b", "status": "cancelling"}"#).unwrap();
        assert_eq!(cancelling.status, BatchState::InProgress);
    }

    // ── HTTP round trips against a local responder ────────────────────

    /// Serve one canned response per connection, in order, and return the
    /// request lines that were received.
    async fn serve(
        responses: Vec<(u16, &'static str)>,
    ) -> (OpenAiRemote, tokio::task::JoinHandle<Vec<String>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                }
                let head = String::from_utf8_lossy(&head).to_string();
                requests.push(head.lines().next().unwrap_or_default().to_string());

                let reason = StatusCode::from_u16(status)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or("Unknown");
                let response = format!(
                    "HTTP/1.1 {} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    reason,
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
            requests
        });

        let config = RemoteConfig {
            base_url: format!("http://{}", addr),
            max_retries: 1,
            timeout_secs: 5,
            ..Default::default()
        };
        (OpenAiRemote::new(&config, "sk-test".to_string()).unwrap(), handle)
    }

    const NOT_FOUND: &str = r#"{"error": {"message": "No such File object", "type": "invalid_request_error"}}"#;

    #[tokio::test]
    async fn deleting_a_missing_file_succeeds() {
        let (api, server) = serve(vec![(404, NOT_FOUND)]).await;

        api.delete_object("file-1").await.unwrap();

        let requests = server.await.unwrap();
        assert_eq!(requests, vec!["DELETE /files/file-1 HTTP/1.1"]);
    }

    #[tokio::test]
    async fn unlink_whose_first_response_was_lost_succeeds() {
        let (api, server) = serve(vec![
            (503, r#"{"error": {"message": "upstream timeout"}}"#),
            (404, NOT_FOUND),
        ])
        .await;

        api.remove_member("vs_1", "file-1").await.unwrap();

        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests
            .iter()
            .all(|r| r == "DELETE /vector_stores/vs_1/files/file-1 HTTP/1.1"));
    }

    #[tokio::test]
    async fn confirmed_delete_succeeds() {
        let (api, server) = serve(vec![(
            200,
            r#"{"id": "file-1", "object": "file", "deleted": true}"#,
        )])
        .await;

        api.delete_object("file-1").await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn other_client_errors_still_fail_deletes() {
        let (api, server) = serve(vec![(401, r#"{"error": {"message": "bad key"}}"#)]).await;

        let err = api.delete_object("file-1").await.unwrap_err();
        assert!(!is_not_found(&err));
        assert!(format!("{:#}", err).contains("401"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn member_listing_keeps_failed_records() {
        let (api, server) = serve(vec![(
            200,
            r#"{"object": "list", "data": [
                {"id": "file-1", "status": "completed"},
                {"id": "file-2", "status": "failed"}
            ], "has_more": false}"#,
        )])
        .await;

        let page = api.list_members("vs_1", None).await.unwrap();
        assert_eq!(
            page.items,
            vec![
                IndexMember::live("file-1"),
                IndexMember {
                    object_id: "file-2".to_string(),
                    live: false,
                },
            ]
        );
        let requests = server.await.unwrap();
        assert!(requests[0].starts_with("GET /vector_stores/vs_1/files?"));
    }
}
