//! Plan execution.
//!
//! Applies a [`Plan`] against the remote in three sequential phases:
//!
//! 1. **delete**: unlink (when linked) then delete every stale object.
//! 2. **create + link**: upload every new identity, then link all successful
//!    uploads into the index with one batch. A file whose content no longer
//!    matches its scanned fingerprint is not uploaded; the next run picks up
//!    the new content under its new name.
//! 3. **link only**: link already uploaded objects with one batch.
//!
//! Items within a phase run concurrently, limited to `concurrency` requests
//! in flight. A failed item is recorded in the [`ExecutionReport`] and left
//! out of later steps that depend on it; it never stops the other items or
//! the following phases.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use futures::stream::{self, StreamExt};

use crate::config::ExecutorConfig;
use crate::identity::fingerprint_bytes;
use crate::models::{
    BatchState, ExecutionReport, LocalFile, PhaseReport, Plan, PlannedDelete, RemoteObject,
};
use crate::progress::{SyncPhase, SyncProgressEvent, SyncProgressReporter};
use crate::remote::{collect_all, paginate, RemoteApi};

/// Applies plans against one resolved index.
pub struct PlanExecutor<'a> {
    api: &'a dyn RemoteApi,
    index_id: String,
    concurrency: usize,
    poll_interval: Duration,
    poll_timeout: Duration,
}

/// An object waiting to be linked, with the label failures are reported under.
struct LinkItem {
    subject: String,
    object_id: String,
}

impl<'a> PlanExecutor<'a> {
    pub fn new(api: &'a dyn RemoteApi, index_id: &str, config: &ExecutorConfig) -> Self {
        Self {
            api,
            index_id: index_id.to_string(),
            concurrency: config.concurrency.max(1),
            poll_interval: config.poll_interval(),
            poll_timeout: config.poll_timeout(),
        }
    }

    /// Override how often and how long link batches are polled.
    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.poll_timeout = timeout;
        self
    }

    /// Run all phases in order and report per-item outcomes.
    pub async fn execute(
        &self,
        plan: &Plan,
        progress: &dyn SyncProgressReporter,
    ) -> ExecutionReport {
        let mut report = ExecutionReport::default();

        report.delete = self.delete_phase(&plan.to_delete, progress).await;

        let (upload, uploaded) = self.upload_phase(&plan.to_create_and_link, progress).await;
        report.upload = upload;
        report.create_link = self.link_phase(SyncPhase::Link, uploaded, progress).await;

        let existing = plan
            .to_link_only
            .iter()
            .map(|object| LinkItem {
                subject: object.name.clone(),
                object_id: object.id.clone(),
            })
            .collect();
        report.link_only = self.link_phase(SyncPhase::LinkOnly, existing, progress).await;

        tracing::info!(
            deleted = report.delete.succeeded,
            uploaded = report.upload.succeeded,
            linked = report.create_link.succeeded + report.link_only.succeeded,
            failures = report.failure_count(),
            "plan executed"
        );
        report
    }

    async fn delete_phase(
        &self,
        deletes: &[PlannedDelete],
        progress: &dyn SyncProgressReporter,
    ) -> PhaseReport {
        let mut report = PhaseReport {
            attempted: deletes.len(),
            ..Default::default()
        };
        if deletes.is_empty() {
            return report;
        }

        let total = deletes.len() as u64;
        let mut done = 0u64;
        let mut results = stream::iter(deletes)
            .map(|planned| async move { (planned, self.delete_one(planned).await) })
            .buffer_unordered(self.concurrency);
        while let Some((planned, result)) = results.next().await {
            match result {
                Ok(()) => report.succeeded += 1,
                Err(err) => {
                    let error = format!("{:#}", err);
                    tracing::warn!(object = %planned.object.id, %error, "delete failed");
                    report.fail(&planned.object.id, &err);
                }
            }
            done += 1;
            progress.report(SyncProgressEvent::Phase {
                phase: SyncPhase::Delete,
                n: done,
                total,
            });
        }
        report
    }

    async fn delete_one(&self, planned: &PlannedDelete) -> Result<()> {
        let object = &planned.object;
        if planned.linked {
            self.api
                .remove_member(&self.index_id, &object.id)
                .await
                .with_context(|| format!("Failed to unlink {} ({})", object.id, object.name))?;
        }
        self.api
            .delete_object(&object.id)
            .await
            .with_context(|| format!("Failed to delete {} ({})", object.id, object.name))
    }

    /// Upload every file; returns the report and the objects to link.
    async fn upload_phase(
        &self,
        files: &[LocalFile],
        progress: &dyn SyncProgressReporter,
    ) -> (PhaseReport, Vec<LinkItem>) {
        let mut report = PhaseReport {
            attempted: files.len(),
            ..Default::default()
        };
        let mut uploaded = Vec::with_capacity(files.len());
        if files.is_empty() {
            return (report, uploaded);
        }

        let total = files.len() as u64;
        let mut done = 0u64;
        let mut results = stream::iter(files)
            .map(|file| async move { (file, self.upload_one(file).await) })
            .buffer_unordered(self.concurrency);
        while let Some((file, result)) = results.next().await {
            let key = file.identity.key();
            match result {
                Ok(object) => {
                    tracing::debug!(name = %key, object = %object.id, "uploaded");
                    report.succeeded += 1;
                    uploaded.push(LinkItem {
                        subject: key,
                        object_id: object.id,
                    });
                }
                Err(err) => {
                    let error = format!("{:#}", err);
                    tracing::warn!(name = %key, %error, "upload failed");
                    report.fail(key, &err);
                }
            }
            done += 1;
            progress.report(SyncProgressEvent::Phase {
                phase: SyncPhase::Upload,
                n: done,
                total,
            });
        }
        // Completion order is arbitrary; submit the batch in key order.
        uploaded.sort_by(|a, b| a.subject.cmp(&b.subject));
        (report, uploaded)
    }

    async fn upload_one(&self, file: &LocalFile) -> Result<RemoteObject> {
        let bytes = tokio::fs::read(&file.absolute_path)
            .await
            .with_context(|| format!("Failed to read {}", file.absolute_path.display()))?;
        if fingerprint_bytes(&bytes) != file.identity.fingerprint {
            bail!(
                "{} changed since it was scanned",
                file.absolute_path.display()
            );
        }
        let name = file.identity.key();
        self.api
            .create_object(&name, bytes)
            .await
            .with_context(|| format!("Failed to upload {}", name))
    }

    /// Link `items` in as few batches as the remote allows and report
    /// per-item outcomes.
    async fn link_phase(
        &self,
        phase: SyncPhase,
        items: Vec<LinkItem>,
        progress: &dyn SyncProgressReporter,
    ) -> PhaseReport {
        let mut report = PhaseReport {
            attempted: items.len(),
            ..Default::default()
        };
        if items.is_empty() {
            return report;
        }

        let total = items.len() as u64;
        let mut done = 0u64;
        for chunk in items.chunks(self.api.max_batch_len().max(1)) {
            self.link_chunk(phase, chunk, &mut report).await;
            done += chunk.len() as u64;
            progress.report(SyncProgressEvent::Phase {
                phase,
                n: done,
                total,
            });
        }
        report
    }

    async fn link_chunk(&self, phase: SyncPhase, items: &[LinkItem], report: &mut PhaseReport) {
        let ids: Vec<String> = items.iter().map(|item| item.object_id.clone()).collect();
        match self.link_batch(&ids).await {
            Ok(failed) => {
                for item in items {
                    if failed.contains(&item.object_id) {
                        let err = anyhow!("Remote failed to link {}", item.object_id);
                        tracing::warn!(name = %item.subject, object = %item.object_id, "link failed");
                        report.fail(&item.subject, &err);
                    } else {
                        report.succeeded += 1;
                    }
                }
            }
            Err(err) => {
                let error = format!("{:#}", err);
                tracing::warn!(
                    phase = phase.as_str(),
                    items = items.len(),
                    %error,
                    "link batch failed"
                );
                for item in items {
                    report.fail(&item.subject, &err);
                }
            }
        }
    }

    /// Submit one batch, wait for it to finish and return the ids it failed.
    async fn link_batch(&self, ids: &[String]) -> Result<HashSet<String>> {
        let mut status = self
            .api
            .add_members_batch(&self.index_id, ids)
            .await
            .with_context(|| format!("Failed to submit link batch of {} objects", ids.len()))?;

        let deadline = Instant::now() + self.poll_timeout;
        while !status.state.is_terminal() {
            if Instant::now() >= deadline {
                bail!(
                    "Gave up waiting for link batch {} after {}s ({} of {} still in progress)",
                    status.id,
                    self.poll_timeout.as_secs_f64(),
                    status.counts.in_progress,
                    status.counts.total
                );
            }
            tokio::time::sleep(self.poll_interval).await;
            status = self
                .api
                .get_batch(&self.index_id, &status.id)
                .await
                .with_context(|| format!("Failed to poll link batch {}", status.id))?;
            tracing::debug!(batch = %status.id, state = ?status.state, "polled link batch");
        }

        match status.state {
            BatchState::Completed => {}
            state => bail!("Link batch {} ended as {:?}", status.id, state),
        }
        if status.counts.failed == 0 {
            return Ok(HashSet::new());
        }

        let api = self.api;
        let index_id = self.index_id.as_str();
        let batch_id = status.id.as_str();
        let failed = collect_all(paginate(move |cursor| {
            api.list_batch_failures(index_id, batch_id, cursor)
        }))
        .await
        .with_context(|| format!("Failed to list failures of link batch {}", batch_id))?;
        Ok(failed.into_iter().collect())
    }
}
