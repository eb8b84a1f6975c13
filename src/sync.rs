//! Run orchestration for `vecsync sync` and `vecsync scan`.
//!
//! A sync run proceeds in this order:
//!
//! 1. resolve the namespace key and walk the local tree,
//! 2. look up the namespace index,
//! 3. read the full remote snapshot,
//! 4. create the index if step 2 found none (not in a dry run),
//! 5. reconcile into a [`Plan`],
//! 6. execute the plan (skipped in a dry run),
//! 7. print a summary on stdout.
//!
//! Any error up to step 4 fails the run outright; steps 1 to 3 only read, so
//! nothing on the remote has been changed. Failures of individual items in
//! step 6 are reported in the summary; they only fail the run when
//! `executor.fail_on_item_errors` is set.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::executor::PlanExecutor;
use crate::index::{create_index, find_index};
use crate::local_fs::scan_local;
use crate::models::{ExecutionReport, PhaseReport, Plan};
use crate::namespace::resolve_namespace;
use crate::openai::OpenAiRemote;
use crate::progress::{SyncProgressEvent, SyncProgressReporter};
use crate::reconcile::reconcile_scan;
use crate::remote::RemoteApi;
use crate::snapshot::read_snapshot;

/// Flags of the `sync` command.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Reconcile and print the plan without changing the remote.
    pub dry_run: bool,
    /// Print the summary as JSON.
    pub json: bool,
}

/// Number of entries in each plan list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanCounts {
    pub create_and_link: usize,
    pub link_only: usize,
    pub delete: usize,
}

impl From<&Plan> for PlanCounts {
    fn from(plan: &Plan) -> Self {
        Self {
            create_and_link: plan.to_create_and_link.len(),
            link_only: plan.to_link_only.len(),
            delete: plan.to_delete.len(),
        }
    }
}

/// Everything a sync run reports.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub namespace: String,
    pub backend: String,
    /// `None` only in a dry run against a namespace without an index.
    pub index_id: Option<String>,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub local_files: usize,
    pub skipped_files: usize,
    pub unreadable_files: usize,
    pub remote_objects: usize,
    pub linked_objects: usize,
    pub plan: PlanCounts,
    /// Full plan, kept for dry runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub planned: Option<Plan>,
    /// Phase outcomes, absent in a dry run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionReport>,
}

impl SyncReport {
    pub fn failure_count(&self) -> usize {
        self.execution
            .as_ref()
            .map(ExecutionReport::failure_count)
            .unwrap_or(0)
    }
}

/// Run `vecsync sync` against the configured OpenAI-compatible remote.
pub async fn run_sync(
    config: &Config,
    options: SyncOptions,
    progress: &dyn SyncProgressReporter,
) -> Result<()> {
    let api = OpenAiRemote::from_config(&config.remote)?;
    let report = sync_with_remote(config, options.dry_run, &api, progress).await?;
    print_report(&report, options.json)?;

    let failures = report.failure_count();
    if failures > 0 && config.executor.fail_on_item_errors {
        bail!("{} item(s) failed to sync", failures);
    }
    Ok(())
}

/// Reconcile the local tree against `api` and, unless `dry_run`, apply the
/// resulting plan.
pub async fn sync_with_remote(
    config: &Config,
    dry_run: bool,
    api: &dyn RemoteApi,
    progress: &dyn SyncProgressReporter,
) -> Result<SyncReport> {
    let started_at = Utc::now();
    let namespace = resolve_namespace(config)?;
    tracing::info!(namespace = %namespace, backend = api.backend(), dry_run, "starting sync");

    let scan = scan_local(&config.source, &namespace)?;
    tracing::info!(
        files = scan.files.len(),
        skipped = scan.skipped.len(),
        unreadable = scan.unreadable.len(),
        "scanned local files"
    );

    progress.report(SyncProgressEvent::Resolving {
        namespace: namespace.clone(),
    });
    let existing = find_index(api, &namespace).await?;

    progress.report(SyncProgressEvent::Snapshot {
        namespace: namespace.clone(),
    });
    let existing_id = existing.as_ref().map(|index| index.id.as_str());
    let snapshot = read_snapshot(api, &namespace, existing_id).await?;

    // The snapshot is complete; from here on the remote may be changed.
    let index_id = match existing {
        Some(index) => {
            tracing::info!(index = %index.id, namespace = %namespace, "using existing index");
            Some(index.id)
        }
        None if dry_run => None,
        None => {
            let display_name = config
                .namespace
                .index_name
                .clone()
                .unwrap_or_else(|| namespace.clone());
            Some(create_index(api, &namespace, &display_name).await?.id)
        }
    };

    let plan = reconcile_scan(&scan, &namespace, &snapshot);
    let counts = PlanCounts::from(&plan);
    tracing::info!(
        create_and_link = counts.create_and_link,
        link_only = counts.link_only,
        delete = counts.delete,
        "reconciled"
    );

    let (planned, execution) = match (&index_id, dry_run) {
        (Some(index_id), false) => {
            let executor = PlanExecutor::new(api, index_id, &config.executor);
            (None, Some(executor.execute(&plan, progress).await))
        }
        _ => (Some(plan), None),
    };

    Ok(SyncReport {
        namespace,
        backend: api.backend().to_string(),
        index_id,
        dry_run,
        started_at,
        finished_at: Utc::now(),
        local_files: scan.files.len(),
        skipped_files: scan.skipped.len(),
        unreadable_files: scan.unreadable.len(),
        remote_objects: snapshot.objects.len(),
        linked_objects: snapshot.links.len(),
        plan: counts,
        planned,
        execution,
    })
}

fn print_report(report: &SyncReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", render_report(report));
    }
    Ok(())
}

/// Plain-text summary of a sync run.
pub fn render_report(report: &SyncReport) -> String {
    let mut out = String::new();
    if report.dry_run {
        out.push_str(&format!("sync {} (dry-run)\n", report.namespace));
    } else {
        out.push_str(&format!("sync {}\n", report.namespace));
    }
    out.push_str(&format!(
        "  index: {}\n",
        report.index_id.as_deref().unwrap_or("(would be created)")
    ));
    out.push_str(&format!(
        "  local files: {} (skipped: {}, unreadable: {})\n",
        report.local_files, report.skipped_files, report.unreadable_files
    ));
    out.push_str(&format!(
        "  remote objects: {} ({} linked)\n",
        report.remote_objects, report.linked_objects
    ));

    if let Some(plan) = &report.planned {
        out.push_str(&format!("  to delete: {}\n", plan.to_delete.len()));
        for planned in &plan.to_delete {
            out.push_str(&format!("    - {} {}\n", planned.object.id, planned.object.name));
        }
        out.push_str(&format!(
            "  to create and link: {}\n",
            plan.to_create_and_link.len()
        ));
        for file in &plan.to_create_and_link {
            out.push_str(&format!("    + {}\n", file.identity));
        }
        out.push_str(&format!("  to link only: {}\n", plan.to_link_only.len()));
        for object in &plan.to_link_only {
            out.push_str(&format!("    ~ {} {}\n", object.id, object.name));
        }
    }

    if let Some(execution) = &report.execution {
        for (label, phase) in [
            ("delete", &execution.delete),
            ("upload", &execution.upload),
            ("link", &execution.create_link),
            ("link-only", &execution.link_only),
        ] {
            out.push_str(&phase_line(label, phase));
        }
        let failures: Vec<_> = [
            &execution.delete,
            &execution.upload,
            &execution.create_link,
            &execution.link_only,
        ]
        .into_iter()
        .flat_map(|phase| phase.failures.iter())
        .collect();
        if !failures.is_empty() {
            out.push_str("  failures:\n");
            for failure in failures {
                out.push_str(&format!("    {}: {}\n", failure.subject, failure.error));
            }
        }
    }

    let elapsed = report.finished_at - report.started_at;
    out.push_str(&format!(
        "  elapsed: {:.1}s\n",
        elapsed.num_milliseconds() as f64 / 1000.0
    ));
    match report.failure_count() {
        0 => out.push_str("ok\n"),
        n => out.push_str(&format!("completed with {} failure(s)\n", n)),
    }
    out
}

fn phase_line(label: &str, phase: &PhaseReport) -> String {
    format!(
        "  {}: {} attempted, {} succeeded, {} failed\n",
        label,
        phase.attempted,
        phase.succeeded,
        phase.failed()
    )
}

/// Run `vecsync scan`: list what the local set would contain.
pub fn run_scan(config: &Config, json: bool) -> Result<()> {
    let namespace = resolve_namespace(config)?;
    let scan = scan_local(&config.source, &namespace)?;

    if json {
        let files: Vec<_> = scan
            .files
            .values()
            .map(|file| {
                serde_json::json!({
                    "name": file.identity.key(),
                    "relative_path": file.identity.relative_path,
                    "fingerprint": file.identity.fingerprint,
                    "size_bytes": file.size_bytes,
                })
            })
            .collect();
        let doc = serde_json::json!({
            "namespace": namespace,
            "root": config.source.root,
            "files": files,
            "skipped": scan.skipped,
            "unreadable": scan.unreadable,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("scan {}", namespace);
    println!("  root: {}", config.source.root.display());
    println!("  files: {}", scan.files.len());
    for file in scan.files.values() {
        println!("    {} ({} bytes)", file.identity, file.size_bytes);
    }
    if !scan.skipped.is_empty() {
        println!("  skipped: {}", scan.skipped.len());
        for skipped in &scan.skipped {
            println!("    {} ({})", skipped.relative_path, skipped.reason);
        }
    }
    if !scan.unreadable.is_empty() {
        println!("  unreadable: {}", scan.unreadable.len());
        for path in &scan.unreadable {
            println!("    {}", path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRemote;
    use crate::models::{Identity, ItemFailure, LocalFile, PlannedDelete, RemoteObject};
    use crate::progress::NoProgress;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn report() -> SyncReport {
        let now = Utc::now();
        SyncReport {
            namespace: "acme-docs".to_string(),
            backend: "memory".to_string(),
            index_id: Some("vs-1".to_string()),
            dry_run: false,
            started_at: now,
            finished_at: now,
            local_files: 3,
            skipped_files: 1,
            unreadable_files: 0,
            remote_objects: 2,
            linked_objects: 2,
            plan: PlanCounts::default(),
            planned: None,
            execution: Some(ExecutionReport::default()),
        }
    }

    #[test]
    fn clean_run_ends_ok() {
        let text = render_report(&report());
        assert!(text.starts_with("sync acme-docs\n"));
        assert!(text.contains("  upload: 0 attempted, 0 succeeded, 0 failed\n"));
        assert!(text.ends_with("ok\n"));
    }

    #[test]
    fn failures_are_listed() {
        let mut report = report();
        let execution = report.execution.as_mut().unwrap();
        execution.delete.attempted = 1;
        execution.delete.failures.push(ItemFailure {
            subject: "file-9".to_string(),
            error: "HTTP 500".to_string(),
        });

        let text = render_report(&report);
        assert!(text.contains("    file-9: HTTP 500\n"));
        assert!(text.ends_with("completed with 1 failure(s)\n"));
        assert_eq!(report.failure_count(), 1);
    }

    #[test]
    fn dry_run_lists_the_plan() {
        let fingerprint: String = std::iter::repeat('a').take(64).collect();
        let mut report = report();
        report.dry_run = true;
        report.index_id = None;
        report.execution = None;
        report.planned = Some(Plan {
            to_create_and_link: vec![LocalFile {
                identity: Identity::new("acme-docs", &fingerprint, "a.md"),
                absolute_path: "/src/a.md".into(),
                size_bytes: 1,
            }],
            to_link_only: vec![],
            to_delete: vec![PlannedDelete {
                object: RemoteObject {
                    id: "file-1".to_string(),
                    name: "acme-docs-old/b.md".to_string(),
                },
                linked: true,
            }],
        });

        let text = render_report(&report);
        assert!(text.starts_with("sync acme-docs (dry-run)\n"));
        assert!(text.contains("(would be created)"));
        assert!(text.contains(&format!("    + acme-docs-{}/a.md\n", fingerprint)));
        assert!(text.contains("    - file-1 acme-docs-old/b.md\n"));
    }

    #[test]
    fn json_omits_absent_sections() {
        let mut report = report();
        report.execution = None;
        let value = serde_json::to_value(&report).unwrap();
        assert!(value.get("execution").is_none());
        assert!(value.get("planned").is_none());
        assert_eq!(value["namespace"], "acme-docs");
        assert!(value["started_at"].is_string());
    }

    // ── runs against a remote with injected faults ───────────────────

    const NS: &str = "acme-handbook";

    fn setup_docs() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let docs = tmp.path();
        fs::create_dir_all(docs.join("guides")).unwrap();
        fs::write(docs.join("alpha.md"), "# Alpha\n\nFirst document.\n").unwrap();
        fs::write(docs.join("beta.md"), "# Beta\n\nSecond document.\n").unwrap();
        fs::write(docs.join("guides/gamma.md"), "# Gamma\n\nA guide.\n").unwrap();
        tmp
    }

    fn config_for(root: &Path) -> Config {
        let mut config = Config::default();
        config.source.root = root.to_path_buf();
        config.namespace.key = Some(NS.to_string());
        config.executor.poll_interval_ms = 5;
        config.executor.poll_timeout_secs = 1;
        config
    }

    async fn sync(config: &Config, remote: &MemoryRemote) -> SyncReport {
        sync_with_remote(config, false, remote, &NoProgress)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn item_failures_are_isolated_and_repaired_next_run() {
        let docs = setup_docs();
        let config = config_for(docs.path());
        let remote = MemoryRemote::new();
        remote.fail_link_by_name("/beta.md");

        let first = sync(&config, &remote).await;
        let execution = first.execution.as_ref().unwrap();
        assert_eq!(execution.upload.succeeded, 3);
        assert_eq!(execution.create_link.succeeded, 2);
        assert_eq!(execution.create_link.failed(), 1);
        assert!(execution.create_link.failures[0].subject.ends_with("/beta.md"));
        assert_eq!(first.failure_count(), 1);

        // The uploaded but unlinked object is picked up as link-only.
        let second = sync(&config, &remote).await;
        assert_eq!(second.plan.link_only, 1);
        assert_eq!(second.plan.create_and_link, 0);
        assert_eq!(remote.upload_count(), 3);
    }

    #[tokio::test]
    async fn delete_failure_does_not_block_uploads() {
        let docs = setup_docs();
        let config = config_for(docs.path());
        let remote = MemoryRemote::new();
        let stale = remote.seed_object(&Identity::new(NS, &"f".repeat(64), "old.md").key());
        remote.fail_delete(&stale.id);

        let report = sync(&config, &remote).await;
        let execution = report.execution.as_ref().unwrap();

        assert_eq!(execution.delete.failed(), 1);
        assert_eq!(execution.delete.failures[0].subject, stale.id);
        assert_eq!(execution.upload.succeeded, 3);
        assert_eq!(execution.create_link.succeeded, 3);
    }

    #[tokio::test]
    async fn stalled_link_batch_is_reported_not_awaited_forever() {
        let docs = setup_docs();
        let config = config_for(docs.path());
        let remote = MemoryRemote::new();
        remote.stall_batches();

        let report = sync(&config, &remote).await;
        let execution = report.execution.as_ref().unwrap();

        assert_eq!(execution.upload.succeeded, 3);
        assert_eq!(execution.create_link.failed(), 3);
        assert!(execution.create_link.failures[0].error.contains("Gave up"));
        assert!(remote.members(&report.index_id.unwrap()).is_empty());
    }

    #[tokio::test]
    async fn snapshot_failure_aborts_before_any_change() {
        let docs = setup_docs();
        let config = config_for(docs.path());
        let remote = MemoryRemote::new().with_page_size(1);
        for path in ["old-1.md", "old-2.md", "old-3.md"] {
            remote.seed_object(&Identity::new(NS, &"e".repeat(64), path).key());
        }
        remote.fail_list_objects_at_page(2);
        let before = remote.objects();

        let result = sync_with_remote(&config, false, &remote, &NoProgress).await;

        assert!(result.is_err());
        assert_eq!(remote.objects(), before);
        assert_eq!(remote.upload_count(), 0);
        assert!(remote.indexes().is_empty());
    }
}
