//! Sync progress reporting.
//!
//! Reports observable progress during `vecsync sync` so users see which
//! phase is running and how many items are left. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// Phase of the sync run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SyncPhase {
    /// Unlinking and deleting stale objects.
    Delete,
    /// Uploading new identities.
    Upload,
    /// Batch-linking freshly uploaded objects.
    Link,
    /// Batch-linking objects uploaded by an earlier run.
    LinkOnly,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncPhase::Delete => "delete",
            SyncPhase::Upload => "upload",
            SyncPhase::Link => "link",
            SyncPhase::LinkOnly => "link-only",
        }
    }
}

/// A single progress event for sync.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    /// Locating the namespace index.
    Resolving { namespace: String },
    /// Reading remote objects and index membership. Total unknown.
    Snapshot { namespace: String },
    /// Executor phase: n items finished out of total.
    Phase {
        phase: SyncPhase,
        n: u64,
        total: u64,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the sync run and the executor.
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync  upload  1,234 / 5,000 items".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Resolving { namespace } => {
                format!("sync {}  resolving index...\n", namespace)
            }
            SyncProgressEvent::Snapshot { namespace } => {
                format!("sync {}  reading remote snapshot...\n", namespace)
            }
            SyncProgressEvent::Phase { phase, n, total } => {
                let n_fmt = format_number(*n);
                let total_fmt = format_number(*total);
                format!(
                    "sync  {}  {} / {} items\n",
                    phase.as_str(),
                    n_fmt,
                    total_fmt
                )
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Resolving { namespace } => serde_json::json!({
                "event": "progress",
                "namespace": namespace,
                "phase": "resolving"
            }),
            SyncProgressEvent::Snapshot { namespace } => serde_json::json!({
                "event": "progress",
                "namespace": namespace,
                "phase": "snapshot"
            }),
            SyncProgressEvent::Phase { phase, n, total } => serde_json::json!({
                "event": "progress",
                "phase": phase.as_str(),
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn phase_labels() {
        assert_eq!(SyncPhase::Delete.as_str(), "delete");
        assert_eq!(SyncPhase::LinkOnly.as_str(), "link-only");
    }
}
