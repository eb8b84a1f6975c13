//! # vecsync CLI
//!
//! Syncs a local directory tree into a remote vector store.
//!
//! ## Usage
//!
//! ```bash
//! vecsync --config ./vecsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vecsync sync` | Reconcile the local tree with the remote and apply the plan |
//! | `vecsync sync --dry-run` | Print the plan without changing the remote |
//! | `vecsync scan` | List the identities the local tree produces (no network) |
//!
//! ## Examples
//!
//! ```bash
//! # Sync every markdown file under ./docs into the "acme-handbook" namespace
//! vecsync sync --root ./docs --namespace acme-handbook
//!
//! # Preview as JSON
//! vecsync sync --dry-run --json
//!
//! # Fail the CI job when any single file fails to sync
//! vecsync sync --fail-on-item-errors
//! ```

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use vecsync::config::{self, Overrides};
use vecsync::progress::ProgressMode;
use vecsync::sync::{self, SyncOptions};

/// vecsync: keep a remote vector store in step with a local directory.
#[derive(Parser)]
#[command(
    name = "vecsync",
    about = "Sync a local directory tree into a remote vector store",
    version,
    long_about = "vecsync names every eligible local file by namespace, content hash and \
    relative path, compares those names with the files and vector-store links that exist \
    remotely, and uploads, links and deletes until both sides agree."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./vecsync.toml` when present, otherwise built-in defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Progress on stderr: off, human or json.
    ///
    /// Defaults to human when stderr is a terminal, otherwise off.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Reconcile the local tree with the remote and apply the plan.
    ///
    /// Deletes stale objects, uploads and links new ones, and links objects
    /// an earlier run uploaded but never attached.
    Sync {
        /// Print the plan without changing anything on the remote.
        #[arg(long)]
        dry_run: bool,

        /// Print the summary as JSON.
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// List the identities the local tree would produce.
    ///
    /// Also shows files that were skipped or could not be read. Does not
    /// contact the remote.
    Scan {
        /// Print the result as JSON.
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        overrides: OverrideArgs,
    },
}

/// Settings that take precedence over the configuration file.
#[derive(Args)]
struct OverrideArgs {
    /// Directory to sync.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Glob selecting files under the root (e.g. `**/*.md`).
    #[arg(long)]
    pattern: Option<String>,

    /// Namespace key.
    #[arg(long)]
    namespace: Option<String>,

    /// Maximum uploads or deletes in flight.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Exit non-zero when any single item fails.
    #[arg(long)]
    fail_on_item_errors: bool,
}

impl From<OverrideArgs> for Overrides {
    fn from(args: OverrideArgs) -> Self {
        Overrides {
            root: args.root,
            pattern: args.pattern,
            namespace: args.namespace,
            concurrency: args.concurrency,
            fail_on_item_errors: args.fail_on_item_errors,
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load(path: Option<&PathBuf>, overrides: OverrideArgs) -> anyhow::Result<config::Config> {
    let mut cfg = config::load_or_default(path.map(PathBuf::as_path))?;
    cfg.apply_overrides(&overrides.into());
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync {
            dry_run,
            json,
            overrides,
        } => {
            let cfg = load(cli.config.as_ref(), overrides)?;
            let mode = cli.progress.unwrap_or_else(ProgressMode::default_for_tty);
            let reporter = mode.reporter();
            sync::run_sync(&cfg, SyncOptions { dry_run, json }, reporter.as_ref()).await?;
        }
        Commands::Scan { json, overrides } => {
            let cfg = load(cli.config.as_ref(), overrides)?;
            sync::run_scan(&cfg, json)?;
        }
    }

    Ok(())
}
