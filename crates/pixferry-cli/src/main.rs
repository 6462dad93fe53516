//! The `pipeline` binary: run the phase graph, reset errored files, and
//! print store status.
//!
//! Exit codes: 0 when every enabled phase started, 1 when a phase failed to
//! start, 2 on configuration or schema errors. Per-file errors never affect
//! the exit code.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use pixferry_core::models::PhaseName;
use pixferry_core::{NoOpNotifier, NoTwoFactorSource, PipelineConfig, PipelineError};
use pixferry_db::{HashIndex, MetaStore, MetaStoreMirror, MirrorConfig};
use pixferry_pipeline::ingest::FolderIngest;
use pixferry_pipeline::{Orchestrator, PipelineContext};

#[derive(Parser)]
#[command(name = "pipeline", about = "Media ingest pipeline orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full phase graph, honoring the configured toggles.
    Run {
        /// Run a single phase instead of the whole graph.
        #[arg(long)]
        phase: Option<String>,
        /// List detected upload selectors and exit without uploading.
        #[arg(long)]
        inspect_selectors: bool,
    },
    /// Clear `error` on a media file so the pipeline picks it up again.
    ResetFile { id: Uuid },
    /// Print per-status file counts from the local store.
    Status,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let config = match PipelineConfig::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("configuration error: {}", e);
            return exit_code_for(&e);
        }
    };
    init_tracing(&config);

    let store = match MetaStore::open(&config.store.local_db_path).await {
        Ok(store) => store,
        Err(e) => {
            eprintln!("cannot open local store: {}", e);
            return exit_code_for(&e);
        }
    };

    let mirror_config = match (&config.store.remote_db_url, &config.store.remote_db_key) {
        (Some(url), Some(key)) => Some(MirrorConfig {
            url: url.clone(),
            api_key: key.clone(),
            queue_cap: config.store.mirror_queue_cap,
        }),
        _ => None,
    };
    let mirror = MetaStoreMirror::new(store.clone(), mirror_config);
    if let Some(feed) = store.take_change_feed().await {
        mirror.spawn(feed);
    }
    if let Err(e) = mirror.reconcile().await {
        tracing::warn!(error = %e, "startup reconciliation deferred, remote unreachable");
    }

    let hash_index = match HashIndex::warm(&store).await {
        Ok(index) => Arc::new(index),
        Err(e) => {
            eprintln!("cannot warm hash index: {}", e);
            return exit_code_for(&e);
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling workers");
                cancel.cancel();
            }
        });
    }

    let ctx = PipelineContext {
        config: config.clone(),
        store: store.clone(),
        hash_index,
        mirror,
        notifier: Arc::new(NoOpNotifier),
        two_factor: Arc::new(NoTwoFactorSource),
        cancel,
    };

    match cli.command {
        Command::Run {
            phase,
            inspect_selectors,
        } => run_pipeline(ctx, phase, inspect_selectors).await,
        Command::ResetFile { id } => reset_file(&store, id).await,
        Command::Status => status(&store).await,
    }
}

async fn run_pipeline(ctx: PipelineContext, phase: Option<String>, inspect: bool) -> i32 {
    let config = ctx.config.clone();
    let mut orchestrator = Orchestrator::new(ctx).with_selector_inspection(inspect);

    if config.features.folder_download {
        let roots = config.dedupe.extra_directories.clone();
        if roots.is_empty() {
            tracing::warn!("ENABLE_FOLDER_DOWNLOAD is on but DEDUPLICATION_DIRECTORIES is empty");
        }
        orchestrator = orchestrator.with_ingest_source(Arc::new(FolderIngest::new(
            roots,
            config.paths.originals_dir.clone(),
        )));
    }
    if config.features.icloud_download {
        // The vendor download protocol lives outside this binary; without a
        // client wired in, the source contributes nothing.
        tracing::warn!("ENABLE_ICLOUD_DOWNLOAD is on but no cloud photo client is configured");
    }

    let result = match phase {
        Some(name) => match name.parse::<PhaseName>() {
            Ok(phase) => orchestrator.run_phase(phase).await,
            Err(_) => {
                eprintln!(
                    "unknown phase '{}'; expected one of: {}",
                    name,
                    PhaseName::ALL
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                return 2;
            }
        },
        None => orchestrator.run().await,
    };

    match result {
        Ok(report) => {
            println!("{}", report);
            if config.logging.verbose {
                dump_report(&config, &report.to_string()).await;
            }
            report.exit_code()
        }
        Err(e) => {
            eprintln!("pipeline failed: {}", e);
            exit_code_for(&e)
        }
    }
}

/// Map an error that escaped the orchestrator to a process exit code:
/// configuration and schema problems exit 2, anything else exits 1.
fn exit_code_for(e: &PipelineError) -> i32 {
    if e.is_fatal() {
        2
    } else {
        1
    }
}

async fn reset_file(store: &MetaStore, id: Uuid) -> i32 {
    match store.reset_file(id).await {
        Ok(file) => {
            println!("file {} reset to {}", file.id, file.status);
            0
        }
        Err(e) => {
            eprintln!("cannot reset {}: {}", id, e);
            1
        }
    }
}

async fn status(store: &MetaStore) -> i32 {
    match store.status_counts().await {
        Ok(counts) => {
            if counts.is_empty() {
                println!("no files tracked yet");
            }
            for (status, count) in counts {
                println!("{:<14} {}", status.to_string(), count);
            }
            0
        }
        Err(e) => {
            eprintln!("cannot read store: {}", e);
            1
        }
    }
}

fn init_tracing(config: &PipelineConfig) {
    let level = if config.logging.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Text dump of the final report under `<NAS_MOUNT>/logs/`.
async fn dump_report(config: &PipelineConfig, report: &str) {
    let dir = &config.paths.logs_dir;
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
        tracing::warn!(error = %e, "cannot create logs directory");
        return;
    }
    let name = format!("run-{}.log", chrono::Utc::now().format("%Y%m%d-%H%M%S"));
    if let Err(e) = tokio::fs::write(dir.join(&name), report).await {
        tracing::warn!(error = %e, "cannot write report dump");
    }
}
