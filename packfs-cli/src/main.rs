//! packfs - Mount rendered Nomad Pack jobs as a read-only filesystem.
//!
//! Usage:
//!   packfs <config.toml> <mountpoint> [options]
//!
//! Examples:
//!   packfs packs.toml /mnt/packs                   # Render and mount
//!   packfs packs.toml /mnt/packs --jobs 8          # More parallel renders
//!   packfs packs.toml /mnt/packs --dry-run         # Print results as JSON
//!   RUST_LOG=debug packfs packs.toml /mnt/packs    # Verbose logging

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use packfs_core::{
    check_mountpoint, spawn_mount, JobOrchestrator, NomadPackRenderer, PackConfig, RenderFs,
    RenderTree, RendererConfig, TerminalSize, DEFAULT_MAX_CONCURRENT_RENDERS,
    DEFAULT_TIMEOUT_SECS,
};

/// Render Nomad Pack jobs and mount the output read-only
#[derive(Parser, Debug)]
#[command(name = "packfs")]
#[command(about = "Mount rendered nomad-pack jobs as a read-only filesystem")]
struct Args {
    /// Pack configuration (TOML)
    config: PathBuf,

    /// Existing, empty directory to mount on
    mountpoint: PathBuf,

    /// nomad-pack executable
    #[arg(long, env = "PACKFS_NOMAD_PACK", default_value = "nomad-pack")]
    nomad_pack: String,

    /// Maximum number of renders running at once
    #[arg(long, env = "PACKFS_JOBS", default_value_t = DEFAULT_MAX_CONCURRENT_RENDERS)]
    jobs: usize,

    /// Kill a render after this many seconds
    #[arg(long, env = "PACKFS_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,

    /// Terminal rows seen by the renderer
    #[arg(long, default_value_t = 24)]
    rows: u16,

    /// Terminal columns seen by the renderer
    #[arg(long, default_value_t = 80)]
    cols: u16,

    /// Unmount automatically when the process exits
    #[arg(long)]
    auto_unmount: bool,

    /// Render and print the results as JSON instead of mounting
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = PackConfig::load(&args.config)?;
    if !args.dry_run {
        check_mountpoint(&args.mountpoint)?;
    }
    info!(
        config = %args.config.display(),
        packs = config.packs.len(),
        jobs = config.job_count(),
        "loaded configuration"
    );

    let renderer = NomadPackRenderer::new(RendererConfig {
        program: args.nomad_pack.clone(),
        leading_args: Vec::new(),
        terminal: TerminalSize {
            rows: args.rows,
            cols: args.cols,
        },
        timeout: Duration::from_secs(args.timeout_secs),
    });
    let orchestrator = JobOrchestrator::new(Arc::new(renderer), args.jobs);
    let aggregate = orchestrator.render_all(&config).await;

    for (key, outcome) in &aggregate {
        if let packfs_core::JobOutcome::Failed(reason) = outcome {
            warn!(job = %key, %reason, "job has no files");
        }
    }

    if args.dry_run {
        println!("{}", serde_json::to_string_pretty(&aggregate)?);
        return Ok(());
    }

    let tree = RenderTree::build(&aggregate)?;
    drop(aggregate);
    info!(
        nodes = tree.node_count(),
        files = tree.file_count(),
        bytes = tree.total_bytes(),
        "built render tree"
    );

    let fs = RenderFs::new(Arc::new(tree));
    let session = spawn_mount(fs, &args.mountpoint, args.auto_unmount)?;
    info!(mountpoint = %args.mountpoint.display(), "serving; press Ctrl-C to unmount");

    wait_for_shutdown().await?;

    info!("unmounting");
    drop(session);
    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_shutdown() -> std::io::Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate.recv() => Ok(()),
    }
}
