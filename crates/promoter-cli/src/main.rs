//! GitOps Promoter CLI
//!
//! The `promoter` command runs the promotion controllers or checks a set of
//! manifests.
//!
//! ## Commands
//!
//! - `controller`: load manifests into the store and reconcile until Ctrl-C
//! - `validate`: report configuration problems in a manifest directory

mod manifest;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use promoter_core::telemetry::init_tracing;
use promoter_core::{build_manager, GitPaths, PromoterConfig, ReconcileContext, ScmResolver};
use promoter_store::fakes::MemoryObjectStore;
use promoter_store::ObjectStore;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "promoter")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Promote hydrated commits through a chain of environment branches", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controllers until interrupted
    Controller {
        /// TOML configuration file; defaults apply when omitted
        #[arg(short, long, env = "PROMOTER_CONFIG")]
        config: Option<PathBuf>,

        /// Directory of JSON manifests to load into the store
        #[arg(short, long)]
        manifests: Option<PathBuf>,

        /// Re-apply the manifest directory this often (seconds, 0 = never)
        #[arg(long, default_value = "0")]
        reload_secs: u64,
    },

    /// Check a manifest directory without running anything
    Validate {
        /// Directory of JSON manifests
        #[arg(short, long)]
        manifests: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    match cli.command {
        Commands::Controller {
            config,
            manifests,
            reload_secs,
        } => cmd_controller(config.as_deref(), manifests.as_deref(), reload_secs).await,
        Commands::Validate { manifests } => cmd_validate(&manifests),
    }
}

async fn cmd_controller(
    config_path: Option<&Path>,
    manifest_dir: Option<&Path>,
    reload_secs: u64,
) -> Result<()> {
    let config = Arc::new(
        PromoterConfig::load(config_path).context("Failed to load promoter configuration")?,
    );
    let store = Arc::new(MemoryObjectStore::new());

    if let Some(dir) = manifest_dir {
        let manifests = manifest::load_dir(dir)?;
        manifest::ensure_valid(&manifests)?;
        manifest::apply_all(store.as_ref(), &manifests).await?;
    }

    let scm = ScmResolver::new(&config, GitPaths::new()).context("Failed to build SCM client")?;
    let ctx = ReconcileContext::new(store.clone(), Arc::new(scm), config);
    let manager = build_manager(&ctx);
    let handle = manager.handle();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(err) => warn!(error = %err, "cannot listen for Ctrl-C, shutting down"),
        }
        handle.shutdown();
    });

    if let (Some(dir), true) = (manifest_dir, reload_secs > 0) {
        tokio::spawn(reload_manifests(
            store.clone(),
            dir.to_path_buf(),
            Duration::from_secs(reload_secs),
        ));
    }

    manager.run().await.context("Controller manager failed")?;
    info!("promoter stopped");
    Ok(())
}

/// Keep the store in step with the manifest directory. Bad edits are
/// logged and skipped; the last good state stays in place.
async fn reload_manifests(store: Arc<dyn ObjectStore>, dir: PathBuf, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let result = async {
            let manifests = manifest::load_dir(&dir)?;
            manifest::ensure_valid(&manifests)?;
            manifest::apply_all(store.as_ref(), &manifests).await
        }
        .await;
        if let Err(err) = result {
            warn!(dir = %dir.display(), error = %format!("{err:#}"), "manifest reload failed");
        }
    }
}

fn cmd_validate(dir: &Path) -> Result<()> {
    let manifests = manifest::load_dir(dir)?;
    let problems = manifest::check(&manifests);
    if problems.is_empty() {
        println!("{} manifests OK", manifests.len());
        return Ok(());
    }
    for problem in &problems {
        println!("✗ {problem}");
    }
    anyhow::bail!("{} problem(s) found", problems.len())
}
