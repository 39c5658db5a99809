//! stratumd entry point.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use stratum_core::config;
use stratum_server::flight::BuildGate;
use stratum_server::http::{self, AppState};
use stratum_server::image::ImageBuilder;
use stratum_server::rules::RuleRegistry;
use stratum_server::store::Store;
use stratum_server::upstream::Upstream;
use stratum_server::watch::{self, WatchConfig};

/// Just-in-time container image server.
#[derive(Debug, Parser)]
#[command(name = "stratumd", version)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = ":8888")]
    address: String,

    /// Cache root directory.
    #[arg(long, default_value = "./cache")]
    cache: PathBuf,

    /// Redirect clients here after an ensure-in-upstream build.
    #[arg(long)]
    storage_image_proxy: Option<String>,

    /// Configuration file declaring Image and Registry records
    /// (repeatable).
    #[arg(long = "config", short = 'c')]
    config: Vec<PathBuf>,

    /// Kubeconfig for the orchestration API providing dynamic rules.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Orchestration API server URL.
    #[arg(long)]
    master: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    if args.config.is_empty() && args.kubeconfig.is_none() && args.master.is_none() {
        bail!("at least one of --config, --kubeconfig, or --master must be set");
    }

    let documents = config::load_files(&args.config).context("loading configuration")?;
    tracing::info!(documents = documents.len(), files = args.config.len(), "loaded configuration");

    let store = Arc::new(Store::open(&args.cache).context("opening cache")?);
    let rules = Arc::new(RuleRegistry::new(documents).context("compiling rules")?);
    let upstream = Arc::new(Upstream::new(Arc::clone(&rules)));
    let builder = Arc::new(ImageBuilder::new(Arc::clone(&store), Arc::clone(&upstream)));

    if let Some(watch_config) = watch_config(&args)? {
        tracing::info!(server = %watch_config.server, "watching orchestration API");
        let rules = Arc::clone(&rules);
        tokio::spawn(watch::run(watch_config, rules));
    }

    let state = Arc::new(AppState {
        store,
        rules,
        upstream,
        builder,
        gate: BuildGate::new(),
        storage_image_proxy: args.storage_image_proxy.clone(),
    });

    http::serve(&args.address, state).await?;
    Ok(())
}

fn watch_config(args: &Args) -> anyhow::Result<Option<WatchConfig>> {
    if let Some(path) = &args.kubeconfig {
        let mut config = WatchConfig::from_kubeconfig(path).context("reading kubeconfig")?;
        // An explicit --master overrides the kubeconfig's server.
        if let Some(master) = &args.master {
            config.server = master.trim_end_matches('/').to_string();
        }
        return Ok(Some(config));
    }
    if let Some(master) = &args.master {
        return Ok(Some(WatchConfig::from_master(master)));
    }
    Ok(None)
}
