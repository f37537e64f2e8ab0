use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use image_service::{
    catalog::Catalog,
    daemon::{shutdown_signal, AppState, ImageDaemon},
    fsop::{FsOps, TokioRunner},
    inventory::Inventory,
    store::ImageStore,
    util::{
        config::{ConfigError, ServiceConfig},
        logging,
    },
};

#[derive(Debug, Parser)]
#[command(name = "image-service", version, about = "Serve loop-mounted OS images over HTTP")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "./config.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Create an empty inventory file if none exists.
    #[arg(long)]
    init_inventory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_tracing("image-service", &cli.log_level)?;

    let config = match ServiceConfig::load(&cli.config) {
        Ok(config) => config,
        Err(ConfigError::NotFound(path)) => {
            tracing::warn!("{} not found, using defaults", path.display());
            ServiceConfig::default()
        }
        Err(e) => return Err(e.into()),
    };

    let cwd = std::env::current_dir().context("cannot determine working directory")?;
    let paths = config.resolve(&cwd);
    tracing::info!("resolved paths: {paths:?}");

    if cli.init_inventory && ImageStore::create_if_missing(&paths.inventory_file).await? {
        tracing::info!("created {}", paths.inventory_file.display());
    }

    let fs = FsOps::new(Arc::new(TokioRunner::new(config.command_timeout())));
    let inventory = Arc::new(Inventory::new(paths.clone(), fs.clone()));
    inventory
        .initialize()
        .await
        .context("failed to initialize inventory")?;

    let report = inventory
        .boot()
        .await
        .context("boot reconciliation failed")?;
    tracing::info!(
        "{} images restored, {} removed",
        report.restored.len(),
        report.removed.len()
    );

    let state = AppState {
        inventory,
        catalog: Arc::new(Catalog::new(paths, fs)),
    };
    ImageDaemon::new(state)
        .serve(config.northbound_addr, config.southbound_addr, shutdown_signal())
        .await
        .context("daemon failed")?;
    Ok(())
}
