use std::sync::Arc;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use tracing::{info, warn};

use replica_mesh::cli::Cli;
use replica_mesh::config::load_initial_view;
use replica_mesh::keys::FileKeyStore;
use replica_mesh::runtime::Replica;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            err.print()?;
            return Ok(());
        }
        Err(err) => {
            warn!("invalid arguments: {:?}", err.kind());
            println!("{}", Cli::command().render_usage());
            return Ok(());
        }
    };

    let view_path = cli.view_path();
    let view = load_initial_view(&view_path)
        .with_context(|| format!("cannot start without a bootstrap view ({})", view_path.display()))?;
    let keys = Arc::new(FileKeyStore::new(cli.config_dir.clone()));

    let replica = Replica::start(cli.replica_config(), view, keys).await?;
    info!("replica {} running, press ctrl-c to stop", replica.id());

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    replica.shutdown().await;

    Ok(())
}
