use std::path::PathBuf;

use clap::Parser;
use ncg_bridge::{config, App};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ncg-bridge", version, about)]
struct Args {
    /// Path to a TOML configuration file; `BRIDGE__`-prefixed environment
    /// variables override its values.
    #[arg(long, env = "BRIDGE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(run_error) = run(args).await {
        error!(?run_error, "bridge exited with error");
        std::process::exit(-1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = config::load(args.config.as_deref())?;
    let app = App::new(config).await?;

    tokio::select! {
        result = app.run() => result,
        signal = shutdown_signal() => {
            signal?;
            Ok(())
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received, shutting down"),
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received, shutting down");
    Ok(())
}
