use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ava_olo::{
    config::{self, Config, LogFormat},
    server,
    service::AvaService,
};

/// AVA OLO conversation and dashboard server
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Address to listen on (overrides AVA_BIND_ADDR)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Force dry-run mode regardless of CAVA_DRY_RUN_MODE
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    if args.dry_run {
        config.dry_run = true;
    }

    // Initialize logging
    init_logging(&config);

    for var in config::ignored_database_vars() {
        warn!(variable = var, "Ignored: storage is SQLite, set DATABASE_PATH instead");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        dry_run = config.dry_run,
        "AVA OLO server starting..."
    );

    let addr = config.server.bind_addr;
    let service = match AvaService::init(config).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "Failed to initialize service");
            return Err(e.into());
        }
    };

    let result = server::serve(Arc::clone(&service), addr).await;
    service.shutdown().await;

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
