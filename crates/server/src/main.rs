use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod api;
mod config;

use config::{AppState, LogFormat, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(about = "Workflow orchestration engine", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "CONDUCTOR_CONFIG", default_value = "conductor.toml")]
    config: PathBuf,

    /// Data directory for storage
    #[arg(short, long, env = "CONDUCTOR_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "CONDUCTOR_PORT")]
    port: Option<u16>,

    /// Host to bind to (overrides the config file)
    #[arg(long, env = "CONDUCTOR_HOST")]
    host: Option<String>,

    /// Emit logs as JSON
    #[arg(long, env = "CONDUCTOR_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "conductor=info,conductor_core=info,conductor_server=info,tower_http=debug".into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ServerConfig::load(&args.config, args.data_dir.clone())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if args.log_json {
        config.logging.format = LogFormat::Json;
    }

    init_tracing(config.logging.format);

    tracing::info!("Starting Conductor");
    tracing::info!("Data directory: {}", args.data_dir.display());
    if !args.config.exists() {
        tracing::info!("Configuration file {} not found, using defaults", args.config.display());
    }

    let state = AppState::new(&config).await?;

    let addr = config.bind_addr();
    tracing::info!("Starting API server on {}", addr);

    api::serve(&addr, state).await?;

    Ok(())
}
