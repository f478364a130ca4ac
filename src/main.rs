mod aggregator;
mod archive;
mod config;
mod cooldown;
mod detector;
mod dispatcher;
mod error;
mod ingest;
mod model;
mod orchestrator;
mod price;
mod recovery;
mod sink;
mod suppressor;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use derive_more::{Display, Error};
use error_stack::{Report, ResultExt};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use archive::JsonlArchive;
use config::AppConfig;
use orchestrator::Orchestrator;
use sink::TerminalSink;

#[derive(Debug, Display, Error)]
pub enum AppError {
    #[display("configuration error")]
    Config,
    #[display("runtime error")]
    Runtime,
}

#[derive(Parser)]
#[command(name = "taker-surveillance", about = "Real-time taker trade surveillance engine")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() {
    if let Err(report) = run().await {
        eprintln!("{report:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Report<AppError>> {
    let cli = Cli::parse();
    let config = config::load(Path::new(&cli.config)).change_context(AppError::Config)?;

    init_tracing(&config);
    info!(symbols = ?config.symbols, "starting taker surveillance engine");

    let archive: Option<Arc<dyn archive::Archive>> = if config.general.archive_enabled {
        std::fs::create_dir_all(&config.general.data_dir)
            .change_context(AppError::Config)
            .attach_with(|| format!("data_dir: {}", config.general.data_dir))?;
        Some(Arc::new(JsonlArchive::new(config.general.data_dir.clone())))
    } else {
        None
    };

    let sink = Box::new(TerminalSink::new(vec!["console".into()]));
    let orchestrator = Arc::new(Orchestrator::new(&config, sink, archive));
    let config = Arc::new(config);

    let shutdown = CancellationToken::new();
    let run_shutdown = shutdown.clone();
    let run_config = config.clone();
    let run_orchestrator = orchestrator.clone();
    let run_handle = tokio::spawn(async move {
        orchestrator::run(run_config, run_orchestrator, run_shutdown).await;
    });

    tokio::signal::ctrl_c().await.change_context(AppError::Runtime)?;
    info!("ctrl+c received, shutting down");
    shutdown.cancel();

    run_handle.await.change_context(AppError::Runtime)?;

    info!("shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::new(&config.general.log_level);
    match config.general.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}
