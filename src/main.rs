//! aimad daemon entry point
//!
//! Parses flags, loads the configuration snapshot, and hands control to the
//! daemon. Exit code 0 is a clean SIGTERM shutdown; 2 is a configuration
//! error; 1 is any other fatal startup failure.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use aimad::config::Config;
use aimad::error::OrchestratorError;

const EXIT_CONFIG: u8 = 2;
const EXIT_FATAL: u8 = 1;

#[derive(Parser)]
#[command(name = "aimad")]
#[command(
    about = "GPU job orchestration daemon for the AIMA media analysis platform",
    long_about = "aimad accepts analysis job submissions over HTTP, schedules them onto GPU\n\
                  capacity drawn from RunPod, Vast.ai, AWS, GCP, Azure, or a local pool,\n\
                  dispatches work to worker containers, and accounts for every rented minute.\n\n\
                  Configuration is TOML; run with --config or place aimad.toml in the\n\
                  working directory."
)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "AIMAD_CONFIG")]
    config: Option<PathBuf>,

    /// Override the API listen address
    #[arg(long, env = "AIMAD_LISTEN")]
    listen: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn load_config(cli: &Cli) -> Result<Config, OrchestratorError> {
    let mut config = match &cli.config {
        Some(path) => Config::load(Some(path))?,
        None => {
            let default_path = PathBuf::from("aimad.toml");
            if default_path.exists() {
                Config::load(Some(&default_path))?
            } else {
                Config::default()
            }
        }
    };
    if let Some(listen) = &cli.listen {
        config.server.listen_addr = listen.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    if cli.json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match aimad::daemon::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ OrchestratorError::Config(_)) => {
            eprintln!("configuration error: {e}");
            ExitCode::from(EXIT_CONFIG)
        }
        Err(e) => {
            eprintln!("fatal: {e:#}", e = anyhow::Error::from(e));
            ExitCode::from(EXIT_FATAL)
        }
    }
}
