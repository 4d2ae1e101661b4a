use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use bigbro::config::IngestMode;

mod commands;

#[derive(Parser)]
#[command(name = "bigbro")]
#[command(about = "Letter intake with quota-limited admission control")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the letter intake service
    Run {
        /// Config file (defaults to $BIGBRO_CONFIG or ./bigbro.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the configured ingest mode
        #[arg(long, value_enum)]
        mode: Option<IngestMode>,

        /// Override the initial pull quota
        #[arg(long)]
        quota: Option<u64>,

        /// Override the worker pool capacity
        #[arg(long)]
        capacity: Option<usize>,

        /// Override the HTTP listen port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Write a config file with default settings
    InitConfig {
        /// Destination (defaults to $BIGBRO_CONFIG or ./bigbro.toml)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    bigbro::log_format::init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            mode,
            quota,
            capacity,
            port,
        } => {
            let overrides = commands::run::RunOverrides {
                mode,
                quota,
                capacity,
                port,
            };
            commands::handle_run(config, overrides).await
        }
        Commands::InitConfig { path, force } => commands::handle_init_config(path, force),
    }
}
