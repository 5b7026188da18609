use anyhow::Result;
use clap::{Parser, Subcommand};
use container_manager::{config::Config, server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the API server. Configured from the environment unless a file is given.
    Serve {
        /// Path to a YAML config file.
        #[arg(short)]
        file: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { file } => {
            let config = match file {
                Some(file) => Config::from_file(file).await?,
                None => Config::from_env()?,
            };

            info!(?config, "starting container manager");

            server::serve(config).await
        }
    }
}
