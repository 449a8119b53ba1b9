use anyhow::Result;
use clap::Parser;

mod cli;

use cli::{Cli, Commands};
use display_sentinel::config::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Initialize logging: RUST_LOG wins, then -v, then the config file
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        Config::load()
            .map(|config| config.logging.level)
            .unwrap_or_else(|_| "info".to_string())
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Monitor(args) => cli::monitor::run(args).await,
        Commands::Identities(args) => cli::identities::run(args).await,
        Commands::Audit(args) => cli::audit::run(args).await,
        Commands::Access(args) => cli::access::run(args).await,
        Commands::Config(args) => cli::config::run(args).await,
        Commands::Paths => cli::paths::run(),
    }
}
