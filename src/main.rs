use clap::Parser;
use std::process;
use tapscope::cli::{commands, Cli};
use tapscope::config::HubConfig;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // also installs the log bridge, so agent library records show up here
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .init();

    info!("Starting tapscope v{}", env!("CARGO_PKG_VERSION"));

    let Some(command) = cli.command else {
        eprintln!("No command specified. Use --help for usage information.");
        process::exit(1);
    };

    let config = match HubConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = commands::handle_command(command, config).await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
