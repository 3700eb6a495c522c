pub mod commands;

use clap::builder::BoolishValueParser;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tapscope")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Cluster-wide network traffic observability for Kubernetes", long_about = None)]
pub struct Cli {
    #[arg(
        short,
        long,
        global = true,
        env = "TAPSCOPE_DEBUG",
        value_parser = BoolishValueParser::new(),
        help = "Enable verbose logging"
    )]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Path to the hub configuration file")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Capture and aggregate in one process")]
    Standalone,
    #[command(about = "Aggregate entries delivered by tapper agents")]
    Hub {
        #[arg(short, long, help = "Also manage the tapper fleet in the cluster")]
        daemon: bool,
    },
    #[command(about = "Aggregate entries recorded to files")]
    Replay {
        #[arg(short, long, help = "Directory of recorded entry files")]
        dir: PathBuf,
    },
}
