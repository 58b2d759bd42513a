#[macro_use]
extern crate prettytable;
use clap::Parser;
use commands::{handle_download, handle_summarize, Commands, DownloadArgs};
use coop_core::inventory::DEFAULT_ENDPOINT;
use dotenv::dotenv;
use indicatif::MultiProgress;
use progress::LogWriter;
use std::process;
use tracing_subscriber::EnvFilter;

pub mod commands;
pub mod progress;

/// Download public data repositories from Source Cooperative.
#[derive(Parser)]
#[command(name = "coop", version, subcommand_required = true)]
struct Coop {
    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    commands: Commands,
}

fn main() {
    dotenv().ok();

    let coop = Coop::parse();
    let bars = MultiProgress::new();
    init_logging(coop.verbose, bars.clone());

    let endpoint =
        dotenv::var("COOP_S3_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());

    let result = match coop.commands {
        Commands::Summarize {
            repository,
            file_type,
        } => handle_summarize(&endpoint, repository, file_type),
        Commands::Download {
            repository,
            file_type,
            output_dir,
            threads,
            multipart,
            quiet,
        } => handle_download(
            &endpoint,
            DownloadArgs {
                repository,
                file_type,
                output_dir,
                threads,
                multipart,
                quiet,
            },
            bars,
        ),
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        process::exit(1);
    }
}

/// `RUST_LOG` wins over `-v`.
fn init_logging(verbose: bool, bars: MultiProgress) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(LogWriter::new(bars))
        .init();
}
