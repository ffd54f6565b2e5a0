mod bind;
mod buildah;
mod cmd_build;
mod config;
mod graph;
mod oci;
mod output;
mod work;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "buildalot")]
#[command(about = "Builds families of related container images in dependency order")]
struct Cli {
    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(flatten)]
    build: cmd_build::BuildArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "starting buildalot");

    // Builds can run for a long time; make sure Ctrl-C interrupts promptly
    // even while buildah subprocesses are in flight.
    ctrlc::set_handler(|| std::process::exit(130)).context("setting up signal handler")?;

    cmd_build::run(&cli.build)
}

fn init_tracing(verbose: u8) {
    let format = fmt::format().without_time().with_target(false).compact();

    // CLI -v flags take precedence, then RUST_LOG, then default to info
    let env_filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("buildalot=info")),
        1 => EnvFilter::new("buildalot=debug"),
        _ => EnvFilter::new("buildalot=trace"),
    };

    tracing_subscriber::fmt()
        .event_format(format)
        .with_writer(std::io::stderr)
        .with_env_filter(env_filter)
        .init();
}
