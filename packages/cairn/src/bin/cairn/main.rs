//! The binary entrypoint for `cairn`, the data pipeline engine.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, crate_version};
use color_eyre::{Result, eyre::Context as _};
use tracing_subscriber::util::SubscriberInitExt as _;

// Since this is a binary crate, these modules aren't pub so that dead code
// warnings stay accurate. Nothing in this file should be `pub`.
mod cmd;
mod log;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "cairn",
    about = "Reproducible data pipelines with a content-addressed artifact store",
    version = crate_version!(),
)]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    /// Emit flamegraph profiling data
    #[arg(short, long, hide(true))]
    profile: Option<PathBuf>,

    /// When to colorize output
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Initialize a cairn repository in the current directory
    Init(cmd::init::Options),

    /// Track files or directories in the artifact store
    Add(cmd::add::Options),

    /// Run the stages that are out of date
    Repro(cmd::repro::Options),

    /// Report which stages would rerun, and why
    Status(cmd::status::Options),

    /// Materialize committed outputs into the workspace
    Checkout(cmd::checkout::Options),

    /// Download referenced objects from a remote
    Fetch(cmd::fetch::Options),

    /// Upload committed outputs to a remote
    Push(cmd::push::Options),

    /// Remove objects unreachable from any lockfile
    Gc(cmd::gc::Options),
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    color_eyre::install()?;
    let top = TopLevelFlags::parse();

    let (logger, flame_guard) = log::make_logger(std::io::stderr, top.profile.clone(), top.color)?;
    logger.init();

    let result = match top.command {
        Command::Init(opts) => cmd::init::exec(opts).await,
        Command::Add(opts) => cmd::add::exec(opts).await,
        Command::Repro(opts) => cmd::repro::exec(opts).await,
        Command::Status(opts) => cmd::status::exec(opts).await,
        Command::Checkout(opts) => cmd::checkout::exec(opts).await,
        Command::Fetch(opts) => cmd::fetch::exec(opts).await,
        Command::Push(opts) => cmd::push::exec(opts).await,
        Command::Gc(opts) => cmd::gc::exec(opts).await,
    };

    if let Some(flame_guard) = flame_guard {
        flame_guard.flush().context("flush flame guard")?;
    }

    result
}
