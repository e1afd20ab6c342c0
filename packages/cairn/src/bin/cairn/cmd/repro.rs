use clap::Args;
use color_eyre::Result;

use cairn::repo::Repo;

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Stages to reproduce (with their upstreams); all stages when empty
    targets: Vec<String>,

    /// Rerun stages even if they are up to date
    #[arg(short, long)]
    force: bool,

    /// Do not reuse results from the run cache
    #[arg(long)]
    no_run_cache: bool,
}

pub async fn exec(opts: Options) -> Result<()> {
    let repo = Repo::discover().await?;
    let report = repo
        .reproduce(&opts.targets, opts.force, !opts.no_run_cache)
        .await?;

    for stage in &report.restored {
        println!("restored {stage} from run cache");
    }
    for stage in &report.ran {
        println!("ran {stage}");
    }
    if report.ran.is_empty() && report.restored.is_empty() {
        println!("everything is up to date");
    }
    Ok(())
}
