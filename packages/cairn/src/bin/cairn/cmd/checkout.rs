use clap::Args;
use color_eyre::Result;

use cairn::repo::Repo;

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Stages to check out; all stages when empty
    targets: Vec<String>,

    /// Report missing objects instead of failing
    #[arg(long)]
    allow_missing: bool,
}

pub async fn exec(opts: Options) -> Result<()> {
    let repo = Repo::discover().await?;
    let report = repo.checkout(&opts.targets, opts.allow_missing).await?;

    for path in &report.restored {
        println!("restored {path}");
    }
    for path in &report.missing {
        println!("missing  {path}");
    }
    if report.restored.is_empty() && report.missing.is_empty() {
        println!("workspace matches the lockfiles");
    }
    Ok(())
}
