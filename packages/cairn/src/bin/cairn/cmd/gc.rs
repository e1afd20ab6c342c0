use clap::Args;
use color_eyre::Result;

use cairn::repo::Repo;

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Actually delete; without this flag only report what would go
    #[arg(long)]
    force: bool,
}

pub async fn exec(opts: Options) -> Result<()> {
    let repo = Repo::discover().await?;

    if !opts.force {
        println!("gc removes objects permanently; rerun with --force to proceed");
        return Ok(());
    }

    let report = repo.gc().await?;
    println!("removed {} object(s), kept {}", report.removed, report.kept);
    Ok(())
}
