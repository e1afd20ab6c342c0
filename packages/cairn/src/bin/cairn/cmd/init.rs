use clap::Args;
use color_eyre::Result;

use cairn::{path::AbsDirPath, repo::Repo};

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Reinitialize even if the repository already exists
    #[arg(long)]
    force: bool,
}

pub async fn exec(opts: Options) -> Result<()> {
    let root = AbsDirPath::current()?;
    let repo = Repo::init(&root, opts.force).await?;
    println!("initialized cairn repository at {}", repo.root());
    Ok(())
}
