use clap::Args;
use color_eyre::Result;

use cairn::repo::Repo;

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Remote to fetch from; the configured default when omitted
    #[arg(long)]
    remote: Option<String>,
}

pub async fn exec(opts: Options) -> Result<()> {
    let repo = Repo::discover().await?;
    let fetched = repo.fetch(opts.remote.as_deref()).await?;
    println!("fetched {fetched} object(s)");
    Ok(())
}
