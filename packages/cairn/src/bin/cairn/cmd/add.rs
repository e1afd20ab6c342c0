use clap::Args;
use color_eyre::{Result, eyre::Context as _};

use cairn::{
    path::{AbsDirPath, RelativeTo as _, TryJoinWith as _},
    repo::Repo,
};

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Files or directories to track
    #[arg(required = true)]
    targets: Vec<String>,
}

pub async fn exec(opts: Options) -> Result<()> {
    let repo = Repo::discover().await?;
    let cwd = AbsDirPath::current()?;

    for target in &opts.targets {
        // Targets are given relative to the invocation directory; the
        // repo wants them relative to its root.
        let abs = cwd.try_join_dir(target)?.as_entry();
        let rel = abs
            .relative_to(repo.root())
            .with_context(|| format!("'{target}' is outside the repository"))?;
        let track = repo.add(&rel).await?;
        println!("added {} ({})", rel.to_posix(), track.to_posix());
    }
    Ok(())
}
