use clap::Args;
use color_eyre::Result;

use cairn::repo::Repo;

#[derive(Clone, Debug, Args)]
pub struct Options {
    /// Stages to check; all stages when empty
    targets: Vec<String>,
}

pub async fn exec(opts: Options) -> Result<()> {
    let repo = Repo::discover().await?;
    let report = repo.status(&opts.targets).await?;

    if report.is_empty() {
        println!("pipeline is up to date");
        return Ok(());
    }

    for (stage, status) in &report {
        println!("{stage}:");
        if status.missing_lock {
            println!("  never run");
        }
        if status.always_changed {
            println!("  always changed");
        }
        if status.changed_cmd {
            println!("  changed command");
        }
        for (path, kind) in &status.changed_deps {
            println!("  changed dep: {path} ({kind})");
        }
        for (path, kind) in &status.changed_outs {
            println!("  changed out: {path} ({kind})");
        }
    }
    Ok(())
}
