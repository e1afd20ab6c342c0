//! `add`: track a workspace file or directory without a pipeline.

use color_eyre::{
    Result,
    eyre::{Context as _, bail},
};
use tracing::{debug, instrument};

use crate::{
    fs,
    odb::build,
    path::{JoinWith as _, RelEntryPath, RelFilePath},
    pipeline::{
        lockfile::{LockedEntry, TrackFileDoc},
        out::{OutKind, Output},
        schema::TRACKFILE_SUFFIX,
        stage::{Stage, StageAddr},
    },
    repo::Repo,
};

impl Repo {
    /// Track `target`, writing `<target>.cairn` beside it.
    ///
    /// Hashes the entry (file or directory), ingests it into the object
    /// database, records the result in a single-stage tracking file, and
    /// asks the SCM to ignore the workspace copy. Returns the tracking
    /// file's repo-relative path.
    #[instrument(name = "Repo::add", skip(self))]
    pub async fn add(&self, target: &RelEntryPath) -> Result<RelFilePath> {
        let abs = self.root().join(target);
        if !fs::exists(abs.as_std_path()).await {
            bail!("cannot add '{}': it does not exist", target.to_posix());
        }

        let built = build::build(self.state(), self.ignore(), &abs)
            .await
            .with_context(|| format!("hash '{}'", target.to_posix()))?;
        build::ingest(self.odb(), &built, &abs).await?;

        let out_entry = LockedEntry::new(target.clone(), built.hash, &built.meta);

        let track_rel = RelFilePath::try_from(format!("{}{TRACKFILE_SUFFIX}", target.to_posix()))?;
        let stage = Stage {
            addr: StageAddr::TrackFile {
                file: track_rel.clone(),
            },
            wdir: track_rel
                .parent()
                .unwrap_or_else(|| crate::mk_rel_dir!(".")),
            cmd: Vec::new(),
            deps: Vec::new(),
            outs: vec![Output::new(target.clone(), OutKind::Out)],
            frozen: false,
            always_changed: false,
        };

        let doc = TrackFileDoc {
            cmd: None,
            wdir: None,
            md5: Some(stage.content_hash()?),
            deps: Vec::new(),
            outs: vec![out_entry],
            frozen: false,
            always_changed: false,
        };
        doc.save(&self.root().join(&track_rel)).await?;

        self.scm().ignore(&abs)?;
        debug!(target = %target.to_posix(), track = %track_rel.to_posix(), "added");
        Ok(track_rel)
    }
}
