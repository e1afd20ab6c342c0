//! `status`: what would rerun, and why.

use std::collections::BTreeMap;

use color_eyre::Result;
use tracing::instrument;

use crate::{
    index::Index,
    pipeline::status::{StageStatus, WorkspaceCtx, stage_status},
    repo::Repo,
};

impl Repo {
    /// Per-stage status for everything in (or upstream of) `targets`.
    ///
    /// Up-to-date stages are omitted; an empty map means a clean pipeline.
    #[instrument(name = "Repo::status", skip(self))]
    pub async fn status(&self, targets: &[String]) -> Result<BTreeMap<String, StageStatus>> {
        let index = Index::load(self.root(), self.ignore()).await?;
        let graph = index.graph()?;
        let plan = graph.plan_for(targets)?;

        let ctx = WorkspaceCtx {
            root: self.root(),
            state: self.state(),
            ignore: self.ignore(),
        };

        let mut report = BTreeMap::new();
        for stage in plan {
            let lock = index.lock_for(stage);
            let status = stage_status(ctx, stage, lock).await?;
            if !status.up_to_date() {
                report.insert(stage.addr.to_string(), status);
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use crate::fs;
    use crate::path::{AbsDirPath, RelEntryPath, TryJoinWith as _};
    use crate::repo::Repo;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[tokio::test]
    async fn tracked_file_status_reflects_workspace_edits() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        let foo = root.try_join_file("foo").unwrap();
        fs::write(&foo, b"foo").await.unwrap();

        let repo = Repo::init(&root, false).await.unwrap();
        repo.add(&RelEntryPath::try_from("foo").unwrap())
            .await
            .unwrap();

        // Clean after add.
        let report = repo.status(&[]).await.unwrap();
        assert!(report.is_empty(), "report: {report:?}");

        // Editing the workspace copy shows up as a modified out.
        fs::write(&foo, b"changed").await.unwrap();
        let report = repo.status(&[]).await.unwrap();
        pretty_assert_eq!(report.len(), 1);
        let status = report.values().next().unwrap();
        pretty_assert_eq!(status.changed_outs.len(), 1);
    }
}
