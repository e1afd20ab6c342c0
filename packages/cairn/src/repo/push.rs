//! `push`: remote ← local store.

use color_eyre::{Result, eyre::eyre};
use tracing::instrument;

use crate::{index::Index, progress::TransferBar, repo::Repo, transfer};

impl Repo {
    /// Upload every pushable committed output absent from the remote.
    /// Returns the number of objects uploaded.
    #[instrument(name = "Repo::push", skip(self))]
    pub async fn push(&self, remote_name: Option<&str>) -> Result<usize> {
        let remote = self
            .remote(remote_name)?
            .ok_or_else(|| eyre!("no remote configured; set `core.remote` or pass --remote"))?;

        let index = Index::load(self.root(), self.ignore()).await?;
        let wanted = index.out_objs(true);

        let bar = TransferBar::new(wanted.len() as u64, "pushing");
        transfer::push(
            self.odb(),
            &remote.store,
            &remote.index,
            wanted,
            self.config().jobs(),
            &bar,
        )
        .await
    }
}
