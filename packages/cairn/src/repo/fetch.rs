//! `fetch`: local store ← remote.

use color_eyre::{Result, eyre::eyre};
use tracing::instrument;

use crate::{index::Index, progress::TransferBar, repo::Repo, transfer};

impl Repo {
    /// Download every object the lockfiles reference that is absent from
    /// the local store. Returns the number of objects downloaded.
    #[instrument(name = "Repo::fetch", skip(self))]
    pub async fn fetch(&self, remote_name: Option<&str>) -> Result<usize> {
        let remote = self
            .remote(remote_name)?
            .ok_or_else(|| eyre!("no remote configured; set `core.remote` or pass --remote"))?;

        let index = Index::load(self.root(), self.ignore()).await?;
        let wanted = index.out_objs(false);

        let bar = TransferBar::new(wanted.len() as u64, "fetching");
        transfer::fetch(
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
