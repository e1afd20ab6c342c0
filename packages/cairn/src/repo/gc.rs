//! `gc`: sweep objects no lockfile can reach.

use color_eyre::Result;
use futures::TryStreamExt as _;
use tracing::{debug, instrument};

use crate::{index::Index, repo::Repo};

/// What a collection removed.
#[derive(Clone, Debug, Default)]
pub struct GcReport {
    pub removed: usize,
    pub kept: usize,
}

impl Repo {
    /// Remove every object in the store that no lock record reaches.
    ///
    /// The live set is every dep and out hash in every lockfile and
    /// tracking file, plus the members of every reachable tree. Objects
    /// are only ever removed here; nothing else deletes from the store.
    #[instrument(name = "Repo::gc", skip(self))]
    pub async fn gc(&self) -> Result<GcReport> {
        let index = Index::load(self.root(), self.ignore()).await?;
        let live = index.used_objs(self.odb()).await?;

        let all: Vec<_> = self.odb().list().try_collect().await?;
        let mut report = GcReport::default();
        for hash in all {
            if live.contains(&hash) {
                report.kept += 1;
                continue;
            }
            debug!(%hash, "collecting unreachable object");
            self.odb().remove(&hash).await?;
            report.removed += 1;
        }
        Ok(report)
    }
}
