//! `checkout`: make the workspace match the lockfiles.

use color_eyre::Result;
use derive_more::{Display, Error};
use tracing::{debug, instrument, trace};

use crate::{
    index::Index,
    odb::{build, tree::Tree},
    path::JoinWith as _,
    repo::Repo,
};

/// Objects required by the lockfiles are in neither the workspace nor the
/// local store.
#[derive(Clone, Debug, Display, Error)]
#[display("checkout failed: {} object(s) missing from the local store", missing.len())]
pub struct CheckoutError {
    /// The missing hashes, rendered.
    pub missing: Vec<String>,
}

/// What a checkout did.
#[derive(Clone, Debug, Default)]
pub struct CheckoutReport {
    /// Paths materialized from the store.
    pub restored: Vec<String>,
    /// Paths already matching their lock record.
    pub unchanged: Vec<String>,
    /// Paths whose objects were missing (only populated with
    /// `allow_missing`).
    pub missing: Vec<String>,
}

impl Repo {
    /// Reconcile the workspace with the committed lock records.
    ///
    /// For every locked output: if the workspace copy already hashes to
    /// the record, leave it; otherwise link it out of the store. Paths
    /// whose objects are absent fail the call with [`CheckoutError`]
    /// unless `allow_missing` is set.
    #[instrument(name = "Repo::checkout", skip(self))]
    pub async fn checkout(
        &self,
        targets: &[String],
        allow_missing: bool,
    ) -> Result<CheckoutReport> {
        let index = Index::load(self.root(), self.ignore()).await?;
        let graph = index.graph()?;
        let plan = graph.plan_for(targets)?;

        let mut report = CheckoutReport::default();
        let mut missing_hashes = Vec::new();

        for stage in plan {
            let Some(lock) = index.lock_for(stage) else {
                trace!(stage = %stage.addr, "no lock record, nothing to check out");
                continue;
            };
            for out in &stage.outs {
                if !out.cache {
                    continue;
                }
                let Some(entry) = lock.outs.iter().find(|e| e.path == out.path) else {
                    continue;
                };
                let abs = self.root().join(&out.path);
                let posix = out.path.to_posix();

                // Fast path: the workspace already holds the recorded
                // content.
                if crate::fs::exists(abs.as_std_path()).await {
                    let built = build::build(self.state(), self.ignore(), &abs).await?;
                    if built.hash == entry.md5 {
                        report.unchanged.push(posix);
                        continue;
                    }
                }

                if !self.holds_object(&entry.md5).await? {
                    debug!(path = %posix, hash = %entry.md5, "object missing");
                    missing_hashes.push(entry.md5.to_string());
                    report.missing.push(posix);
                    continue;
                }

                self.linker()
                    .materialize(self.odb(), &entry.md5, &abs)
                    .await?;
                self.scm().ignore(&abs)?;
                report.restored.push(posix);
            }
        }

        if !missing_hashes.is_empty() && !allow_missing {
            return Err(CheckoutError {
                missing: missing_hashes,
            }
            .into());
        }
        Ok(report)
    }

    /// Whether the store holds the object, and, for trees, every member.
    pub(crate) async fn holds_object(&self, hash: &crate::hash::HashValue) -> Result<bool> {
        if !self.odb().exists(hash).await? {
            return Ok(false);
        }
        if hash.is_tree() {
            let tree = Tree::parse(&self.odb().must_get(hash).await?)?;
            for entry in tree.entries() {
                if !self.odb().exists(&entry.hash).await? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }
}
