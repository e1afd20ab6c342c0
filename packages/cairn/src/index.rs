//! The workspace index: every stage the repo tracks, in one view.
//!
//! The index discovers pipeline files (`cairn.yaml`) and tracking files
//! (`*.cairn`) under the repo root, skipping ignored directories and
//! subrepositories (any subdirectory with its own `.cairn/`). It loads them
//! and answers the aggregate questions: which stages exist, what do they
//! produce, and which objects are reachable from their lock records.
//! Status, checkout, transfer, and gc all start here.

use std::collections::BTreeSet;

use color_eyre::Result;
use tracing::{instrument, trace};

use crate::{
    hash::HashValue,
    ignorefile::{IGNORE_FILE, IgnoreRules},
    odb::{Odb, tree::Tree},
    path::{AbsDirPath, AbsFilePath, RelFilePath, RelativeTo as _},
    pipeline::{
        graph::StageGraph,
        loader::{self, LoadedFile},
        schema::{PIPELINE_FILE, TRACKFILE_SUFFIX},
        stage::Stage,
    },
    repo::REPO_DIR,
};

/// The loaded view of everything tracked under one repo root.
#[derive(Clone, Debug, Default)]
pub struct Index {
    pub files: Vec<LoadedFile>,
}

impl Index {
    /// Discover and load every pipeline and tracking file under `root`.
    #[instrument(name = "Index::load", skip(ignore))]
    pub async fn load(root: &AbsDirPath, ignore: &IgnoreRules) -> Result<Self> {
        let mut sources = Vec::new();
        collect_sources(root, root, ignore, &mut sources)?;
        sources.sort();

        let mut files = Vec::new();
        for source in sources {
            let rel = source.relative_to(root)?;
            let loaded = if rel.file_name().is_some_and(|n| n == PIPELINE_FILE) {
                loader::load_pipeline_file(root, &rel).await?
            } else {
                loader::load_track_file(root, &rel).await?
            };
            trace!(file = %rel.to_posix(), stages = loaded.stages.len(), "indexed");
            files.push(loaded);
        }

        Ok(Self { files })
    }

    /// All stages across all files.
    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.files.iter().flat_map(|file| file.stages.iter())
    }

    /// The validated graph over every stage in the index.
    pub fn graph(&self) -> Result<StageGraph> {
        StageGraph::build(self.stages().cloned().collect())
    }

    /// The lock record for a stage, if one was committed.
    pub fn lock_for(&self, stage: &Stage) -> Option<&crate::pipeline::lockfile::StageLock> {
        self.files
            .iter()
            .find(|file| file.file == *stage.addr.file())
            .and_then(|file| file.locks.get(&stage.addr.name()))
    }

    /// Object hashes of committed *outputs*, the units transfers move.
    ///
    /// `pushable_only` restricts to outputs whose stage declares them
    /// cached and pushable.
    pub fn out_objs(&self, pushable_only: bool) -> BTreeSet<HashValue> {
        let mut objs = BTreeSet::new();
        for file in &self.files {
            for stage in &file.stages {
                let Some(lock) = file.locks.get(&stage.addr.name()) else {
                    continue;
                };
                for out in &stage.outs {
                    if !out.cache {
                        continue;
                    }
                    if pushable_only && !out.push {
                        continue;
                    }
                    if let Some(entry) = lock.outs.iter().find(|e| e.path == out.path) {
                        objs.insert(entry.md5.clone());
                    }
                }
            }
        }
        objs
    }

    /// Every object reachable from any lock record: deps, outs, and, for
    /// tree objects present in the store, their member blobs. This is the
    /// live set for garbage collection.
    pub async fn used_objs(&self, odb: &Odb) -> Result<BTreeSet<HashValue>> {
        let mut objs = BTreeSet::new();
        for file in &self.files {
            for lock in file.locks.values() {
                for entry in lock.deps.iter().chain(lock.outs.iter()) {
                    objs.insert(entry.md5.clone());
                }
            }
        }

        let trees: Vec<HashValue> = objs.iter().filter(|h| h.is_tree()).cloned().collect();
        for tree_hash in trees {
            if let Some(bytes) = odb.get(&tree_hash).await? {
                let tree = Tree::parse(&bytes)?;
                for entry in tree.entries() {
                    objs.insert(entry.hash.clone());
                }
            }
        }
        Ok(objs)
    }
}

/// Recursively collect pipeline and tracking files, pruning ignored
/// directories and subrepositories.
#[allow(
    clippy::disallowed_methods,
    reason = "discovery is a synchronous pre-pass like the ignore walk"
)]
fn collect_sources(
    root: &AbsDirPath,
    dir: &AbsDirPath,
    ignore: &IgnoreRules,
    out: &mut Vec<AbsFilePath>,
) -> Result<()> {
    use color_eyre::eyre::Context as _;

    let entries = std::fs::read_dir(dir.as_std_path())
        .with_context(|| format!("read directory {dir:?}"))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {dir:?}"))?;
        let file_type = entry.file_type().context("entry file type")?;
        let name = entry.file_name();

        if file_type.is_dir() {
            if name == REPO_DIR || name == ".git" {
                continue;
            }
            let sub = AbsDirPath::try_from(entry.path())?;
            // A nested `.cairn` marks a subrepository boundary; its stages
            // belong to it, not to us.
            if sub.as_std_path().join(REPO_DIR).is_dir() {
                trace!(?sub, "skipping subrepository");
                continue;
            }
            if !ignore.is_ignored_dir(&sub) {
                collect_sources(root, &sub, ignore, out)?;
            }
        } else if file_type.is_file() {
            let name = name.to_string_lossy();
            let is_pipeline = name == PIPELINE_FILE;
            let is_track = name.len() > TRACKFILE_SUFFIX.len() && name.ends_with(TRACKFILE_SUFFIX);
            if !is_pipeline && !is_track {
                continue;
            }
            if name.as_ref() == IGNORE_FILE {
                continue;
            }
            let file = AbsFilePath::try_from(entry.path())?;
            if !ignore.is_ignored_file(&file) {
                out.push(file);
            }
        }
    }
    Ok(())
}

/// Convenience: the repo-relative paths of every indexed source file.
impl Index {
    pub fn source_files(&self) -> Vec<RelFilePath> {
        self.files.iter().map(|f| f.file.clone()).collect()
    }
}
