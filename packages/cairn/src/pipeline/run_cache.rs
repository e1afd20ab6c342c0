//! The run cache: what a computation produced, keyed by what went in.
//!
//! The key is the run-hash: MD5 over the canonical JSON of the command (in
//! list form) and the sorted `(path, hash)` pairs of every dependency,
//! parameter values included. The value is a small manifest recording the
//! outputs with their hashes. Together with the object database this gives
//! result reuse across branches, workspaces, and machines: same inputs,
//! same command means the outputs are linked back out instead of recomputed.
//!
//! Entries live in a parallel fan-out tree under `runs/`, next to the
//! object store's `files/`. They contain only hashes and paths, never
//! content, so shipping them to a remote is always safe.

use std::collections::BTreeMap;

use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tracing::{instrument, trace};

use crate::{
    fs,
    hash::HashValue,
    path::{AbsDirPath, AbsFilePath, TryJoinWith as _},
    pipeline::lockfile::LockedEntry,
};

/// The record of one successful run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    /// Canonical command: the list form.
    pub cmd: Vec<String>,

    pub deps: Vec<LockedEntry>,

    /// Parameter values at run time: file → keypath → value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,

    pub outs: Vec<LockedEntry>,
}

/// The shape the run-hash is computed over. Deps are reduced to sorted
/// `(path, hash)` pairs so that metadata like sizes never shifts the key.
#[derive(Serialize)]
struct RunKey<'a> {
    cmd: &'a [String],
    deps: Vec<(String, &'a HashValue)>,
    params: &'a BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,
}

impl RunRecord {
    /// The run-hash of this record's inputs.
    pub fn run_hash(&self) -> Result<HashValue> {
        run_hash(&self.cmd, &self.deps, &self.params)
    }
}

/// Compute the run-hash for a command and its hashed dependencies.
pub fn run_hash(
    cmd: &[String],
    deps: &[LockedEntry],
    params: &BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,
) -> Result<HashValue> {
    let mut pairs: Vec<(String, &HashValue)> = deps
        .iter()
        .map(|entry| (entry.path.to_posix(), &entry.md5))
        .collect();
    pairs.sort();

    let key = RunKey {
        cmd,
        deps: pairs,
        params,
    };
    let bytes = serde_json::to_vec(&key).context("serialize run key")?;
    Ok(HashValue::of_bytes(&bytes))
}

/// The on-disk run cache.
#[derive(Clone, Debug, Display)]
#[display("{root}")]
pub struct RunCache {
    root: AbsDirPath,
}

impl RunCache {
    /// Open the run cache rooted at `root` (usually `<cache>/runs`).
    pub async fn open(root: &AbsDirPath) -> Result<Self> {
        fs::create_dir_all(root).await?;
        Ok(Self { root: root.clone() })
    }

    fn entry_path(&self, run_hash: &HashValue) -> Result<AbsFilePath> {
        let hex = run_hash.as_str();
        let (prefix, rest) = hex.split_at(2);
        self.root.try_join_dir(prefix)?.try_join_file(rest)
    }

    /// Record a successful run. Overwriting an identical key is harmless;
    /// the value is a pure function of the key for deterministic commands,
    /// and for nondeterministic ones any prior result is equally valid.
    #[instrument(name = "RunCache::save", skip_all)]
    pub async fn save(&self, record: &RunRecord) -> Result<()> {
        let run_hash = record.run_hash()?;
        let path = self.entry_path(&run_hash)?;
        let bytes = serde_json::to_vec(record).context("serialize run record")?;
        fs::write_atomic(&path, &bytes).await?;
        trace!(%run_hash, "saved run record");
        Ok(())
    }

    /// Look up a prior run by its run-hash.
    #[instrument(name = "RunCache::restore", skip(self))]
    pub async fn restore(&self, run_hash: &HashValue) -> Result<Option<RunRecord>> {
        let path = self.entry_path(run_hash)?;
        let Some(bytes) = fs::read_buffered(&path).await? else {
            return Ok(None);
        };
        let record: RunRecord =
            serde_json::from_slice(&bytes).context("parse run record")?;
        trace!(%run_hash, "run cache hit");
        Ok(Some(record))
    }

    /// Every run-hash currently recorded. Used by gc and by run-cache
    /// transfer.
    pub async fn list(&self) -> Result<Vec<(HashValue, RunRecord)>> {
        use futures::TryStreamExt as _;

        let root = self.root.clone();
        fs::walk_files(&self.root)
            .try_filter_map(|file| {
                let root = root.clone();
                async move {
                    use crate::path::RelativeTo as _;
                    let rel = file.relative_to(&root)?;
                    let components: Vec<_> = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    let [prefix, rest] = components.as_slice() else {
                        return Ok(None);
                    };
                    let hash = HashValue::new(crate::hash::HashAlgo::Md5, format!("{prefix}{rest}"));
                    let bytes = fs::must_read_buffered(&file).await?;
                    let record: RunRecord =
                        serde_json::from_slice(&bytes).context("parse run record")?;
                    Ok(Some((hash, record)))
                }
            })
            .try_collect()
            .await
    }
}
