//! Moving objects between the local store and a remote.
//!
//! Transfers are parallel with a configurable job count and retried per
//! object with bounded exponential backoff. A failing object never aborts
//! the batch: everything transferable is transferred, and the failures are
//! reported once at the end as an aggregate error. Tree objects are
//! expanded so that their member blobs travel with them.

use std::collections::BTreeSet;
use std::time::Duration;

use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use derive_more::{Display, Error};
use futures::StreamExt as _;
use tracing::{instrument, trace, warn};

use crate::{
    fs,
    hash::{self, HashValue},
    odb::{Odb, tree::Tree},
    progress::TransferBar,
    remote::{BlobStore, RemoteIndex},
};

/// Retries per object after the first attempt.
const RETRIES: u32 = 3;

/// Initial backoff delay; doubles per retry.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// One or more objects could not be downloaded.
#[derive(Copy, Clone, Debug, Display, Error)]
#[display("{count} object(s) failed to download")]
pub struct DownloadError {
    pub count: usize,
}

/// One or more objects could not be uploaded.
#[derive(Copy, Clone, Debug, Display, Error)]
#[display("{count} object(s) failed to upload")]
pub struct UploadError {
    pub count: usize,
}

/// Ensure every requested object (and, for trees, every member) is present
/// in the local store, downloading what is missing.
///
/// Returns the number of objects actually downloaded. Per-object failures
/// are collected; if any remain at the end the call fails with
/// [`DownloadError`] while keeping everything that did arrive.
#[instrument(name = "fetch", skip_all, fields(remote = store.name()))]
pub async fn fetch<S: BlobStore>(
    odb: &Odb,
    store: &S,
    index: &RemoteIndex,
    hashes: impl IntoIterator<Item = HashValue>,
    jobs: usize,
    progress: &TransferBar,
) -> Result<usize> {
    let mut seen = BTreeSet::new();
    let mut pending: Vec<HashValue> = hashes
        .into_iter()
        .filter(|h| seen.insert(h.clone()))
        .collect();

    let mut fetched = 0usize;
    let mut failed = 0usize;

    while !pending.is_empty() {
        let batch = std::mem::take(&mut pending);
        let results: Vec<(HashValue, Result<bool>)> = futures::stream::iter(batch)
            .map(|hash| async move {
                let result = fetch_one(odb, store, &hash).await;
                (hash, result)
            })
            .buffer_unordered(jobs.max(1))
            .collect()
            .await;

        for (hash, result) in results {
            match result {
                Ok(downloaded) => {
                    index.insert(&hash)?;
                    if downloaded {
                        fetched += 1;
                        progress.inc(1);
                    }
                    // A tree pulls its members along.
                    if hash.is_tree() {
                        let bytes = odb.must_get(&hash).await?;
                        let tree = Tree::parse(&bytes)?;
                        for entry in tree.entries() {
                            if seen.insert(entry.hash.clone()) {
                                progress.inc_length(1);
                                pending.push(entry.hash.clone());
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(%hash, ?err, "download failed");
                    failed += 1;
                }
            }
        }
    }

    if failed > 0 {
        return Err(DownloadError { count: failed }.into());
    }
    Ok(fetched)
}

/// Download a single object unless it is already local.
/// Returns whether a download happened.
async fn fetch_one<S: BlobStore>(odb: &Odb, store: &S, hash: &HashValue) -> Result<bool> {
    if odb.exists(hash).await? {
        return Ok(false);
    }

    let target = odb.object_path(hash)?;
    let temp = fs::temp_sibling(&target)?;

    let result = with_retries(|| store.get(hash, &temp)).await;
    if let Err(err) = result {
        fs::remove_file_if_exists(&temp).await.ok();
        return Err(err).with_context(|| format!("download {hash} from {}", store.name()));
    }

    // Verify on arrival: the object must hash to its own name.
    let arrived = hash::hash_file(&temp).await.context("verify download")?;
    if arrived.as_str() != hash.as_blob_str() {
        fs::remove_file_if_exists(&temp).await.ok();
        bail!("downloaded object {hash} hashed to {arrived}");
    }

    odb.adopt_file(&temp, hash).await?;
    trace!(%hash, "fetched object");
    Ok(true)
}

/// Mirror of [`fetch`]: ensure every requested object (and tree members) is
/// present on the remote, uploading what is missing.
///
/// The remote index short-circuits objects already known to be present;
/// confirmed transfers and confirmed presences update it.
#[instrument(name = "push", skip_all, fields(remote = store.name()))]
pub async fn push<S: BlobStore>(
    odb: &Odb,
    store: &S,
    index: &RemoteIndex,
    hashes: impl IntoIterator<Item = HashValue>,
    jobs: usize,
    progress: &TransferBar,
) -> Result<usize> {
    // Expand trees up front; members are in the local store by the time
    // anything is pushed.
    let mut seen = BTreeSet::new();
    let mut expanded = Vec::new();
    let mut failed = 0usize;
    for hash in hashes {
        if !seen.insert(hash.clone()) {
            continue;
        }
        if hash.is_tree() {
            match odb.get(&hash).await? {
                Some(bytes) => {
                    let tree = Tree::parse(&bytes)?;
                    for entry in tree.entries() {
                        if seen.insert(entry.hash.clone()) {
                            progress.inc_length(1);
                            expanded.push(entry.hash.clone());
                        }
                    }
                }
                None => {
                    warn!(%hash, "tree object not in local store");
                    failed += 1;
                    continue;
                }
            }
        }
        expanded.push(hash);
    }

    let results: Vec<(HashValue, Result<bool>)> = futures::stream::iter(expanded)
        .map(|hash| async move {
            let result = push_one(odb, store, index, &hash).await;
            (hash, result)
        })
        .buffer_unordered(jobs.max(1))
        .collect()
        .await;

    let mut pushed = 0usize;
    for (hash, result) in results {
        match result {
            Ok(uploaded) => {
                index.insert(&hash)?;
                if uploaded {
                    pushed += 1;
                    progress.inc(1);
                }
            }
            Err(err) => {
                warn!(%hash, ?err, "upload failed");
                failed += 1;
            }
        }
    }

    if failed > 0 {
        return Err(UploadError { count: failed }.into());
    }
    Ok(pushed)
}

/// Upload a single object unless the remote already has it.
/// Returns whether an upload happened.
async fn push_one<S: BlobStore>(
    odb: &Odb,
    store: &S,
    index: &RemoteIndex,
    hash: &HashValue,
) -> Result<bool> {
    if index.contains(hash)? {
        return Ok(false);
    }
    if store.exists(hash).await? {
        return Ok(false);
    }

    let src = odb.object_path(hash)?;
    if !odb.exists(hash).await? {
        return Err(eyre!("object {hash} not in local store"));
    }

    with_retries(|| store.put(hash, &src))
        .await
        .with_context(|| format!("upload {hash} to {}", store.name()))?;
    trace!(%hash, "pushed object");
    Ok(true)
}

/// Run `op` with bounded exponential backoff.
async fn with_retries<F, Fut>(mut op: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < RETRIES => {
                warn!(?err, attempt, "transfer attempt failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
