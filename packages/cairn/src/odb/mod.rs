//! The content-addressed object database.
//!
//! Objects live under the root at `files/<algo>/<ab>/<remaining>` where
//! `<ab>` is the first two hex characters of the digest; the fan-out keeps
//! directory sizes bounded. Tree objects keep their `.dir` suffix in the
//! file name so the store itself distinguishes them.
//!
//! ## Immutability
//!
//! A hash corresponds to exactly one immutable byte sequence. Writes land in
//! a sibling temp file and are renamed into place, so partial objects are
//! never visible; concurrent writers of the same hash race on the rename and
//! either outcome is indistinguishable. After ingestion the write bit is
//! cleared so that hardlinked workspace copies cannot corrupt the store.

pub mod build;
mod meta;
pub mod tree;

pub use meta::Meta;

use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use futures::{Stream, StreamExt, TryStreamExt};
use tap::Pipe;
use tracing::{instrument, trace, warn};

use crate::{
    fs,
    hash::HashValue,
    path::{AbsDirPath, AbsFilePath, RelativeTo as _, TryJoinWith as _},
};

/// The content-addressed object store shared by every pipeline in a repo.
///
/// The store is deliberately "stupid": it holds bytes keyed by their hash
/// and nothing else. Everything cairn knows about stages, paths, and runs
/// lives in files that merely *reference* these hashes.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[display("{root}")]
pub struct Odb {
    root: AbsDirPath,
}

impl Odb {
    /// Open an instance rooted at the provided directory.
    /// The directory is created if it does not already exist.
    #[instrument(name = "Odb::open")]
    pub async fn open(root: &AbsDirPath) -> Result<Self> {
        fs::create_dir_all(root).await?;
        trace!(?root, "open odb");
        Ok(Self { root: root.clone() })
    }

    /// The filesystem location of the object for `hash`.
    ///
    /// Callers may open the file directly but must never modify it.
    pub fn object_path(&self, hash: &HashValue) -> Result<AbsFilePath> {
        let hex = hash.as_str();
        let (prefix, rest) = hex.split_at(2);
        self.root
            .try_join_dir("files")?
            .try_join_dir(hash.algo().to_string())?
            .try_join_dir(prefix)?
            .try_join_file(rest)
    }

    /// Report whether the object is present.
    #[instrument(name = "Odb::exists")]
    pub async fn exists(&self, hash: &HashValue) -> Result<bool> {
        let path = self.object_path(hash)?;
        Ok(fs::metadata(path.as_std_path()).await?.is_some())
    }

    /// Read the object's bytes, or `None` if it is absent.
    #[instrument(name = "Odb::get")]
    pub async fn get(&self, hash: &HashValue) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(hash)?;
        fs::read_buffered(&path).await
    }

    /// Read the object's bytes, erroring if it is absent.
    #[instrument(name = "Odb::must_get")]
    pub async fn must_get(&self, hash: &HashValue) -> Result<Vec<u8>> {
        let path = self.object_path(hash)?;
        fs::must_read_buffered(&path).await
    }

    /// Store a byte buffer under its own hash.
    ///
    /// Returns the hash and whether the object was newly written.
    #[instrument(name = "Odb::put_bytes", skip(content))]
    pub async fn put_bytes(&self, content: &[u8]) -> Result<(HashValue, bool)> {
        let hash = HashValue::of_bytes(content);
        let fresh = self.put_bytes_as(&hash, content).await?;
        Ok((hash, fresh))
    }

    /// Store a byte buffer under a caller-supplied hash.
    ///
    /// Used for tree objects, whose hash is computed over the canonical
    /// serialization with the `.dir` suffix attached.
    #[instrument(name = "Odb::put_bytes_as", skip(content))]
    pub async fn put_bytes_as(&self, hash: &HashValue, content: &[u8]) -> Result<bool> {
        let path = self.object_path(hash)?;
        if fs::metadata(path.as_std_path()).await?.is_some() {
            return Ok(false);
        }

        fs::write_atomic(&path, content).await?;
        self.seal(&path).await;
        trace!(%hash, bytes = content.len(), "stored object");
        Ok(true)
    }

    /// Copy the file at `src` into the store under `hash`.
    ///
    /// The caller is responsible for `hash` actually describing the file's
    /// content; this is always the case because ingestion happens right
    /// after hashing, under the same stat fingerprint.
    #[instrument(name = "Odb::put_file")]
    pub async fn put_file(&self, src: &AbsFilePath, hash: &HashValue) -> Result<bool> {
        let path = self.object_path(hash)?;
        if fs::metadata(path.as_std_path()).await?.is_some() {
            return Ok(false);
        }

        let temp = fs::temp_sibling(&path)?;
        fs::copy_file(src, &temp)
            .await
            .with_context(|| format!("stage object {hash}"))?;
        fs::rename(&temp, &path)
            .await
            .with_context(|| format!("commit object {hash}"))?;
        self.seal(&path).await;
        trace!(?src, %hash, "ingested file");
        Ok(true)
    }

    /// Move an already-verified temp file into the store under `hash`.
    ///
    /// Used by transfers: the file was streamed to a temp location and
    /// re-hashed on arrival, so it can be renamed into place directly.
    #[instrument(name = "Odb::adopt_file")]
    pub async fn adopt_file(&self, temp: &AbsFilePath, hash: &HashValue) -> Result<()> {
        let path = self.object_path(hash)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(&parent).await?;
        }
        fs::rename(temp, &path)
            .await
            .with_context(|| format!("commit object {hash}"))?;
        self.seal(&path).await;
        Ok(())
    }

    /// Remove the object. Missing objects are not an error.
    #[instrument(name = "Odb::remove")]
    pub async fn remove(&self, hash: &HashValue) -> Result<()> {
        let path = self.object_path(hash)?;
        if fs::metadata(path.as_std_path()).await?.is_some() {
            // The write bit was cleared at ingest; restore it so unlink
            // works on platforms that refuse to remove read-only files.
            fs::set_readonly(&path, false).await?;
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    /// List every object hash currently in the store.
    #[instrument(name = "Odb::list")]
    pub fn list(&self) -> impl Stream<Item = Result<HashValue>> + Unpin {
        let root = self.root.clone();
        let files = match root.try_join_dir("files") {
            Ok(files) => files,
            Err(err) => {
                return futures::stream::once(async move { Err::<HashValue, _>(err) }).boxed();
            }
        };

        fs::walk_files(&files)
            .map(move |file| {
                let file = file?;
                let rel = file.relative_to(&files)?;
                // files/<algo>/<ab>/<rest> -> "<ab><rest>"
                let components: Vec<_> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                let [_algo, prefix, rest] = components.as_slice() else {
                    warn!(?rel, "unexpected entry in object store");
                    return Ok(None);
                };
                format!("{prefix}{rest}")
                    .pipe(|hex| HashValue::new(crate::hash::HashAlgo::Md5, hex))
                    .pipe(Some)
                    .pipe(Ok)
            })
            .try_filter_map(|hash| async move { Ok(hash) })
            .boxed()
    }

    /// Clear the write bit on a freshly ingested object.
    ///
    /// Failure is logged and tolerated: some filesystems (and some CI
    /// sandboxes) refuse permission changes, and a writable object is still
    /// a correct object.
    async fn seal(&self, path: &AbsFilePath) {
        if let Err(err) = fs::set_readonly(path, true).await {
            warn!(?path, ?err, "could not write-protect object");
        }
    }
}
