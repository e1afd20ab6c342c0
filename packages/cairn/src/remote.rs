//! Remote blob storage, as the core sees it.
//!
//! Real backends (object stores, SSH, HTTP) live outside the core; the
//! engine only consumes this narrow capability. The filesystem
//! implementation below is a complete backend in its own right (a shared
//! directory on a network mount is a common team setup) and doubles as the
//! test double for everything transfer-related.

use std::future::Future;

use color_eyre::{Result, eyre::Context};
use derive_more::{Debug, Display};
use futures::TryStreamExt as _;
use rusqlite::{Connection, OptionalExtension as _, params};
use std::sync::{Arc, Mutex};
use tracing::{instrument, trace};

use crate::{
    fs,
    hash::{HashAlgo, HashValue},
    path::{AbsDirPath, AbsFilePath, RelativeTo as _, TryJoinWith as _},
};

/// Narrow capability the core consumes for remote storage.
///
/// Implementations move opaque bytes; verification happens on the engine
/// side by rehashing arrivals.
pub trait BlobStore: Clone + Send + Sync + 'static {
    /// The configured name of this remote, for messages and the index.
    fn name(&self) -> &str;

    /// Whether the remote holds the object.
    fn exists(&self, hash: &HashValue) -> impl Future<Output = Result<bool>> + Send;

    /// Upload the file at `src` as the object `hash`.
    fn put(&self, hash: &HashValue, src: &AbsFilePath)
    -> impl Future<Output = Result<()>> + Send;

    /// Download the object `hash` to the local file `dst`.
    ///
    /// Fails if the remote does not hold the object.
    fn get(&self, hash: &HashValue, dst: &AbsFilePath)
    -> impl Future<Output = Result<()>> + Send;

    /// List every object hash the remote holds.
    fn list(&self) -> impl Future<Output = Result<Vec<HashValue>>> + Send;

    /// Remove the object. Missing objects are not an error.
    fn remove(&self, hash: &HashValue) -> impl Future<Output = Result<()>> + Send;
}

/// A remote backed by a plain directory.
///
/// Uses the same `files/<algo>/<ab>/<rest>` fan-out as the local store, so
/// a remote is just an object database somewhere else.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[display("{name} ({root})")]
pub struct FsRemote {
    name: String,
    root: AbsDirPath,
}

impl FsRemote {
    /// Open a remote rooted at `root`. The directory is created lazily on
    /// first upload.
    pub fn new(name: impl Into<String>, root: AbsDirPath) -> Self {
        Self {
            name: name.into(),
            root,
        }
    }

    fn object_path(&self, hash: &HashValue) -> Result<AbsFilePath> {
        let hex = hash.as_str();
        let (prefix, rest) = hex.split_at(2);
        self.root
            .try_join_dir("files")?
            .try_join_dir(hash.algo().to_string())?
            .try_join_dir(prefix)?
            .try_join_file(rest)
    }
}

impl BlobStore for FsRemote {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(name = "FsRemote::exists", skip(self), fields(remote = %self.name))]
    async fn exists(&self, hash: &HashValue) -> Result<bool> {
        let path = self.object_path(hash)?;
        Ok(fs::metadata(path.as_std_path()).await?.is_some())
    }

    #[instrument(name = "FsRemote::put", skip(self), fields(remote = %self.name))]
    async fn put(&self, hash: &HashValue, src: &AbsFilePath) -> Result<()> {
        let path = self.object_path(hash)?;
        if fs::metadata(path.as_std_path()).await?.is_some() {
            return Ok(());
        }
        let temp = fs::temp_sibling(&path)?;
        fs::copy_file(src, &temp).await?;
        fs::rename(&temp, &path).await?;
        trace!(%hash, "uploaded object");
        Ok(())
    }

    #[instrument(name = "FsRemote::get", skip(self), fields(remote = %self.name))]
    async fn get(&self, hash: &HashValue, dst: &AbsFilePath) -> Result<()> {
        let path = self.object_path(hash)?;
        fs::copy_file(&path, dst)
            .await
            .with_context(|| format!("download object {hash}"))?;
        trace!(%hash, "downloaded object");
        Ok(())
    }

    #[instrument(name = "FsRemote::list", skip(self), fields(remote = %self.name))]
    async fn list(&self) -> Result<Vec<HashValue>> {
        let files = self.root.try_join_dir("files")?;
        if fs::metadata(files.as_std_path()).await?.is_none() {
            return Ok(Vec::new());
        }

        fs::walk_files(&files)
            .try_filter_map(|file| {
                let files = files.clone();
                async move {
                    let rel = file.relative_to(&files)?;
                    let components: Vec<_> = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    let [_algo, prefix, rest] = components.as_slice() else {
                        return Ok(None);
                    };
                    Ok(Some(HashValue::new(HashAlgo::Md5, format!("{prefix}{rest}"))))
                }
            })
            .try_collect()
            .await
    }

    #[instrument(name = "FsRemote::remove", skip(self), fields(remote = %self.name))]
    async fn remove(&self, hash: &HashValue) -> Result<()> {
        let path = self.object_path(hash)?;
        fs::remove_file_if_exists(&path).await
    }
}

/// Cache of hashes known to be present on a remote.
///
/// Consulted before uploads to skip redundant existence checks, and updated
/// after confirmed transfers in either direction. Purely advisory: a stale
/// entry costs one extra round trip, never correctness.
#[derive(Clone, Debug)]
pub struct RemoteIndex {
    #[debug("<db>")]
    conn: Arc<Mutex<Connection>>,
}

impl RemoteIndex {
    /// Open or create the index database at `path`.
    #[instrument(name = "RemoteIndex::open", skip(path))]
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            #[allow(clippy::disallowed_methods, reason = "runs synchronously at startup")]
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create index directory {parent:?}"))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open remote index at {path:?}"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS known (hash TEXT PRIMARY KEY);",
        )
        .context("initialize remote index schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// An in-memory index for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory index")?;
        conn.execute_batch("CREATE TABLE IF NOT EXISTS known (hash TEXT PRIMARY KEY);")
            .context("initialize remote index schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Whether the hash is recorded as present on the remote.
    pub fn contains(&self, hash: &HashValue) -> Result<bool> {
        let conn = self.conn.lock().expect("index lock poisoned");
        conn.query_row(
            "SELECT 1 FROM known WHERE hash = ?1",
            params![hash.as_str()],
            |_| Ok(()),
        )
        .optional()
        .context("query remote index")
        .map(|row| row.is_some())
    }

    /// Record the hash as present on the remote.
    pub fn insert(&self, hash: &HashValue) -> Result<()> {
        let conn = self.conn.lock().expect("index lock poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO known (hash) VALUES (?1)",
            params![hash.as_str()],
        )
        .context("insert into remote index")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mk_rel_dir, mk_rel_file};
    use crate::path::JoinWith as _;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[tokio::test]
    async fn fs_remote_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        let remote = FsRemote::new("origin", root.join(mk_rel_dir!("remote")));

        let src = root.join(mk_rel_file!("src.bin"));
        fs::write(&src, b"payload").await.unwrap();
        let hash = HashValue::of_bytes(b"payload");

        assert!(!remote.exists(&hash).await.unwrap());
        remote.put(&hash, &src).await.unwrap();
        assert!(remote.exists(&hash).await.unwrap());

        let dst = root.join(mk_rel_file!("dst.bin"));
        remote.get(&hash, &dst).await.unwrap();
        pretty_assert_eq!(fs::must_read_buffered(&dst).await.unwrap(), b"payload");

        pretty_assert_eq!(remote.list().await.unwrap(), vec![hash.clone()]);

        remote.remove(&hash).await.unwrap();
        assert!(!remote.exists(&hash).await.unwrap());
        pretty_assert_eq!(remote.list().await.unwrap(), Vec::<HashValue>::new());
    }

    #[test]
    fn remote_index_remembers() {
        let index = RemoteIndex::in_memory().unwrap();
        let hash = HashValue::of_bytes(b"thing");

        assert!(!index.contains(&hash).unwrap());
        index.insert(&hash).unwrap();
        assert!(index.contains(&hash).unwrap());
        // Idempotent.
        index.insert(&hash).unwrap();
        assert!(index.contains(&hash).unwrap());
    }
}
