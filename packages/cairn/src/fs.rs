//! Filesystem operations tailored to `cairn`.
//!
//! Inside this module, `std::fs` and `tokio::fs` are referred to by their
//! fully qualified paths to make it maximally clear which one is in use.
//! Everything else in the crate goes through these wrappers so that fs
//! activity is uniformly instrumented and error messages uniformly carry
//! the offending path.

#![allow(
    clippy::disallowed_methods,
    reason = "The raw fs methods are disallowed elsewhere, but we need them here!"
)]

use std::{
    convert::identity, fmt::Debug as StdDebug, marker::PhantomData, sync::Arc, time::SystemTime,
};

use color_eyre::{Result, eyre::Context};
use derive_more::{Debug, Display};
use filetime::FileTime;
use fslock::LockFile as FsLockFile;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tap::{Pipe, TapFallible};
use tokio::{sync::Mutex, task::spawn_blocking};
use tracing::{error, instrument, trace};
use uuid::Uuid;

use crate::path::{Abs, AbsDirPath, AbsFilePath, TypedPath};

/// The default level of concurrency for bulk `fs` operations.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Advisory lock file on the file system.
///
/// Lock with [`LockFile::lock`] or [`LockFile::try_lock`]; unlock with
/// [`LockFile::unlock`] or by dropping the locked instance.
#[derive(Debug, Clone, Display)]
#[display("{path}")]
pub struct LockFile<State> {
    state: PhantomData<State>,
    path: AbsFilePath,
    #[debug("<lock>")]
    inner: Arc<Mutex<FsLockFile>>,
}

/// The associated type's state is unlocked.
/// Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Unlocked;

/// The associated type's state is locked.
/// Used for the typestate pattern.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Default)]
pub struct Locked;

/// Another process already holds the lock.
///
/// Surfaced to the top level so that concurrent runs against the same
/// pipeline can fail fast with a dedicated message and exit code.
#[derive(Debug, Display, derive_more::Error)]
#[display("another cairn process holds the lock at {path}")]
pub struct LockContended {
    pub path: String,
}

impl LockFile<Unlocked> {
    /// Open a lock file handle at the provided path.
    pub async fn open(path: impl Into<AbsFilePath> + StdDebug) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            create_dir_all(&parent).await?;
        }
        let (file, path) =
            spawn_blocking(move || FsLockFile::open(path.as_std_path()).map(|file| (file, path)))
                .await
                .context("join task")?
                .context("open lock file")?;
        Ok(Self {
            state: PhantomData,
            inner: Arc::new(Mutex::new(file)),
            path,
        })
    }

    /// Block until the lock is acquired.
    #[instrument(skip_all, fields(%self))]
    pub async fn lock(self) -> Result<LockFile<Locked>> {
        spawn_blocking(move || {
            {
                // fslock::LockFile panics if the handle is already locked,
                // but the typestate makes locking a locked handle
                // unrepresentable.
                let mut inner = self.inner.blocking_lock();
                inner.lock().context("lock file")?;
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f: &LockFile<Locked>| trace!(path = ?f.path, "locked file"))
    }

    /// Acquire the lock without blocking, failing with [`LockContended`]
    /// if another process holds it.
    #[instrument(skip_all, fields(%self))]
    pub async fn try_lock(self) -> Result<LockFile<Locked>> {
        spawn_blocking(move || {
            {
                let mut inner = self.inner.blocking_lock();
                let acquired = inner.try_lock().context("try lock file")?;
                if !acquired {
                    return Err(LockContended {
                        path: self.path.to_string(),
                    }
                    .into());
                }
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f: &LockFile<Locked>| trace!(path = ?f.path, "locked file"))
    }
}

impl LockFile<Locked> {
    /// Release the lock.
    #[instrument(skip_all, fields(%self))]
    pub async fn unlock(self) -> Result<LockFile<Unlocked>> {
        spawn_blocking(move || -> Result<_> {
            {
                let mut inner = self.inner.blocking_lock();
                inner.unlock().context("unlock file")?;
            }
            Ok(LockFile {
                state: PhantomData,
                inner: self.inner,
                path: self.path,
            })
        })
        .await
        .context("join task")?
        .tap_ok(|f: &LockFile<Unlocked>| trace!(path = ?f.path, "unlocked file"))
    }
}

/// Create the directory and all its parents, if they don't already exist.
#[instrument]
pub async fn create_dir_all(dir: &AbsDirPath) -> Result<()> {
    tokio::fs::create_dir_all(dir.as_std_path())
        .await
        .with_context(|| format!("create dir: {dir:?}"))
        .tap_ok(|_| trace!(?dir, "create directory"))
}

/// Buffer the file content from disk.
#[instrument]
pub async fn read_buffered(path: &AbsFilePath) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path.as_std_path()).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Buffer the file content from disk.
/// Unlike [`read_buffered`], errors if the file doesn't exist.
#[instrument]
pub async fn must_read_buffered(path: &AbsFilePath) -> Result<Vec<u8>> {
    tokio::fs::read(path.as_std_path())
        .await
        .with_context(|| format!("read file: {path:?}"))
}

/// Buffer the file content from disk and parse it as UTF8.
#[instrument]
pub async fn read_buffered_utf8(path: &AbsFilePath) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path.as_std_path()).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file as string");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Buffer the file content from disk and parse it as UTF8.
/// Unlike [`read_buffered_utf8`], errors if the file doesn't exist.
#[instrument]
pub async fn must_read_buffered_utf8(path: &AbsFilePath) -> Result<String> {
    tokio::fs::read_to_string(path.as_std_path())
        .await
        .with_context(|| format!("read file: {path:?}"))
}

/// Write the provided content to disk, creating parent directories.
#[instrument(skip(content))]
pub async fn write(path: &AbsFilePath, content: impl AsRef<[u8]>) -> Result<()> {
    let content = content.as_ref();
    if let Some(parent) = path.parent() {
        create_dir_all(&parent)
            .await
            .context("create parent directory")?;
    }
    tokio::fs::write(path.as_std_path(), content)
        .await
        .with_context(|| format!("write file: {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "write file"))
}

/// Write content to disk atomically: write a sibling temp file, then rename
/// it over the destination.
///
/// Readers never observe a partial file; concurrent writers of identical
/// content race on the rename and the last one wins indistinguishably.
#[instrument(skip(content))]
pub async fn write_atomic(path: &AbsFilePath, content: impl AsRef<[u8]>) -> Result<()> {
    let content = content.as_ref();
    if let Some(parent) = path.parent() {
        create_dir_all(&parent)
            .await
            .context("create parent directory")?;
    }

    let temp = temp_sibling(path)?;
    tokio::fs::write(temp.as_std_path(), content)
        .await
        .with_context(|| format!("write temp file: {temp:?}"))?;

    match tokio::fs::rename(temp.as_std_path(), path.as_std_path()).await {
        Ok(()) => {
            trace!(?path, bytes = content.len(), "write file atomically");
            Ok(())
        }
        Err(err) => {
            if let Err(cleanup) = tokio::fs::remove_file(temp.as_std_path()).await {
                error!(?temp, ?cleanup, "failed to remove temp file");
            }
            Err(err).context(format!("rename {temp:?} to {path:?}"))
        }
    }
}

/// A unique temp file path in the same directory as the target, so the
/// final rename stays on one filesystem.
pub fn temp_sibling(target: &AbsFilePath) -> Result<AbsFilePath> {
    let mut temp = target.as_os_str().to_owned();
    temp.push(".tmp.");
    temp.push(Uuid::new_v4().to_string());
    AbsFilePath::try_from(temp.as_os_str()).context("construct temp path")
}

/// Copy the file from `src` to `dst`, creating parent directories.
/// Returns the number of bytes copied.
#[instrument]
pub async fn copy_file(src: &AbsFilePath, dst: &AbsFilePath) -> Result<u64> {
    if let Some(parent) = dst.parent() {
        create_dir_all(&parent)
            .await
            .context("create parent directory")?;
    }
    let bytes = tokio::fs::copy(src.as_std_path(), dst.as_std_path())
        .await
        .context("copy file")?;
    trace!(?src, ?dst, ?bytes, "copy file");
    Ok(bytes)
}

/// Open a file for reading.
#[instrument]
pub async fn open_file(path: &AbsFilePath) -> Result<tokio::fs::File> {
    tokio::fs::File::open(path.as_std_path())
        .await
        .with_context(|| format!("open file: {path:?}"))
}

/// Remove a file.
#[instrument]
pub async fn remove_file(path: &AbsFilePath) -> Result<()> {
    tokio::fs::remove_file(path.as_std_path())
        .await
        .with_context(|| format!("remove file: {path:?}"))
        .tap_ok(|_| trace!(?path, "remove file"))
}

/// Remove a file if it exists; missing files are not an error.
#[instrument]
pub async fn remove_file_if_exists(path: &AbsFilePath) -> Result<()> {
    match tokio::fs::remove_file(path.as_std_path()).await {
        Ok(()) => {
            trace!(?path, "remove file");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove file: {path:?}")),
    }
}

/// Remove the directory and all its contents. Missing directories are fine.
#[instrument]
pub async fn remove_dir_all(path: &AbsDirPath) -> Result<()> {
    match tokio::fs::remove_dir_all(path.as_std_path()).await {
        Ok(()) => {
            trace!(?path, "removed directory");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).context(format!("remove directory: {path:?}")),
    }
}

/// Rename a file or folder, overwriting the destination if it already exists.
#[instrument]
pub async fn rename<K>(src: &TypedPath<Abs, K>, dst: &TypedPath<Abs, K>) -> Result<()>
where
    K: StdDebug,
{
    tokio::fs::rename(src.as_std_path(), dst.as_std_path())
        .await
        .with_context(|| format!("rename: {src:?} -> {dst:?}"))
        .tap_ok(|_| trace!(?src, ?dst, "rename"))
}

/// Get the standard metadata for the path, or `None` if it doesn't exist.
#[instrument]
pub async fn metadata(
    path: impl AsRef<std::path::Path> + StdDebug,
) -> Result<Option<std::fs::Metadata>> {
    let path = path.as_ref();
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("stat metadata: {path:?}")),
    }
}

/// Check whether the path exists.
///
/// Returns `false` on errors too; this check is racy by nature, so callers
/// that act on the result should handle the not-found error on the action.
#[instrument]
pub async fn exists(path: impl AsRef<std::path::Path> + StdDebug) -> bool {
    tokio::fs::try_exists(path).await.is_ok_and(identity)
}

/// Return whether the path represents a directory.
#[instrument]
pub async fn is_dir(path: impl AsRef<std::path::Path> + StdDebug) -> bool {
    metadata(path)
        .await
        .is_ok_and(|m| m.is_some_and(|m| m.is_dir()))
}

/// Return whether the path represents a normal file.
#[instrument]
pub async fn is_file(path: impl AsRef<std::path::Path> + StdDebug) -> bool {
    metadata(path)
        .await
        .is_ok_and(|m| m.is_some_and(|m| m.is_file()))
}

/// Check whether the file is executable.
#[instrument]
pub async fn is_executable(path: impl AsRef<std::path::Path> + StdDebug) -> bool {
    let path = path.as_ref().to_path_buf();
    spawn_blocking(move || is_executable::is_executable(path))
        .await
        .expect("join task")
}

/// Set the file to be executable.
///
/// On Windows this is a no-op: whether a file is executable there is a
/// property of its extension, not a permission bit.
#[instrument]
pub async fn set_executable(path: &AbsFilePath, executable: bool) -> Result<()> {
    #[cfg(not(target_os = "windows"))]
    if executable {
        use std::os::unix::fs::PermissionsExt as _;

        let metadata = tokio::fs::metadata(path.as_std_path())
            .await
            .context("get metadata")?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(permissions.mode() | 0o111);
        tokio::fs::set_permissions(path.as_std_path(), permissions)
            .await
            .context("set permissions")?;
    }
    Ok(())
}

/// Clear or restore the write bit on a file.
///
/// Objects ingested into the object database are marked read-only so that
/// a hardlinked workspace copy can't silently corrupt the store.
#[instrument]
pub async fn set_readonly(path: &AbsFilePath, readonly: bool) -> Result<()> {
    let metadata = tokio::fs::metadata(path.as_std_path())
        .await
        .with_context(|| format!("get metadata: {path:?}"))?;
    let mut permissions = metadata.permissions();
    #[allow(clippy::permissions_set_readonly_false, reason = "unprotect is deliberate")]
    permissions.set_readonly(readonly);
    tokio::fs::set_permissions(path.as_std_path(), permissions)
        .await
        .with_context(|| format!("set permissions: {path:?}"))
        .tap_ok(|_| trace!(?path, ?readonly, "set readonly"))
}

/// Create a hard link to the file, replacing any existing destination.
#[instrument]
pub async fn hard_link(original: &AbsFilePath, link: &AbsFilePath) -> Result<()> {
    if exists(link.as_std_path()).await {
        remove_file(link)
            .await
            .context("remove linked destination")?;
    }
    tokio::fs::hard_link(original.as_std_path(), link.as_std_path())
        .await
        .context(format!("hard link {original:?} -> {link:?}"))
}

/// Create a symbolic link to the file, replacing any existing destination.
#[instrument]
pub async fn symlink(original: &AbsFilePath, link: &AbsFilePath) -> Result<()> {
    if exists(link.as_std_path()).await {
        remove_file(link)
            .await
            .context("remove linked destination")?;
    }
    #[cfg(unix)]
    {
        tokio::fs::symlink(original.as_std_path(), link.as_std_path())
            .await
            .context(format!("symlink {original:?} -> {link:?}"))
    }
    #[cfg(windows)]
    {
        tokio::fs::symlink_file(original.as_std_path(), link.as_std_path())
            .await
            .context(format!("symlink {original:?} -> {link:?}"))
    }
}

/// Walk files in a directory recursively, in parallel.
///
/// Only emits regular files. Emission order is nondeterministic; callers
/// that need determinism (tree hashing) must sort.
#[instrument]
pub fn walk_files(root: &AbsDirPath) -> impl Stream<Item = Result<AbsFilePath>> + Unpin + use<> {
    let (tx, rx) = flume::bounded::<Result<AbsFilePath>>(0);
    let root = root.clone();

    spawn_blocking(move || {
        for entry in jwalk::WalkDir::new(root.as_std_path()).skip_hidden(false) {
            let entry = match entry.with_context(|| format!("walk files in {root:?}")) {
                Ok(entry) => entry,
                Err(err) => {
                    if tx.send(Err(err)).is_err() {
                        return;
                    }
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let path = match AbsFilePath::try_from(entry.path()) {
                Ok(path) => path,
                Err(err) => {
                    if tx.send(Err(err)).is_err() {
                        return;
                    }
                    continue;
                }
            };

            if tx.send(Ok(path)).is_err() {
                return;
            }
        }
    });

    rx.into_stream().pipe(Box::pin)
}

/// The identity of an on-disk file at a point in time.
///
/// When any component changes, cached knowledge about the file's content is
/// void. This is the key of the state index.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize, Display,
)]
#[display("inode={inode} size={size} mtime={mtime_ns}")]
pub struct Fingerprint {
    /// Inode number; 0 on platforms without inodes.
    pub inode: u64,

    /// File size in bytes.
    pub size: u64,

    /// Modification time in nanoseconds since the unix epoch.
    pub mtime_ns: i64,
}

impl Fingerprint {
    /// Stat the file and build its fingerprint, or `None` if it's missing.
    #[instrument(name = "Fingerprint::of")]
    pub async fn of(path: &AbsFilePath) -> Result<Option<Self>> {
        let Some(metadata) = metadata(path.as_std_path()).await? else {
            return Ok(None);
        };
        let mtime = metadata
            .modified()
            .with_context(|| format!("read mtime: {path:?}"))?;
        let mtime = FileTime::from_system_time(mtime);
        let mtime_ns = mtime.seconds() * 1_000_000_000 + i64::from(mtime.nanoseconds());

        #[cfg(unix)]
        let inode = {
            use std::os::unix::fs::MetadataExt as _;
            metadata.ino()
        };
        #[cfg(not(unix))]
        let inode = 0;

        Ok(Some(Self {
            inode,
            size: metadata.len(),
            mtime_ns,
        }))
    }
}

/// Set the file mtime, for tests and link bookkeeping.
#[instrument]
pub async fn set_mtime(path: &AbsFilePath, mtime: SystemTime) -> Result<()> {
    let mtime = FileTime::from_system_time(mtime);
    let path = path.as_std_path().to_path_buf();
    spawn_blocking(move || filetime::set_file_mtime(&path, mtime))
        .await
        .context("join task")?
        .context("set mtime")
}
