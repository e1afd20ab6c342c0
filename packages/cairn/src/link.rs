//! Materializing objects into the workspace.
//!
//! The object database is the source of truth; the workspace is a view of
//! it. This module produces that view as cheaply as the filesystem allows,
//! trying link kinds in order (`reflink`, `hardlink`, `symlink`, `copy` by
//! default) and remembering the first kind that works so later operations
//! skip the failed attempts.
//!
//! Reflinks go through the raw syscalls (`FICLONE` ioctl on Linux,
//! `clonefile` on macOS); there is no portable std wrapper for either.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use color_eyre::{Result, eyre::Context};
use derive_more::Display;
use strum::{Display as StrumDisplay, EnumString};
use tokio::task::spawn_blocking;
use tracing::{debug, instrument, trace, warn};

use crate::{
    fs,
    hash::HashValue,
    odb::{Odb, tree::Tree},
    path::{AbsDirPath, AbsFilePath, JoinWith as _},
};

/// Links slower than this trigger the one-shot cache-type warning.
const SLOW_LINK_THRESHOLD: Duration = Duration::from_secs(10);

/// Process-wide latch so the slow-link warning fires at most once.
static SLOW_LINK_WARNED: AtomicBool = AtomicBool::new(false);

/// A way of getting object content to a workspace path.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, StrumDisplay, EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum LinkKind {
    /// Copy-on-write clone; free until someone writes.
    Reflink,
    /// Shared inode; free, but edits would corrupt the store, which is why
    /// ingested objects are write-protected.
    Hardlink,
    /// Pointer into the store; visible as a link to the user.
    Symlink,
    /// Plain byte copy; always works, costs time and space.
    Copy,
}

impl LinkKind {
    /// The default preference order.
    pub fn default_order() -> Vec<LinkKind> {
        vec![
            LinkKind::Reflink,
            LinkKind::Hardlink,
            LinkKind::Symlink,
            LinkKind::Copy,
        ]
    }
}

/// Materializes objects from an [`Odb`] into workspace paths.
#[derive(Clone, Debug, Display)]
#[display("linker({kinds:?})")]
pub struct Linker {
    kinds: Vec<LinkKind>,
    /// First kind that succeeded; tried first from then on.
    remembered: Arc<Mutex<Option<LinkKind>>>,
    /// Whether the slow-link warning may fire. Disabled when the user
    /// configured an explicit cache type list.
    warn_slow: bool,
}

impl Linker {
    /// Build a linker with the given preference order.
    pub fn new(kinds: Vec<LinkKind>, warn_slow: bool) -> Self {
        Self {
            kinds,
            remembered: Arc::new(Mutex::new(None)),
            warn_slow,
        }
    }

    /// Materialize the blob `hash` at `dst`.
    #[instrument(name = "Linker::link_blob", skip(self, odb))]
    pub async fn link_blob(&self, odb: &Odb, hash: &HashValue, dst: &AbsFilePath) -> Result<LinkKind> {
        let src = odb.object_path(hash)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(&parent).await?;
        }

        let started = Instant::now();
        let kind = self.link_file(&src, dst).await?;
        self.observe(started.elapsed());

        trace!(%hash, ?dst, %kind, "materialized blob");
        Ok(kind)
    }

    /// Materialize the tree at `dst`: create the directory skeleton and
    /// link every member file.
    #[instrument(name = "Linker::link_tree", skip(self, odb, tree))]
    pub async fn link_tree(&self, odb: &Odb, tree: &Tree, dst: &AbsDirPath) -> Result<()> {
        fs::create_dir_all(dst).await?;
        for entry in tree.entries() {
            let target = dst.join(&entry.relpath);
            self.link_blob(odb, &entry.hash, &target).await?;
            if entry.isexec {
                fs::set_executable(&target, true).await?;
            }
        }
        Ok(())
    }

    /// Materialize any object at `dst`, replacing whatever is there.
    ///
    /// Dispatches on the hash: trees are parsed out of the store and
    /// expanded into a directory, blobs land as a single file.
    #[instrument(name = "Linker::materialize", skip(self, odb))]
    pub async fn materialize(
        &self,
        odb: &Odb,
        hash: &HashValue,
        dst: &crate::path::AbsEntryPath,
    ) -> Result<()> {
        // The previous occupant may be the wrong kind entirely (a file
        // where a directory will go, or the reverse).
        if fs::is_dir(dst.as_std_path()).await {
            fs::remove_dir_all(&dst.as_dir()).await?;
        } else {
            fs::remove_file_if_exists(&dst.as_file()).await?;
        }

        if hash.is_tree() {
            let bytes = odb.must_get(hash).await?;
            let tree = Tree::parse(&bytes)?;
            self.link_tree(odb, &tree, &dst.as_dir()).await
        } else {
            self.link_blob(odb, hash, &dst.as_file()).await.map(|_| ())
        }
    }

    /// Link one file, trying kinds in order.
    async fn link_file(&self, src: &AbsFilePath, dst: &AbsFilePath) -> Result<LinkKind> {
        let remembered = *self.remembered.lock().expect("linker lock poisoned");
        let order: Vec<LinkKind> = match remembered {
            Some(kind) => std::iter::once(kind)
                .chain(self.kinds.iter().copied().filter(move |k| *k != kind))
                .collect(),
            None => self.kinds.clone(),
        };

        let mut last_err = None;
        for kind in order {
            match try_link(kind, src, dst).await {
                Ok(()) => {
                    let mut slot = self.remembered.lock().expect("linker lock poisoned");
                    if slot.is_none() {
                        debug!(%kind, "remembering link kind");
                    }
                    *slot = Some(kind);
                    return Ok(kind);
                }
                Err(err) => {
                    trace!(%kind, ?err, "link kind failed, falling through");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| color_eyre::eyre::eyre!("no link kinds configured"))
            .wrap_err(format!("materialize {src:?} at {dst:?}")))
    }

    /// Feed the slow-link guard. Fires the advisory warning at most once
    /// per process.
    fn observe(&self, elapsed: Duration) {
        if !self.warn_slow || elapsed < SLOW_LINK_THRESHOLD {
            return;
        }
        if SLOW_LINK_WARNED.swap(true, Ordering::Relaxed) {
            return;
        }
        warn!(
            elapsed_secs = elapsed.as_secs(),
            "links into the workspace are slow; configuring `cache.type` \
             (for example `hardlink,symlink`) can cut execution time \
             considerably"
        );
    }
}

/// Attempt a single link kind.
async fn try_link(kind: LinkKind, src: &AbsFilePath, dst: &AbsFilePath) -> Result<()> {
    match kind {
        LinkKind::Reflink => {
            fs::remove_file_if_exists(dst).await?;
            let src = src.as_std_path().to_path_buf();
            let dst_path = dst.as_std_path().to_path_buf();
            spawn_blocking(move || reflink_sync(&src, &dst_path))
                .await
                .context("join task")?
                .context("reflink")?;
            Ok(())
        }
        LinkKind::Hardlink => fs::hard_link(src, dst).await,
        LinkKind::Symlink => fs::symlink(src, dst).await,
        LinkKind::Copy => {
            fs::copy_file(src, dst).await?;
            // The store copy is write-protected; the workspace copy is the
            // user's to edit.
            fs::set_readonly(dst, false).await?;
            Ok(())
        }
    }
}

/// Clone `src` to `dst` without copying data, where the filesystem can.
#[cfg(target_os = "linux")]
fn reflink_sync(src: &std::path::Path, dst: &std::path::Path) -> std::io::Result<()> {
    #![allow(clippy::disallowed_methods, reason = "raw fd plumbing needs std::fs")]
    use std::os::fd::AsRawFd as _;

    let src_file = std::fs::File::open(src)?;
    let dst_file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dst)?;

    let ret = unsafe { libc::ioctl(dst_file.as_raw_fd(), libc::FICLONE, src_file.as_raw_fd()) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        let _ = std::fs::remove_file(dst);
        return Err(err);
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn reflink_sync(src: &std::path::Path, dst: &std::path::Path) -> std::io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt as _;

    let src = CString::new(src.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    let dst = CString::new(dst.as_os_str().as_bytes())
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

    let ret = unsafe { libc::clonefile(src.as_ptr(), dst.as_ptr(), 0) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn reflink_sync(_src: &std::path::Path, _dst: &std::path::Path) -> std::io::Result<()> {
    Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::RelFilePath;
    use crate::{mk_rel_dir, mk_rel_file};
    use pretty_assertions::assert_eq as pretty_assert_eq;

    async fn temp_odb() -> (tempfile::TempDir, Odb, AbsDirPath) {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        let odb_root = root.join(mk_rel_dir!("odb"));
        let odb = Odb::open(&odb_root).await.unwrap();
        (dir, odb, root)
    }

    #[tokio::test]
    async fn copy_fallback_materializes_writable_file() {
        let (_guard, odb, root) = temp_odb().await;
        let (hash, _) = odb.put_bytes(b"content").await.unwrap();

        let linker = Linker::new(vec![LinkKind::Copy], false);
        let dst = root.join(mk_rel_file!("ws/out.txt"));
        let kind = linker.link_blob(&odb, &hash, &dst).await.unwrap();
        pretty_assert_eq!(kind, LinkKind::Copy);

        let content = fs::must_read_buffered(&dst).await.unwrap();
        pretty_assert_eq!(content, b"content");

        // The workspace copy must be editable.
        fs::write(&dst, b"edited").await.unwrap();
        // And the store object untouched.
        pretty_assert_eq!(odb.get(&hash).await.unwrap().unwrap(), b"content");
    }

    #[tokio::test]
    async fn hardlink_shares_content() {
        let (_guard, odb, root) = temp_odb().await;
        let (hash, _) = odb.put_bytes(b"shared").await.unwrap();

        let linker = Linker::new(vec![LinkKind::Hardlink, LinkKind::Copy], false);
        let dst = root.join(mk_rel_file!("ws/shared.bin"));
        linker.link_blob(&odb, &hash, &dst).await.unwrap();

        let content = fs::must_read_buffered(&dst).await.unwrap();
        pretty_assert_eq!(content, b"shared");
    }

    #[tokio::test]
    async fn falls_through_unsupported_kinds() {
        let (_guard, odb, root) = temp_odb().await;
        let (hash, _) = odb.put_bytes(b"x").await.unwrap();

        // Reflink fails on filesystems without clone support and the
        // linker must quietly move on.
        let linker = Linker::new(LinkKind::default_order(), false);
        let dst = root.join(mk_rel_file!("out"));
        let kind = linker.link_blob(&odb, &hash, &dst).await.unwrap();

        let content = fs::must_read_buffered(&dst).await.unwrap();
        pretty_assert_eq!(content, b"x");

        // Second link reuses the remembered kind.
        let dst2 = root.join(mk_rel_file!("out2"));
        let kind2 = linker.link_blob(&odb, &hash, &dst2).await.unwrap();
        pretty_assert_eq!(kind, kind2);
    }

    #[tokio::test]
    async fn materializes_trees() {
        let (_guard, odb, root) = temp_odb().await;
        let (a, _) = odb.put_bytes(b"alpha").await.unwrap();
        let (b, _) = odb.put_bytes(b"beta").await.unwrap();

        let tree = Tree::from_entries(vec![
            crate::odb::tree::TreeEntry {
                relpath: RelFilePath::try_from("a.txt").unwrap(),
                hash: a,
                size: Some(5),
                isexec: false,
            },
            crate::odb::tree::TreeEntry {
                relpath: RelFilePath::try_from("sub/b.txt").unwrap(),
                hash: b,
                size: Some(4),
                isexec: false,
            },
        ]);

        let linker = Linker::new(vec![LinkKind::Copy], false);
        let dst = root.join(mk_rel_dir!("ws/data"));
        linker.link_tree(&odb, &tree, &dst).await.unwrap();

        let a_path = dst.join(mk_rel_file!("a.txt"));
        let b_path = dst.join(mk_rel_file!("sub/b.txt"));
        pretty_assert_eq!(fs::must_read_buffered(&a_path).await.unwrap(), b"alpha");
        pretty_assert_eq!(fs::must_read_buffered(&b_path).await.unwrap(), b"beta");
    }
}
