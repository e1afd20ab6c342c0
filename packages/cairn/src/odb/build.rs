//! Building objects out of workspace paths.
//!
//! "Building" hashes a file or directory into object form without touching
//! the store; "ingesting" commits the built object's bytes into the store.
//! The two are separate because status checks need hashes but must not
//! populate the cache, while stage commits need both.
//!
//! File hashing consults the state index first, so an unchanged file is
//! answered from a stat alone.

use color_eyre::{Result, eyre::eyre};
use futures::{StreamExt as _, TryStreamExt as _};
use tokio::task::spawn_blocking;
use tracing::instrument;

use crate::{
    fs::{self, DEFAULT_CONCURRENCY, Fingerprint},
    hash::{self, HashValue},
    ignorefile::IgnoreRules,
    odb::{
        Meta, Odb,
        tree::{Tree, TreeEntry},
    },
    path::{AbsDirPath, AbsEntryPath, AbsFilePath, JoinWith as _, RelativeTo as _},
    state::StateIndex,
};

/// A workspace entry hashed into object form.
#[derive(Clone, Debug)]
pub struct Built {
    pub hash: HashValue,
    pub meta: Meta,
    /// Present when the entry is a directory.
    pub tree: Option<Tree>,
}

/// Hash the workspace entry at `path`, file or directory.
///
/// Fails if the path does not exist; "absent" is a state the *caller*
/// handles (a missing output is information, not an error, during status).
#[instrument(name = "build", skip(state, ignore))]
pub async fn build(
    state: &StateIndex,
    ignore: &IgnoreRules,
    path: &AbsEntryPath,
) -> Result<Built> {
    if fs::is_dir(path.as_std_path()).await {
        build_dir(state, ignore, &path.as_dir()).await
    } else {
        build_file(state, &path.as_file()).await
    }
}

/// Hash a single file, answering from the state index when the fingerprint
/// still matches.
#[instrument(name = "build_file", skip(state))]
pub async fn build_file(state: &StateIndex, path: &AbsFilePath) -> Result<Built> {
    let fingerprint = Fingerprint::of(path)
        .await?
        .ok_or_else(|| eyre!("path does not exist: {path}"))?;

    if let Some((hash, meta)) = state.get(path, &fingerprint)? {
        return Ok(Built {
            hash,
            meta,
            tree: None,
        });
    }

    let hash = hash::hash_file(path).await?;
    let isexec = fs::is_executable(path.as_std_path()).await;
    let meta = Meta::file(fingerprint.size, isexec);
    state.put(path, &fingerprint, &hash, &meta)?;

    Ok(Built {
        hash,
        meta,
        tree: None,
    })
}

/// Hash a directory into a tree object.
///
/// The walk is filtered by the ignore rules and sorted, so the resulting
/// hash depends only on the filtered contents and their relative paths.
#[instrument(name = "build_dir", skip(state, ignore))]
pub async fn build_dir(
    state: &StateIndex,
    ignore: &IgnoreRules,
    dir: &AbsDirPath,
) -> Result<Built> {
    let files = {
        let ignore = ignore.clone();
        let dir = dir.clone();
        spawn_blocking(move || ignore.walk(&dir))
            .await
            .map_err(|e| eyre!("join walk task: {e}"))??
    };

    let entries = futures::stream::iter(files)
        .map(|file| {
            let state = state.clone();
            let dir = dir.clone();
            async move {
                let built = build_file(&state, &file).await?;
                let relpath = file.relative_to(&dir)?;
                Ok::<_, color_eyre::Report>(TreeEntry {
                    relpath,
                    size: built.meta.size,
                    isexec: built.meta.isexec,
                    hash: built.hash,
                })
            }
        })
        .buffered(DEFAULT_CONCURRENCY)
        .try_collect::<Vec<_>>()
        .await?;

    let tree = Tree::from_entries(entries);
    let (hash, _) = tree.digest()?;
    let meta = tree.meta();

    Ok(Built {
        hash,
        meta,
        tree: Some(tree),
    })
}

/// Commit a built object's bytes into the store.
///
/// For directories this ingests every member blob and then the serialized
/// tree itself; for files, just the file.
#[instrument(name = "ingest", skip(odb, built))]
pub async fn ingest(odb: &Odb, built: &Built, src: &AbsEntryPath) -> Result<()> {
    match &built.tree {
        None => {
            odb.put_file(&src.as_file(), &built.hash).await?;
        }
        Some(tree) => {
            let dir = src.as_dir();
            for entry in tree.entries() {
                let member = dir.join(&entry.relpath);
                odb.put_file(&member, &entry.hash).await?;
            }
            let (hash, bytes) = tree.digest()?;
            odb.put_bytes_as(&hash, &bytes).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::TryJoinWith as _;
    use crate::{mk_rel_dir, mk_rel_file};
    use pretty_assertions::assert_eq as pretty_assert_eq;

    async fn scaffold(files: &[(&str, &str)]) -> (tempfile::TempDir, AbsDirPath) {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        for (path, content) in files {
            let target = root.try_join_file(path).unwrap();
            fs::write(&target, content).await.unwrap();
        }
        (dir, root)
    }

    #[tokio::test]
    async fn state_index_short_circuits_rehashing() {
        let (_guard, root) = scaffold(&[("foo", "foo")]).await;
        let state = StateIndex::in_memory().unwrap();
        let path = root.join(mk_rel_file!("foo"));

        let first = build_file(&state, &path).await.unwrap();
        pretty_assert_eq!(first.hash.as_str(), "acbd18db4cc2f85cedef654fccc4a4d8");
        pretty_assert_eq!(first.meta.size, Some(3));

        // Poison the file without updating its fingerprint-relevant fields:
        // instead, verify the cached answer is served for the same
        // fingerprint by checking the state entry directly.
        let fp = Fingerprint::of(&path).await.unwrap().unwrap();
        let cached = state.get(&path, &fp).unwrap();
        assert!(cached.is_some());

        let second = build_file(&state, &path).await.unwrap();
        pretty_assert_eq!(second.hash, first.hash);
    }

    #[tokio::test]
    async fn tree_hash_is_stable_across_mtime_touches() {
        let (_guard, root) = scaffold(&[("dir/a", "a"), ("dir/b", "b")]).await;
        let state = StateIndex::in_memory().unwrap();
        let ignore = IgnoreRules::empty();
        let dir = root.join(mk_rel_dir!("dir"));

        let first = build_dir(&state, &ignore, &dir).await.unwrap();
        assert!(first.hash.is_tree());
        pretty_assert_eq!(first.meta.nfiles, Some(2));

        // Touch mtime without changing content.
        let a = root.join(mk_rel_file!("dir/a"));
        fs::set_mtime(&a, std::time::SystemTime::now()).await.unwrap();

        let second = build_dir(&state, &ignore, &dir).await.unwrap();
        pretty_assert_eq!(second.hash, first.hash);
    }

    #[tokio::test]
    async fn tree_hash_tracks_content_changes() {
        let (_guard, root) = scaffold(&[("dir/a", "a")]).await;
        let state = StateIndex::in_memory().unwrap();
        let ignore = IgnoreRules::empty();
        let dir = root.join(mk_rel_dir!("dir"));

        let before = build_dir(&state, &ignore, &dir).await.unwrap();
        fs::write(&root.join(mk_rel_file!("dir/a")), "changed")
            .await
            .unwrap();
        let after = build_dir(&state, &ignore, &dir).await.unwrap();
        assert_ne!(before.hash, after.hash);
    }

    #[tokio::test]
    async fn ingest_commits_members_and_tree() {
        let (_guard, root) = scaffold(&[("dir/a", "a"), ("dir/sub/b", "b")]).await;
        let state = StateIndex::in_memory().unwrap();
        let ignore = IgnoreRules::empty();
        let odb_root = root.join(mk_rel_dir!("odb"));
        let odb = Odb::open(&odb_root).await.unwrap();

        let dir = root.join(mk_rel_dir!("dir"));
        let built = build_dir(&state, &ignore, &dir).await.unwrap();
        ingest(&odb, &built, &dir.as_entry()).await.unwrap();

        // The tree blob and both members are present.
        assert!(odb.exists(&built.hash).await.unwrap());
        for entry in built.tree.as_ref().unwrap().entries() {
            assert!(odb.exists(&entry.hash).await.unwrap());
        }

        // The stored tree parses back to the same value.
        let bytes = odb.must_get(&built.hash).await.unwrap();
        let parsed = Tree::parse(&bytes).unwrap();
        pretty_assert_eq!(&parsed, built.tree.as_ref().unwrap());
    }
}
