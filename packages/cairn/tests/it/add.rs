//! Tracking files and directories with `add`.

use cairn::hash::{HashAlgo, HashValue};
use cairn::path::{RelEntryPath, TryJoinWith as _};
use cairn::pipeline::lockfile::TrackFileDoc;
use pretty_assertions::assert_eq as pretty_assert_eq;

use crate::workspace;

fn rel(path: &str) -> RelEntryPath {
    RelEntryPath::try_from(path).unwrap()
}

#[tokio::test]
async fn add_records_the_known_md5_and_size() {
    let ws = workspace(&[("foo", "foo")]).await;

    let track = ws.repo.add(&rel("foo")).await.unwrap();
    pretty_assert_eq!(track.to_posix(), "foo.cairn");

    let doc = TrackFileDoc::load(&ws.root.try_join_file("foo.cairn").unwrap())
        .await
        .unwrap()
        .unwrap();
    pretty_assert_eq!(doc.outs.len(), 1);
    pretty_assert_eq!(doc.outs[0].md5.as_str(), "acbd18db4cc2f85cedef654fccc4a4d8");
    pretty_assert_eq!(doc.outs[0].size, Some(3));
    pretty_assert_eq!(doc.outs[0].hash, "md5");

    // Exactly one blob in the store, at the expected fan-out location.
    let object = HashValue::new(HashAlgo::Md5, "acbd18db4cc2f85cedef654fccc4a4d8");
    assert!(ws.repo.odb().exists(&object).await.unwrap());
}

#[tokio::test]
async fn re_adding_unchanged_file_is_a_state_index_hit() {
    let ws = workspace(&[("foo", "foo")]).await;
    ws.repo.add(&rel("foo")).await.unwrap();

    let first = ws.read("foo.cairn").await;

    // Second add must see the same fingerprint and serve the hash from
    // the state index; the tracking file comes out identical.
    ws.repo.add(&rel("foo")).await.unwrap();
    let second = ws.read("foo.cairn").await;
    pretty_assert_eq!(first, second);
}

#[tokio::test]
async fn directory_tree_hash_survives_mtime_touches() {
    let mut ws = workspace(&[("dir/a", "a"), ("dir/b", "b")]).await;
    ws.repo.add(&rel("dir")).await.unwrap();

    let doc = TrackFileDoc::load(&ws.root.try_join_file("dir.cairn").unwrap())
        .await
        .unwrap()
        .unwrap();
    let tree_hash = doc.outs[0].md5.clone();
    assert!(tree_hash.is_tree());
    pretty_assert_eq!(doc.outs[0].nfiles, Some(2));

    // Touch a member's mtime without changing content, then re-add from
    // a fresh repo handle.
    let member = ws.root.try_join_file("dir/a").unwrap();
    cairn::fs::set_mtime(&member, std::time::SystemTime::now())
        .await
        .unwrap();
    ws.reopen().await;
    ws.repo.add(&rel("dir")).await.unwrap();

    let doc = TrackFileDoc::load(&ws.root.try_join_file("dir.cairn").unwrap())
        .await
        .unwrap()
        .unwrap();
    pretty_assert_eq!(doc.outs[0].md5, tree_hash);
}

#[tokio::test]
async fn add_updates_the_sibling_gitignore_when_git_is_present() {
    let ws = workspace(&[("data/raw.csv", "1,2,3\n"), (".git/HEAD", "ref\n")]).await;
    // Reopen so SCM detection sees the .git directory seeded above.
    let repo = cairn::repo::Repo::open(&ws.root).await.unwrap();

    repo.add(&rel("data/raw.csv")).await.unwrap();

    let gitignore = ws.read("data/.gitignore").await;
    pretty_assert_eq!(gitignore, "/raw.csv\n");
}
