//! Moving artifacts between workspace, local store, and a remote.

use cairn::config::RemoteConfig;
use cairn::hash::{HashAlgo, HashValue};
use cairn::path::{RelEntryPath, TryJoinWith as _};
use cairn::repo::CheckoutError;
use pretty_assertions::assert_eq as pretty_assert_eq;

use crate::{Workspace, workspace};

/// Point the workspace at a fresh directory remote named `origin`.
async fn with_remote(ws: &mut Workspace) {
    // The store lives inside the scratch directory so tests stay
    // hermetic; the index walk never descends into it because it holds
    // no pipeline or tracking files.
    let store = ws.root.try_join_dir("remote-store").unwrap();

    let mut config = ws.repo.config().clone();
    config.core.remote = Some("origin".into());
    config.remote.insert(
        "origin".into(),
        RemoteConfig {
            url: store.to_string(),
        },
    );
    let config_path = ws
        .root
        .try_join_dir(".cairn")
        .unwrap()
        .try_join_file("config")
        .unwrap();
    config.save(&config_path).await.unwrap();
    ws.reopen().await;
}

fn foo_hash() -> HashValue {
    HashValue::new(HashAlgo::Md5, "acbd18db4cc2f85cedef654fccc4a4d8")
}

#[tokio::test]
async fn checkout_restores_from_local_store() {
    let ws = workspace(&[("foo", "foo")]).await;
    ws.repo
        .add(&RelEntryPath::try_from("foo").unwrap())
        .await
        .unwrap();

    ws.remove("foo").await;
    let report = ws.repo.checkout(&[], false).await.unwrap();
    pretty_assert_eq!(report.restored, vec!["foo".to_string()]);
    pretty_assert_eq!(ws.read("foo").await, "foo");
}

#[tokio::test]
async fn checkout_recovery_needs_fetch_after_store_loss() {
    let mut ws = workspace(&[("foo", "foo")]).await;
    with_remote(&mut ws).await;

    ws.repo
        .add(&RelEntryPath::try_from("foo").unwrap())
        .await
        .unwrap();
    pretty_assert_eq!(ws.repo.push(None).await.unwrap(), 1);

    // Lose both the workspace copy and the local object.
    ws.remove("foo").await;
    ws.repo.odb().remove(&foo_hash()).await.unwrap();

    // Checkout now fails, citing the hash.
    let err = ws.repo.checkout(&[], false).await.unwrap_err();
    let missing = err.downcast_ref::<CheckoutError>().unwrap();
    pretty_assert_eq!(
        missing.missing,
        vec!["acbd18db4cc2f85cedef654fccc4a4d8".to_string()]
    );

    // Fetch, then checkout succeeds.
    pretty_assert_eq!(ws.repo.fetch(None).await.unwrap(), 1);
    let report = ws.repo.checkout(&[], false).await.unwrap();
    pretty_assert_eq!(report.restored, vec!["foo".to_string()]);
    pretty_assert_eq!(ws.read("foo").await, "foo");
}

#[tokio::test]
async fn directories_round_trip_through_the_remote() {
    let mut ws = workspace(&[("data/a.csv", "a"), ("data/sub/b.csv", "b")]).await;
    with_remote(&mut ws).await;

    ws.repo
        .add(&RelEntryPath::try_from("data").unwrap())
        .await
        .unwrap();

    // Tree object plus two members.
    pretty_assert_eq!(ws.repo.push(None).await.unwrap(), 3);

    // Wipe everything local and recover it all.
    let dir = ws.root.try_join_dir("data").unwrap();
    cairn::fs::remove_dir_all(&dir).await.unwrap();
    let gc_untouched: Vec<_> = {
        use futures::TryStreamExt as _;
        ws.repo.odb().list().try_collect().await.unwrap()
    };
    for hash in &gc_untouched {
        ws.repo.odb().remove(hash).await.unwrap();
    }

    pretty_assert_eq!(ws.repo.fetch(None).await.unwrap(), 3);
    let report = ws.repo.checkout(&[], false).await.unwrap();
    pretty_assert_eq!(report.restored, vec!["data".to_string()]);
    pretty_assert_eq!(ws.read("data/a.csv").await, "a");
    pretty_assert_eq!(ws.read("data/sub/b.csv").await, "b");
}

#[tokio::test]
async fn push_is_idempotent_via_the_remote_index() {
    let mut ws = workspace(&[("foo", "foo")]).await;
    with_remote(&mut ws).await;

    ws.repo
        .add(&RelEntryPath::try_from("foo").unwrap())
        .await
        .unwrap();

    pretty_assert_eq!(ws.repo.push(None).await.unwrap(), 1);
    // Nothing new to move the second time.
    pretty_assert_eq!(ws.repo.push(None).await.unwrap(), 0);
}

#[tokio::test]
async fn uncached_outputs_never_reach_the_remote() {
    let mut ws = workspace(&[
        ("foo", "foo\n"),
        (
            "cairn.yaml",
            "stages:\n  make:\n    cmd: cp foo kept && echo loose > loose\n    deps: [foo]\n    outs:\n      - kept\n      - loose:\n          cache: false\n",
        ),
    ])
    .await;
    with_remote(&mut ws).await;

    ws.repo.reproduce(&[], false, true).await.unwrap();

    // Only the cached output travels.
    pretty_assert_eq!(ws.repo.push(None).await.unwrap(), 1);

    // The uncached one never even entered the local store.
    let loose_hash = HashValue::of_bytes(b"loose\n");
    assert!(!ws.repo.odb().exists(&loose_hash).await.unwrap());

    // And checkout leaves it to the user: nothing to restore from.
    ws.remove("loose").await;
    let report = ws.repo.checkout(&[], false).await.unwrap();
    assert!(!report.restored.contains(&"loose".to_string()));
}

#[tokio::test]
async fn reopened_repo_still_sees_the_store() {
    // The store has no in-memory component that matters: a fresh handle
    // checks out from what is on disk.
    let mut ws = workspace(&[("foo", "foo")]).await;
    ws.repo
        .add(&RelEntryPath::try_from("foo").unwrap())
        .await
        .unwrap();

    ws.reopen().await;
    ws.remove("foo").await;
    let report = ws.repo.checkout(&[], false).await.unwrap();
    pretty_assert_eq!(report.restored, vec!["foo".to_string()]);
}
