//! Pipeline reproduction end to end: plans, selective reruns, the run
//! cache, and graph validation.

use cairn::pipeline::execute::StageFailed;
use cairn::pipeline::graph::OverlappingOutputs;
use pretty_assertions::assert_eq as pretty_assert_eq;

use crate::workspace;

const TWO_STAGES: &str = "stages:\n  one:\n    cmd: cp foo bar\n    deps: [foo]\n    outs: [bar]\n  two:\n    cmd: cp bar baz\n    deps: [bar]\n    outs: [baz]\n";

#[test_log::test(tokio::test)]
async fn first_run_executes_both_then_settles() {
    let ws = workspace(&[("foo", "foo\n"), ("cairn.yaml", TWO_STAGES)]).await;

    let report = ws.repo.reproduce(&[], false, true).await.unwrap();
    pretty_assert_eq!(
        report.ran,
        vec!["cairn.yaml:one".to_string(), "cairn.yaml:two".to_string()]
    );
    pretty_assert_eq!(ws.read("baz").await, "foo\n");

    let report = ws.repo.reproduce(&[], false, true).await.unwrap();
    assert!(report.ran.is_empty());
    pretty_assert_eq!(report.skipped.len(), 2);
}

#[tokio::test]
async fn modified_input_reruns_the_whole_chain() {
    let ws = workspace(&[("foo", "v1\n"), ("cairn.yaml", TWO_STAGES)]).await;
    ws.repo.reproduce(&[], false, true).await.unwrap();

    ws.write("foo", "v2\n").await;
    let report = ws.repo.reproduce(&[], false, true).await.unwrap();
    pretty_assert_eq!(report.ran.len(), 2);
    pretty_assert_eq!(ws.read("baz").await, "v2\n");
}

#[tokio::test]
async fn changed_downstream_cmd_reruns_only_downstream() {
    let ws = workspace(&[("foo", "data\n"), ("cairn.yaml", TWO_STAGES)]).await;
    ws.repo.reproduce(&[], false, true).await.unwrap();

    ws.write(
        "cairn.yaml",
        "stages:\n  one:\n    cmd: cp foo bar\n    deps: [foo]\n    outs: [bar]\n  two:\n    cmd: cat bar > baz\n    deps: [bar]\n    outs: [baz]\n",
    )
    .await;

    let report = ws.repo.reproduce(&[], false, true).await.unwrap();
    pretty_assert_eq!(report.ran, vec!["cairn.yaml:two".to_string()]);
    pretty_assert_eq!(report.skipped, vec!["cairn.yaml:one".to_string()]);
}

#[tokio::test]
async fn targeting_a_stage_runs_its_upstreams_only() {
    let ws = workspace(&[
        ("foo", "f\n"),
        ("other", "o\n"),
        (
            "cairn.yaml",
            "stages:\n  wanted:\n    cmd: cp foo bar\n    deps: [foo]\n    outs: [bar]\n  unrelated:\n    cmd: cp other thing\n    deps: [other]\n    outs: [thing]\n",
        ),
    ])
    .await;

    let report = ws
        .repo
        .reproduce(&["wanted".to_string()], false, true)
        .await
        .unwrap();
    pretty_assert_eq!(report.ran, vec!["cairn.yaml:wanted".to_string()]);
    assert!(!ws.exists("thing").await);
}

#[tokio::test]
async fn overlapping_outputs_fail_before_any_command_runs() {
    let ws = workspace(&[(
        "cairn.yaml",
        "stages:\n  a:\n    cmd: echo a > data/out\n    outs: [data/out]\n  b:\n    cmd: echo b > data/out\n    outs: [data/out]\n",
    )])
    .await;

    let err = ws.repo.reproduce(&[], false, true).await.unwrap_err();
    let overlap = err.downcast_ref::<OverlappingOutputs>().unwrap();
    assert!(overlap.to_string().contains("cairn.yaml:a"));
    assert!(overlap.to_string().contains("cairn.yaml:b"));
    assert!(!ws.exists("data/out").await);
}

#[tokio::test]
async fn run_cache_reuse_across_lockfile_loss() {
    // Simulates switching branches: the lockfile goes away, the inputs
    // do not. The stage must be satisfied from the run cache without
    // spawning, and the rewritten lockfile must record the same hashes.
    let ws = workspace(&[
        ("foo", "foo\n"),
        (
            "cairn.yaml",
            "stages:\n  make:\n    cmd: cp foo bar && echo spawned >> spawn.log\n    deps: [foo]\n    outs: [bar]\n",
        ),
    ])
    .await;

    ws.repo.reproduce(&[], false, true).await.unwrap();
    let lock_before = ws.read("cairn.lock").await;
    pretty_assert_eq!(ws.read("spawn.log").await, "spawned\n");

    ws.remove("cairn.lock").await;
    ws.remove("bar").await;

    let report = ws.repo.reproduce(&[], false, true).await.unwrap();
    pretty_assert_eq!(report.restored, vec!["cairn.yaml:make".to_string()]);
    assert!(report.ran.is_empty());

    // Identical hashes in the recreated lockfile, and no second spawn.
    pretty_assert_eq!(ws.read("cairn.lock").await, lock_before);
    pretty_assert_eq!(ws.read("spawn.log").await, "spawned\n");
    pretty_assert_eq!(ws.read("bar").await, "foo\n");
}

#[tokio::test]
async fn crash_between_command_and_lockfile_reruns_the_stage() {
    // A run that never committed its lockfile must not count. Simulate
    // the crash aftermath: outputs present, lockfile absent, run cache
    // disabled so the rerun has to spawn.
    let ws = workspace(&[
        ("foo", "foo\n"),
        (
            "cairn.yaml",
            "stages:\n  make:\n    cmd: cp foo bar\n    deps: [foo]\n    outs: [bar]\n",
        ),
    ])
    .await;

    ws.repo.reproduce(&[], false, true).await.unwrap();
    ws.remove("cairn.lock").await;

    let report = ws.repo.reproduce(&[], false, false).await.unwrap();
    pretty_assert_eq!(report.ran, vec!["cairn.yaml:make".to_string()]);
}

#[tokio::test]
async fn failed_stage_reports_name_and_exit_code() {
    let ws = workspace(&[(
        "cairn.yaml",
        "stages:\n  boom:\n    cmd: exit 3\n    outs: [never]\n",
    )])
    .await;

    let err = ws.repo.reproduce(&[], false, true).await.unwrap_err();
    let failed = err.downcast_ref::<StageFailed>().unwrap();
    pretty_assert_eq!(failed.stage, "cairn.yaml:boom");
    pretty_assert_eq!(failed.code, 3);
}

#[tokio::test]
async fn params_gate_reruns_at_key_granularity() {
    let ws = workspace(&[
        ("params.yaml", "threshold: 3\nunrelated: 1\n"),
        (
            "cairn.yaml",
            "stages:\n  train:\n    cmd: echo ${threshold} > out\n    params: [threshold]\n    outs: [out]\n",
        ),
    ])
    .await;

    ws.repo.reproduce(&[], false, true).await.unwrap();
    pretty_assert_eq!(ws.read("out").await, "3\n");

    // Editing an unrelated key does not rerun.
    ws.write("params.yaml", "threshold: 3\nunrelated: 99\n").await;
    let report = ws.repo.reproduce(&[], false, true).await.unwrap();
    assert!(report.ran.is_empty(), "report: {report:?}");

    // Editing the declared key does.
    ws.write("params.yaml", "threshold: 7\nunrelated: 99\n").await;
    let report = ws.repo.reproduce(&[], false, true).await.unwrap();
    pretty_assert_eq!(report.ran.len(), 1);
    pretty_assert_eq!(ws.read("out").await, "7\n");
}

#[tokio::test]
async fn foreach_stages_run_independently() {
    let ws = workspace(&[(
        "cairn.yaml",
        "stages:\n  gen:\n    foreach: [us, eu]\n    do:\n      cmd: echo ${item} > region-${item}.txt\n      outs: [\"region-${item}.txt\"]\n",
    )])
    .await;

    let report = ws.repo.reproduce(&[], false, true).await.unwrap();
    pretty_assert_eq!(report.ran.len(), 2);
    pretty_assert_eq!(ws.read("region-us.txt").await, "us\n");
    pretty_assert_eq!(ws.read("region-eu.txt").await, "eu\n");

    // Targeting one instance leaves the other alone.
    ws.remove("region-us.txt").await;
    ws.remove("region-eu.txt").await;
    let report = ws
        .repo
        .reproduce(&["gen@us".to_string()], false, false)
        .await
        .unwrap();
    pretty_assert_eq!(report.ran, vec!["cairn.yaml:gen@us".to_string()]);
    assert!(ws.exists("region-us.txt").await);
    assert!(!ws.exists("region-eu.txt").await);
}
