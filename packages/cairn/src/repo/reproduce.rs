//! `reproduce`: execute the plan.

use color_eyre::Result;
use tracing::instrument;

use crate::{
    index::Index,
    pipeline::execute::{ExecReport, Executor},
    repo::Repo,
};

impl Repo {
    /// Run everything stale in (or upstream of) `targets`.
    ///
    /// Takes the repo-wide advisory lock for the duration; a concurrent
    /// run against the same repo fails fast instead of interleaving
    /// lockfile writes.
    #[instrument(name = "Repo::reproduce", skip(self))]
    pub async fn reproduce(
        &self,
        targets: &[String],
        force: bool,
        use_run_cache: bool,
    ) -> Result<ExecReport> {
        let guard = self.lock().await?;

        let index = Index::load(self.root(), self.ignore()).await?;
        let executor = Executor {
            root: self.root(),
            odb: self.odb(),
            state: self.state(),
            ignore: self.ignore(),
            linker: self.linker(),
            run_cache: self.run_cache(),
            scm: self.scm(),
            remote: self.remote(None).ok().flatten(),
            jobs: self.config().jobs(),
            use_run_cache,
        };

        let result = executor.execute(index.files, targets, force).await;
        guard.unlock().await?;
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::fs;
    use crate::path::{AbsDirPath, TryJoinWith as _};
    use crate::repo::Repo;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    async fn repo_with(files: &[(&str, &str)]) -> (tempfile::TempDir, Repo) {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        for (path, content) in files {
            let target = root.try_join_file(path).unwrap();
            fs::write(&target, content).await.unwrap();
        }
        let repo = Repo::init(&root, false).await.unwrap();
        (dir, repo)
    }

    #[tokio::test]
    async fn two_stage_pipeline_runs_then_settles() {
        let (_guard, repo) = repo_with(&[
            ("foo", "foo content\n"),
            (
                "cairn.yaml",
                "stages:\n  first:\n    cmd: cp foo bar\n    deps: [foo]\n    outs: [bar]\n  second:\n    cmd: cp bar baz\n    deps: [bar]\n    outs: [baz]\n",
            ),
        ])
        .await;

        let report = repo.reproduce(&[], false, true).await.unwrap();
        pretty_assert_eq!(report.ran.len(), 2);
        assert!(report.skipped.is_empty());

        let baz = repo.root().try_join_file("baz").unwrap();
        pretty_assert_eq!(
            fs::must_read_buffered(&baz).await.unwrap(),
            b"foo content\n"
        );

        // A second invocation runs nothing.
        let report = repo.reproduce(&[], false, true).await.unwrap();
        assert!(report.ran.is_empty(), "report: {report:?}");
        pretty_assert_eq!(report.skipped.len(), 2);
    }

    #[tokio::test]
    async fn editing_a_dep_reruns_downstream_only_from_there() {
        let (_guard, repo) = repo_with(&[
            ("foo", "v1\n"),
            (
                "cairn.yaml",
                "stages:\n  first:\n    cmd: cp foo bar\n    deps: [foo]\n    outs: [bar]\n  second:\n    cmd: cp bar baz\n    deps: [bar]\n    outs: [baz]\n",
            ),
        ])
        .await;

        repo.reproduce(&[], false, true).await.unwrap();

        // Modify the root input: both stages rerun.
        let foo = repo.root().try_join_file("foo").unwrap();
        fs::write(&foo, b"v2\n").await.unwrap();
        let report = repo.reproduce(&[], false, true).await.unwrap();
        pretty_assert_eq!(report.ran.len(), 2);

        let baz = repo.root().try_join_file("baz").unwrap();
        pretty_assert_eq!(fs::must_read_buffered(&baz).await.unwrap(), b"v2\n");
    }

    #[tokio::test]
    async fn changing_one_cmd_reruns_only_that_stage() {
        let (_guard, repo) = repo_with(&[
            ("foo", "data\n"),
            (
                "cairn.yaml",
                "stages:\n  first:\n    cmd: cp foo bar\n    deps: [foo]\n    outs: [bar]\n  second:\n    cmd: cp bar baz\n    deps: [bar]\n    outs: [baz]\n",
            ),
        ])
        .await;

        repo.reproduce(&[], false, true).await.unwrap();

        // Change only the second stage's command (same output content).
        let pipeline = repo.root().try_join_file("cairn.yaml").unwrap();
        fs::write(
            &pipeline,
            "stages:\n  first:\n    cmd: cp foo bar\n    deps: [foo]\n    outs: [bar]\n  second:\n    cmd: cat bar > baz\n    deps: [bar]\n    outs: [baz]\n",
        )
        .await
        .unwrap();

        let report = repo.reproduce(&[], false, true).await.unwrap();
        pretty_assert_eq!(report.ran, vec!["cairn.yaml:second".to_string()]);
        pretty_assert_eq!(report.skipped, vec!["cairn.yaml:first".to_string()]);
    }

    #[tokio::test]
    async fn failing_stage_stops_the_plan_and_keeps_the_lock_intact() {
        let (_guard, repo) = repo_with(&[
            ("foo", "x\n"),
            (
                "cairn.yaml",
                "stages:\n  first:\n    cmd: cp foo bar\n    deps: [foo]\n    outs: [bar]\n  second:\n    cmd: \"false\"\n    deps: [bar]\n    outs: [baz]\n",
            ),
        ])
        .await;

        let err = repo.reproduce(&[], false, true).await.unwrap_err();
        let failed = err
            .downcast_ref::<crate::pipeline::execute::StageFailed>()
            .unwrap();
        pretty_assert_eq!(failed.stage, "cairn.yaml:second");
        pretty_assert_eq!(failed.code, 1);

        // The first stage committed; rerunning skips it and fails on the
        // second again.
        let err = repo.reproduce(&[], false, true).await.unwrap_err();
        assert!(
            err.downcast_ref::<crate::pipeline::execute::StageFailed>()
                .is_some()
        );
    }

    #[tokio::test]
    async fn run_cache_restores_without_spawning() {
        let (_guard, repo) = repo_with(&[
            ("foo", "stable input\n"),
            (
                "cairn.yaml",
                // The command appends to a side file so spawns are
                // observable.
                "stages:\n  make:\n    cmd: cp foo bar && echo ran >> spawn.log\n    deps: [foo]\n    outs: [bar]\n",
            ),
        ])
        .await;

        repo.reproduce(&[], false, true).await.unwrap();
        let spawn_log = repo.root().try_join_file("spawn.log").unwrap();
        let first = fs::must_read_buffered_utf8(&spawn_log).await.unwrap();
        pretty_assert_eq!(first, "ran\n");

        // Drop the output and the lockfile, simulating a fresh clone of
        // the same inputs.
        let bar = repo.root().try_join_file("bar").unwrap();
        fs::remove_file(&bar).await.unwrap();
        let lock = repo.root().try_join_file("cairn.lock").unwrap();
        fs::remove_file(&lock).await.unwrap();

        let report = repo.reproduce(&[], false, true).await.unwrap();
        pretty_assert_eq!(report.restored, vec!["cairn.yaml:make".to_string()]);
        assert!(report.ran.is_empty());

        // The output is back and the command did not run again.
        pretty_assert_eq!(
            fs::must_read_buffered(&bar).await.unwrap(),
            b"stable input\n"
        );
        let second = fs::must_read_buffered_utf8(&spawn_log).await.unwrap();
        pretty_assert_eq!(second, "ran\n");
    }

    #[tokio::test]
    async fn frozen_stages_do_not_run() {
        let (_guard, repo) = repo_with(&[(
            "cairn.yaml",
            "stages:\n  never:\n    cmd: echo no > out\n    outs: [out]\n    frozen: true\n",
        )])
        .await;

        let report = repo.reproduce(&[], false, true).await.unwrap();
        pretty_assert_eq!(report.skipped.len(), 1);
        assert!(report.ran.is_empty());

        let out = repo.root().try_join_file("out").unwrap();
        assert!(!fs::exists(out.as_std_path()).await);
    }
}
