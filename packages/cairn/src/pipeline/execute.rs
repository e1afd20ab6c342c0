//! Executing a plan.
//!
//! Stages run sequentially in topological order. Per stage the executor:
//!
//! 1. hashes dependencies and computes the run-hash;
//! 2. consults the run cache; on a hit the recorded outputs are linked
//!    back into the workspace (pulling objects from the remote if needed)
//!    and the command never spawns;
//! 3. on a miss, spawns the command through the platform shell and waits,
//!    forwarding interrupts and polling the checkpoint signal file for
//!    checkpoint stages;
//! 4. on success, hashes and ingests the declared outputs, then writes the
//!    lockfile.
//!
//! The lockfile write is last, which is the whole crash story: dying
//! between command exit and lockfile commit leaves the previous record in
//! place, and the next invocation sees changed outputs and reruns.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use color_eyre::{
    Result,
    eyre::{Context as _, bail, eyre},
};
use derive_more::{Display, Error};
use tracing::{debug, instrument, trace, warn};

use crate::{
    fs,
    hash::HashValue,
    ignorefile::IgnoreRules,
    link::Linker,
    odb::{Odb, build, tree::Tree},
    path::{AbsDirPath, AbsFilePath, JoinWith as _, RelFilePath},
    pipeline::{
        loader::LoadedFile,
        lockfile::{LockedEntry, LockfileDoc, StageLock, TrackFileDoc},
        graph::StageGraph,
        run_cache::{RunCache, RunRecord, run_hash},
        schema::Command,
        stage::{Stage, StageAddr},
        status::{self, WorkspaceCtx},
    },
    progress::TransferBar,
    remote::{BlobStore, RemoteIndex},
    scm::Scm,
    state::StateIndex,
    transfer,
};

/// Where the checkpoint signal file lives, relative to the repo root.
pub const CHECKPOINT_SIGNAL: &str = ".cairn/tmp/checkpoint";

/// How often the checkpoint monitor polls the signal file.
const CHECKPOINT_POLL: Duration = Duration::from_millis(200);

/// A user command exited non-zero.
#[derive(Clone, Debug, Display, Error)]
#[display("stage '{stage}' failed with exit code {code}")]
pub struct StageFailed {
    pub stage: String,
    pub code: i32,
}

/// The run was interrupted; the lockfile was not updated.
#[derive(Clone, Debug, Display, Error)]
#[display("interrupted while running stage '{stage}'")]
pub struct Interrupted {
    pub stage: String,
}

/// A remote paired with its presence index.
#[derive(Clone, Debug)]
pub struct Remote<S: BlobStore> {
    pub store: S,
    pub index: RemoteIndex,
}

/// How a stage in the plan was satisfied.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Outcome {
    Ran,
    Restored,
}

/// What an execution did, stage by stage.
#[derive(Clone, Debug, Default)]
pub struct ExecReport {
    /// Stages whose command was spawned.
    pub ran: Vec<String>,
    /// Stages satisfied from the run cache without spawning.
    pub restored: Vec<String>,
    /// Stages that were already up to date.
    pub skipped: Vec<String>,
}

/// Everything stage execution needs to see of the repo.
pub struct Executor<'a, S: BlobStore> {
    pub root: &'a AbsDirPath,
    pub odb: &'a Odb,
    pub state: &'a StateIndex,
    pub ignore: &'a IgnoreRules,
    pub linker: &'a Linker,
    pub run_cache: &'a RunCache,
    pub scm: &'a dyn Scm,
    pub remote: Option<Remote<S>>,
    pub jobs: usize,
    /// Allows disabling run-cache reuse (`repro --no-run-cache`).
    pub use_run_cache: bool,
}

/// Per-file lock bookkeeping during execution.
struct FileLocks {
    lock_path: AbsFilePath,
    doc: LockfileDoc,
    /// Tracking files write themselves back instead of a sibling lockfile.
    track: bool,
}

impl<'a, S: BlobStore> Executor<'a, S> {
    fn ctx(&self) -> WorkspaceCtx<'a> {
        WorkspaceCtx {
            root: self.root,
            state: self.state,
            ignore: self.ignore,
        }
    }

    /// Execute the plan derived from `files`, limited to `targets` (empty
    /// means everything). `force` reruns stages regardless of status;
    /// frozen stages are never run either way.
    ///
    /// Execution stops at the first failing stage; stages that already
    /// committed stay committed.
    #[instrument(name = "Executor::execute", skip_all, fields(targets = ?targets))]
    pub async fn execute(
        &self,
        files: Vec<LoadedFile>,
        targets: &[String],
        force: bool,
    ) -> Result<ExecReport> {
        let mut locks: BTreeMap<String, FileLocks> = BTreeMap::new();
        let mut all_stages = Vec::new();
        for file in &files {
            let track = file
                .stages
                .first()
                .is_some_and(|s| matches!(s.addr, StageAddr::TrackFile { .. }));
            let mut doc = LockfileDoc::default();
            doc.stages = file.locks.clone();
            locks.insert(
                file.file.to_posix(),
                FileLocks {
                    lock_path: file.lock_path.clone(),
                    doc,
                    track,
                },
            );
            all_stages.extend(file.stages.iter().cloned());
        }

        let graph = StageGraph::build(all_stages)?;
        let plan = graph.plan_for(targets)?;
        debug!(stages = plan.len(), "plan ready");

        let mut report = ExecReport::default();
        for stage in plan {
            let addr = stage.addr.to_string();
            let file_key = stage.addr.file().to_posix();
            let lock = locks
                .get(&file_key)
                .and_then(|f| f.doc.stages.get(&stage.addr.name()));

            let stage_state = status::stage_status(self.ctx(), stage, lock).await?;
            if stage_state.up_to_date() && !(force && !stage_state.frozen) {
                trace!(stage = %addr, "up to date");
                report.skipped.push(addr);
                continue;
            }

            let (new_lock, outcome) = self.run_stage(stage).await?;

            let file_locks = locks
                .get_mut(&file_key)
                .ok_or_else(|| eyre!("no lock bookkeeping for {file_key}"))?;
            file_locks
                .doc
                .stages
                .insert(stage.addr.name(), new_lock);
            self.commit_locks(stage, file_locks).await?;

            match outcome {
                Outcome::Ran => report.ran.push(addr),
                Outcome::Restored => report.restored.push(addr),
            }
        }

        Ok(report)
    }

    /// Write a file's lock records back to disk.
    async fn commit_locks(&self, stage: &Stage, file_locks: &FileLocks) -> Result<()> {
        if file_locks.track {
            let lock = file_locks
                .doc
                .stages
                .get(&stage.addr.name())
                .ok_or_else(|| eyre!("missing lock record for {}", stage.addr))?;
            let doc = TrackFileDoc {
                cmd: if stage.cmd.is_empty() {
                    None
                } else {
                    Some(Command::Lines(stage.cmd.clone()))
                },
                wdir: None,
                md5: lock.md5.clone(),
                deps: lock.deps.clone(),
                outs: lock.outs.clone(),
                frozen: stage.frozen,
                always_changed: stage.always_changed,
            };
            doc.save(&file_locks.lock_path).await
        } else {
            file_locks.doc.save(&file_locks.lock_path).await
        }
    }

    /// Satisfy one stage: restore it from the run cache or run it.
    #[instrument(name = "Executor::run_stage", skip_all, fields(stage = %stage.addr))]
    async fn run_stage(&self, stage: &Stage) -> Result<(StageLock, Outcome)> {
        // Dependencies first; a missing dependency is an error here (the
        // graph already resolved pipeline-internal deps, so this is a
        // workspace input that does not exist).
        let mut dep_entries = Vec::new();
        let mut params_map = BTreeMap::new();
        for dep in &stage.deps {
            if dep.is_params() {
                let values = status::current_param_values(self.ctx(), dep).await?;
                params_map.insert(dep.path.to_posix(), values);
                continue;
            }
            let abs = self.root.join(&dep.path);
            if !fs::exists(abs.as_std_path()).await {
                bail!(
                    "stage '{}' depends on '{}', which does not exist",
                    stage.addr,
                    dep.path.to_posix()
                );
            }
            let built = build::build(self.state, self.ignore, &abs).await?;
            dep_entries.push(LockedEntry::new(dep.path.clone(), built.hash, &built.meta));
        }

        // Run-cache reuse, when every output can come back out of the
        // store byte-for-byte.
        let cacheable = !stage.always_changed
            && !stage.is_data_only()
            && stage.outs.iter().all(|out| out.cache && !out.persist);
        let key = run_hash(&stage.cmd, &dep_entries, &params_map)?;
        if self.use_run_cache && cacheable {
            if let Some(record) = self.run_cache.restore(&key).await? {
                let recorded: BTreeSet<String> =
                    record.outs.iter().map(|e| e.path.to_posix()).collect();
                let declared: BTreeSet<String> =
                    stage.outs.iter().map(|o| o.path.to_posix()).collect();
                if recorded == declared {
                    if self.try_restore(&record).await? {
                        debug!(stage = %stage.addr, "restored from run cache");
                        let lock = StageLock {
                            cmd: stage.cmd_display(),
                            md5: Some(stage.content_hash()?),
                            deps: dep_entries,
                            params: params_map,
                            outs: record.outs.clone(),
                        };
                        return Ok((lock, Outcome::Restored));
                    }
                } else {
                    trace!(stage = %stage.addr, "run record outputs do not match declaration");
                }
            }
        }

        if stage.is_data_only() {
            // Tracking stages have nothing to spawn; re-commit whatever
            // the workspace holds.
            self.commit_data_stage(stage, dep_entries, params_map).await
        } else {
            self.spawn_and_commit(stage, dep_entries, params_map, cacheable)
                .await
        }
    }

    /// Restore a recorded run into the workspace. Returns false when the
    /// objects cannot be produced (absent locally, no or failing remote),
    /// in which case the caller falls back to running the command.
    async fn try_restore(&self, record: &RunRecord) -> Result<bool> {
        let wanted: Vec<HashValue> = record.outs.iter().map(|e| e.md5.clone()).collect();

        let missing = self.missing_objects(&wanted).await?;
        if !missing.is_empty() {
            let Some(remote) = &self.remote else {
                debug!(missing = missing.len(), "run record objects absent, no remote");
                return Ok(false);
            };
            let bar = TransferBar::new(missing.len() as u64, "fetching run outputs");
            let fetched = transfer::fetch(
                self.odb,
                &remote.store,
                &remote.index,
                wanted.iter().cloned(),
                self.jobs,
                &bar,
            )
            .await;
            if let Err(err) = fetched {
                warn!(?err, "could not fetch run outputs");
                return Ok(false);
            }
        }

        for entry in &record.outs {
            let dst = self.root.join(&entry.path);
            self.linker.materialize(self.odb, &entry.md5, &dst).await?;
            self.scm.ignore(&dst)?;
        }
        Ok(true)
    }

    /// Which of `hashes` (expanding trees) are absent from the local store.
    async fn missing_objects(&self, hashes: &[HashValue]) -> Result<Vec<HashValue>> {
        let mut missing = Vec::new();
        for hash in hashes {
            if !self.odb.exists(hash).await? {
                missing.push(hash.clone());
                continue;
            }
            if hash.is_tree() {
                let tree = Tree::parse(&self.odb.must_get(hash).await?)?;
                for entry in tree.entries() {
                    if !self.odb.exists(&entry.hash).await? {
                        missing.push(entry.hash.clone());
                    }
                }
            }
        }
        Ok(missing)
    }

    /// Hash and commit a data-only (tracking) stage.
    async fn commit_data_stage(
        &self,
        stage: &Stage,
        dep_entries: Vec<LockedEntry>,
        params_map: BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,
    ) -> Result<(StageLock, Outcome)> {
        let out_entries = self.collect_outs(stage).await?;
        let lock = StageLock {
            cmd: stage.cmd_display(),
            md5: Some(stage.content_hash()?),
            deps: dep_entries,
            params: params_map,
            outs: out_entries,
        };
        Ok((lock, Outcome::Ran))
    }

    /// Spawn the stage command, monitor it, and commit its results.
    async fn spawn_and_commit(
        &self,
        stage: &Stage,
        dep_entries: Vec<LockedEntry>,
        params_map: BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,
        cacheable: bool,
    ) -> Result<(StageLock, Outcome)> {
        // Stale non-persistent outputs are removed so the command starts
        // from a clean slate and cannot silently append.
        for out in &stage.outs {
            if out.persist {
                continue;
            }
            let abs = self.root.join(&out.path);
            if fs::is_dir(abs.as_std_path()).await {
                fs::remove_dir_all(&abs.as_dir()).await?;
            } else {
                fs::remove_file_if_exists(&abs.as_file()).await?;
            }
        }

        let exit = self.spawn_and_wait(stage).await?;
        if let Some(code) = exit {
            return Err(StageFailed {
                stage: stage.addr.to_string(),
                code,
            }
            .into());
        }

        let out_entries = self.collect_outs(stage).await?;

        let lock = StageLock {
            cmd: stage.cmd_display(),
            md5: Some(stage.content_hash()?),
            deps: dep_entries.clone(),
            params: params_map.clone(),
            outs: out_entries.clone(),
        };

        if cacheable {
            let record = RunRecord {
                cmd: stage.cmd.clone(),
                deps: dep_entries,
                params: params_map,
                outs: out_entries,
            };
            self.run_cache.save(&record).await?;
        }

        Ok((lock, Outcome::Ran))
    }

    /// Spawn the command and wait for it, forwarding interrupts and
    /// servicing checkpoint signals. Returns `Some(code)` on non-zero exit.
    async fn spawn_and_wait(&self, stage: &Stage) -> Result<Option<i32>> {
        let script = stage.cmd.join("\n");
        let cwd = self.root.join(&stage.wdir);
        fs::create_dir_all(&cwd).await?;

        #[cfg(unix)]
        let mut command = {
            let mut c = tokio::process::Command::new("sh");
            c.arg("-c").arg(&script);
            c
        };
        #[cfg(windows)]
        let mut command = {
            let mut c = tokio::process::Command::new("cmd");
            c.arg("/C").arg(&script);
            c
        };

        command
            .current_dir(cwd.as_std_path())
            .env("CAIRN_ROOT", self.root.as_os_str());
        if stage.has_checkpoints() {
            command.env("CAIRN_CHECKPOINT", "1");
        }

        debug!(stage = %stage.addr, %script, "spawning command");
        let mut child = command
            .spawn()
            .with_context(|| format!("spawn command for stage '{}'", stage.addr))?;

        let signal = self
            .root
            .join(&RelFilePath::try_from(CHECKPOINT_SIGNAL)?);

        enum Tick {
            Exited(std::process::ExitStatus),
            Interrupted,
            Poll,
        }

        let status = loop {
            let tick = tokio::select! {
                exit = child.wait() => Tick::Exited(exit.context("wait for command")?),
                _ = tokio::signal::ctrl_c() => Tick::Interrupted,
                _ = tokio::time::sleep(CHECKPOINT_POLL), if stage.has_checkpoints() => Tick::Poll,
            };
            match tick {
                Tick::Exited(status) => break status,
                Tick::Interrupted => {
                    // The subprocess shares the terminal and receives the
                    // interrupt itself; wait for it so the workspace is
                    // not inspected mid-write. The lockfile stays as it
                    // was.
                    let _ = child.wait().await;
                    return Err(Interrupted {
                        stage: stage.addr.to_string(),
                    }
                    .into());
                }
                Tick::Poll => {
                    if fs::exists(signal.as_std_path()).await {
                        self.commit_checkpoints(stage).await?;
                        fs::remove_file_if_exists(&signal).await?;
                    }
                }
            }
        };

        if status.success() {
            Ok(None)
        } else {
            Ok(Some(status.code().unwrap_or(-1)))
        }
    }

    /// Ingest checkpoint outputs mid-run, so a later crash loses nothing.
    async fn commit_checkpoints(&self, stage: &Stage) -> Result<()> {
        for out in stage.outs.iter().filter(|out| out.checkpoint) {
            let abs = self.root.join(&out.path);
            if !fs::exists(abs.as_std_path()).await {
                continue;
            }
            let built = build::build(self.state, self.ignore, &abs).await?;
            build::ingest(self.odb, &built, &abs).await?;
            trace!(out = %out.path, hash = %built.hash, "checkpoint committed");
        }
        Ok(())
    }

    /// Hash every declared output, ingesting the cached ones.
    async fn collect_outs(&self, stage: &Stage) -> Result<Vec<LockedEntry>> {
        let mut entries = Vec::new();
        for out in &stage.outs {
            let abs = self.root.join(&out.path);
            if !fs::exists(abs.as_std_path()).await {
                bail!(
                    "stage '{}' did not produce declared output '{}'",
                    stage.addr,
                    out.path.to_posix()
                );
            }
            let built = build::build(self.state, self.ignore, &abs).await?;
            if out.cache {
                build::ingest(self.odb, &built, &abs).await?;
                self.scm.ignore(&abs)?;
            }
            entries.push(LockedEntry::new(out.path.clone(), built.hash, &built.meta));
        }
        Ok(entries)
    }
}
