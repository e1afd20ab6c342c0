//! The rerun decider.
//!
//! A stage is up to date iff its command matches the lockfile, every
//! dependency and output hashes to what the lockfile recorded, every output
//! is present (uncached outputs are checked for presence only), and the
//! stage is not always-changed. Frozen stages are up to date by fiat.
//!
//! Nothing here mutates anything: status hashes through the state index
//! but never ingests, so `status` is safe to run concurrently with
//! everything except a concurrent `repro` of the same pipeline (which the
//! repo lock prevents anyway).

use std::collections::BTreeMap;

use color_eyre::Result;
use derive_more::Display;
use serde::Serialize;
use tracing::instrument;

use crate::{
    fs,
    ignorefile::IgnoreRules,
    odb::build,
    path::{AbsDirPath, JoinWith as _},
    pipeline::{
        dep::Dependency,
        lockfile::StageLock,
        params::{self, Context},
        stage::Stage,
    },
    state::StateIndex,
};

/// What the decider needs to see of the workspace.
#[derive(Clone, Copy, Debug)]
pub struct WorkspaceCtx<'a> {
    pub root: &'a AbsDirPath,
    pub state: &'a StateIndex,
    pub ignore: &'a IgnoreRules,
}

/// Why an entry counts as changed.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Present but hashing differently than the lockfile.
    #[display("modified")]
    Modified,

    /// Declared but absent from the workspace.
    #[display("missing")]
    Missing,

    /// Declared but never committed to the lockfile.
    #[display("not in lock")]
    NotInLock,
}

/// The decider's verdict for one stage.
#[derive(Clone, Debug, Default, Serialize)]
pub struct StageStatus {
    pub frozen: bool,
    pub always_changed: bool,
    pub missing_lock: bool,
    pub changed_cmd: bool,
    pub changed_deps: Vec<(String, ChangeKind)>,
    pub changed_outs: Vec<(String, ChangeKind)>,
}

impl StageStatus {
    /// The single predicate everything else hangs off.
    pub fn up_to_date(&self) -> bool {
        if self.frozen {
            return true;
        }
        !(self.always_changed
            || self.missing_lock
            || self.changed_cmd
            || !self.changed_deps.is_empty()
            || !self.changed_outs.is_empty())
    }
}

/// Decide whether `stage` needs to rerun given its lock record.
#[instrument(name = "stage_status", skip_all, fields(stage = %stage.addr))]
pub async fn stage_status(
    ctx: WorkspaceCtx<'_>,
    stage: &Stage,
    lock: Option<&StageLock>,
) -> Result<StageStatus> {
    // Frozen wins before any hashing happens.
    if stage.frozen {
        return Ok(StageStatus {
            frozen: true,
            ..StageStatus::default()
        });
    }

    let mut status = StageStatus {
        always_changed: stage.always_changed,
        ..StageStatus::default()
    };

    let Some(lock) = lock else {
        status.missing_lock = true;
        return Ok(status);
    };

    if lock.cmd != stage.cmd_display() {
        status.changed_cmd = true;
    }

    for dep in &stage.deps {
        if let Some(change) = dep_change(ctx, dep, lock).await? {
            status.changed_deps.push((dep.path.to_posix(), change));
        }
    }

    for out in &stage.outs {
        let abs = ctx.root.join(&out.path);
        if !fs::exists(abs.as_std_path()).await {
            status.changed_outs.push((out.path.to_posix(), ChangeKind::Missing));
            continue;
        }
        let Some(entry) = lock.outs.iter().find(|e| e.path == out.path) else {
            status.changed_outs.push((out.path.to_posix(), ChangeKind::NotInLock));
            continue;
        };
        // Uncached outputs only need to exist; their content is the
        // user's business.
        if !out.cache {
            continue;
        }
        let built = build::build(ctx.state, ctx.ignore, &abs).await?;
        if built.hash != entry.md5 {
            status.changed_outs.push((out.path.to_posix(), ChangeKind::Modified));
        }
    }

    Ok(status)
}

/// Compare one dependency against the lock record.
async fn dep_change(
    ctx: WorkspaceCtx<'_>,
    dep: &Dependency,
    lock: &StageLock,
) -> Result<Option<ChangeKind>> {
    let abs = ctx.root.join(&dep.path);

    if let Some(keys) = &dep.param_keys {
        let current = current_param_values(ctx, dep).await?;
        let Some(locked) = lock.params.get(&dep.path.to_posix()) else {
            return Ok(Some(ChangeKind::NotInLock));
        };
        for key in keys {
            if locked.get(key) != current.get(key) {
                return Ok(Some(ChangeKind::Modified));
            }
        }
        return Ok(None);
    }

    if !fs::exists(abs.as_std_path()).await {
        return Ok(Some(ChangeKind::Missing));
    }
    let Some(entry) = lock.deps.iter().find(|e| e.path == dep.path) else {
        return Ok(Some(ChangeKind::NotInLock));
    };
    let built = build::build(ctx.state, ctx.ignore, &abs).await?;
    Ok((built.hash != entry.md5).then_some(ChangeKind::Modified))
}

/// The present values of a parameter dependency's keys.
pub async fn current_param_values(
    ctx: WorkspaceCtx<'_>,
    dep: &Dependency,
) -> Result<BTreeMap<String, serde_yaml::Value>> {
    let keys = dep.param_keys.as_deref().unwrap_or_default();
    let abs = ctx.root.join(&dep.path.as_file());
    let mut file_ctx = Context::new();
    if let Some(contents) = params::load_params_file(&abs).await? {
        file_ctx.merge_file(&contents)?;
    }
    params::select_keys(&file_ctx, keys)
}
