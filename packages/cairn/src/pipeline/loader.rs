//! Loading pipeline files into resolved stages.
//!
//! The loader is the only place templating exists: it expands `foreach`
//! fan-outs, interpolates `${…}` references, resolves working directories,
//! and hands everything downstream as plain [`Stage`] values with
//! repo-root-relative paths. The graph, decider, and executor never see a
//! template.

use std::collections::BTreeMap;

use color_eyre::{
    Result,
    eyre::{Context as _, bail, eyre},
};
use serde_yaml::Value;
use tracing::{instrument, trace};

use crate::{
    mk_rel_dir,
    path::{AbsDirPath, AbsFilePath, JoinWith as _, RelDirPath, RelEntryPath, RelFilePath},
    pipeline::{
        dep::Dependency,
        lockfile::{LockfileDoc, StageLock, TrackFileDoc},
        out::{Annotations, OutKind, Output},
        params::{self, Context, DEFAULT_PARAMS_FILE},
        schema::{LOCKFILE, OutDecl, ParamDecl, PipelineDoc, StageDef},
        stage::{Stage, StageAddr},
    },
};

/// A pipeline (or tracking) file loaded into resolved stages, paired with
/// its committed lock records.
#[derive(Clone, Debug)]
pub struct LoadedFile {
    /// The source file, repo-root-relative.
    pub file: RelFilePath,

    /// Resolved stages in definition order.
    pub stages: Vec<Stage>,

    /// Lock records keyed by bare stage name.
    pub locks: BTreeMap<String, StageLock>,

    /// Where this file's lock records are written back to.
    pub lock_path: AbsFilePath,
}

/// Load one `cairn.yaml` and its sibling `cairn.lock`.
#[instrument(name = "load_pipeline_file", skip(root))]
pub async fn load_pipeline_file(root: &AbsDirPath, file: &RelFilePath) -> Result<LoadedFile> {
    let abs = root.join(file);
    let text = crate::fs::must_read_buffered_utf8(&abs).await?;
    let doc = PipelineDoc::parse(&file.to_posix(), &text)?;

    let file_dir = file.parent().unwrap_or_else(|| mk_rel_dir!("."));

    // Interpolation context shared by all stages of this file: the default
    // params file plus any the document names.
    let mut base_ctx = Context::new();
    let mut base_files = vec![DEFAULT_PARAMS_FILE.to_string()];
    base_files.extend(doc.params.iter().cloned());
    for params_file in &base_files {
        let path = resolve_rel(&file_dir, params_file)?;
        if let Some(contents) = params::load_params_file(&root.join(&path.as_file())).await? {
            base_ctx
                .merge_file(&contents)
                .with_context(|| format!("merge parameter file {params_file}"))?;
        }
    }

    let mut stages = Vec::new();
    for (name, def) in &doc.stages {
        let expanded = expand_stage(name, def, &base_ctx)
            .with_context(|| format!("stage '{name}' in {}", file.to_posix()))?;
        for (instance_name, resolved) in expanded {
            let stage = stage_from_def(file, &file_dir, &instance_name, resolved)
                .with_context(|| format!("stage '{instance_name}' in {}", file.to_posix()))?;
            stages.push(stage);
        }
    }

    let lock_path = root.join(&file_dir).join(&RelFilePath::try_from(LOCKFILE)?);
    let locks = LockfileDoc::load(&lock_path).await?.stages;

    trace!(file = %file.to_posix(), stages = stages.len(), "loaded pipeline file");
    Ok(LoadedFile {
        file: file.clone(),
        stages,
        locks,
        lock_path,
    })
}

/// Load one legacy tracking file. Its lock records live inline.
#[instrument(name = "load_track_file", skip(root))]
pub async fn load_track_file(root: &AbsDirPath, file: &RelFilePath) -> Result<LoadedFile> {
    let abs = root.join(file);
    let doc = TrackFileDoc::load(&abs)
        .await?
        .ok_or_else(|| eyre!("tracking file does not exist: {}", file.to_posix()))?;

    let file_dir = file.parent().unwrap_or_else(|| mk_rel_dir!("."));
    let wdir = match &doc.wdir {
        Some(wdir) => resolve_rel_dir(&file_dir, wdir)?,
        None => file_dir.clone(),
    };

    let addr = StageAddr::TrackFile { file: file.clone() };
    let name = addr.name();

    let stage = Stage {
        addr,
        wdir: wdir.clone(),
        cmd: doc.cmd.clone().map(|c| c.into_lines()).unwrap_or_default(),
        deps: doc
            .deps
            .iter()
            .map(|entry| Dependency::entry(entry.path.clone()))
            .collect(),
        outs: doc
            .outs
            .iter()
            .map(|entry| Output::new(entry.path.clone(), OutKind::Out))
            .collect(),
        frozen: doc.frozen,
        always_changed: doc.always_changed,
    };

    let lock = StageLock {
        cmd: stage.cmd_display(),
        md5: doc.md5.clone(),
        deps: doc.deps.clone(),
        params: BTreeMap::new(),
        outs: doc.outs.clone(),
    };

    Ok(LoadedFile {
        file: file.clone(),
        stages: vec![stage],
        locks: BTreeMap::from([(name, lock)]),
        lock_path: abs,
    })
}

/// Expand a definition into its instances: one for plain stages, one per
/// element for `foreach` stages. Returns `(instance name, resolved def)`.
fn expand_stage(
    name: &str,
    def: &StageDef,
    base_ctx: &Context,
) -> Result<Vec<(String, StageDef)>> {
    match (&def.foreach, &def.do_) {
        (None, None) => {
            if def.cmd.is_none() {
                bail!("a stage must declare `cmd` (or `foreach` with `do`)");
            }
            let resolved = resolve_def(def, base_ctx)?;
            Ok(vec![(name.to_string(), resolved)])
        }
        (Some(_), None) => bail!("`foreach` requires a `do` block"),
        (None, Some(_)) => bail!("`do` requires `foreach`"),
        (Some(elements), Some(body)) => {
            if body.cmd.is_none() {
                bail!("the `do` block must declare `cmd`");
            }
            let mut instances = Vec::new();
            for (suffix, bindings) in foreach_elements(elements)? {
                let mut ctx = base_ctx.clone();
                for (var, value) in bindings {
                    ctx.bind(var, value);
                }
                let resolved = resolve_def(body, &ctx)
                    .with_context(|| format!("expand element '{suffix}'"))?;
                instances.push((format!("{name}@{suffix}"), resolved));
            }
            Ok(instances)
        }
    }
}

/// The elements of a `foreach` source with their loop-variable bindings.
///
/// Sequences bind `item` and name instances after the item; mappings bind
/// `key` and `item` and name instances after the key.
fn foreach_elements(elements: &Value) -> Result<Vec<(String, Vec<(&'static str, Value)>)>> {
    match elements {
        Value::Sequence(seq) => seq
            .iter()
            .map(|item| {
                let suffix = scalar_suffix(item)?;
                Ok((suffix, vec![("item", item.clone())]))
            })
            .collect(),
        Value::Mapping(map) => map
            .iter()
            .map(|(key, item)| {
                let suffix = scalar_suffix(key)?;
                Ok((
                    suffix,
                    vec![("key", key.clone()), ("item", item.clone())],
                ))
            })
            .collect(),
        _ => bail!("`foreach` must be a sequence or a mapping"),
    }
}

fn scalar_suffix(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => bail!("`foreach` elements must be addressable by a scalar"),
    }
}

/// Interpolate every `${…}` reference in a definition.
fn resolve_def(def: &StageDef, ctx: &Context) -> Result<StageDef> {
    let value = serde_yaml::to_value(def).context("reserialize stage definition")?;
    let resolved = params::interpolate_value(&value, ctx)?;
    serde_yaml::from_value(resolved).context("resolved stage definition no longer validates")
}

/// Turn a resolved definition into a [`Stage`] with repo-relative paths.
fn stage_from_def(
    file: &RelFilePath,
    file_dir: &RelDirPath,
    name: &str,
    def: StageDef,
) -> Result<Stage> {
    let wdir = match &def.wdir {
        Some(wdir) => resolve_rel_dir(file_dir, wdir)?,
        None => file_dir.clone(),
    };

    let cmd = def
        .cmd
        .ok_or_else(|| eyre!("a stage must declare `cmd`"))?
        .into_lines();
    if cmd.is_empty() {
        bail!("`cmd` must not be empty");
    }

    let mut deps: Vec<Dependency> = Vec::new();
    for decl in &def.deps {
        deps.push(Dependency::entry(resolve_rel(&wdir, decl)?));
    }

    // Parameter declarations group by file; bare keys read the default file.
    let mut param_groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for decl in &def.params {
        match decl {
            ParamDecl::Key(key) => param_groups
                .entry(DEFAULT_PARAMS_FILE.to_string())
                .or_default()
                .push(key.clone()),
            ParamDecl::File(map) => {
                for (params_file, keys) in map {
                    param_groups
                        .entry(params_file.clone())
                        .or_default()
                        .extend(keys.iter().cloned());
                }
            }
        }
    }
    for (params_file, keys) in param_groups {
        let path = resolve_rel(&wdir, &params_file)?;
        deps.push(Dependency::params(path, keys));
    }

    let mut outs = Vec::new();
    for (decls, kind) in [
        (&def.outs, OutKind::Out),
        (&def.metrics, OutKind::Metric),
        (&def.plots, OutKind::Plot),
    ] {
        for decl in decls {
            outs.push(out_from_decl(&wdir, decl, kind)?);
        }
    }

    Ok(Stage {
        addr: StageAddr::InFile {
            file: file.clone(),
            name: name.to_string(),
        },
        wdir,
        cmd,
        deps,
        outs,
        frozen: def.frozen,
        always_changed: def.always_changed,
    })
}

fn out_from_decl(wdir: &RelDirPath, decl: &OutDecl, kind: OutKind) -> Result<Output> {
    match decl {
        OutDecl::Path(path) => Ok(Output::new(resolve_rel(wdir, path)?, kind)),
        OutDecl::Flagged(map) => {
            let Some((path, flags)) = map.iter().next() else {
                bail!("flagged output declaration is empty");
            };
            if map.len() > 1 {
                bail!("flagged output declaration must name exactly one path");
            }
            let mut out = Output::new(resolve_rel(wdir, path)?, kind);
            out.cache = flags.cache;
            out.persist = flags.persist;
            out.push = flags.push;
            out.checkpoint = flags.checkpoint;
            out.remote = flags.remote.clone();
            out.annotations = Annotations {
                desc: flags.desc.clone(),
                ty: flags.ty.clone(),
                labels: flags.labels.clone(),
                meta: flags.meta.clone(),
            };
            Ok(out)
        }
    }
}

/// Resolve a declared path against its anchor directory (the stage wdir,
/// both repo-root-relative) and normalize it. `..` that escapes the repo
/// root fails.
fn resolve_rel(anchor_dir: &RelDirPath, declared: &str) -> Result<RelEntryPath> {
    let raw = anchor_dir.as_std_path().join(declared);

    let mut normalized: Vec<std::ffi::OsString> = Vec::new();
    for component in raw.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::Normal(part) => normalized.push(part.to_owned()),
            std::path::Component::ParentDir => {
                if normalized.pop().is_none() {
                    bail!("path {declared:?} escapes the repository root");
                }
            }
            other => bail!("unsupported path component {other:?} in {declared:?}"),
        }
    }
    if normalized.is_empty() {
        bail!("path {declared:?} resolves to the repository root");
    }

    let joined: std::path::PathBuf = normalized.iter().collect();
    RelEntryPath::try_from(joined)
}

/// Resolve a declared working directory against the pipeline file's
/// directory, normalizing `.` and `..`.
fn resolve_rel_dir(file_dir: &RelDirPath, declared: &str) -> Result<RelDirPath> {
    let raw = file_dir.as_std_path().join(declared);
    let mut normalized: Vec<std::ffi::OsString> = Vec::new();
    for component in raw.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::Normal(part) => normalized.push(part.to_owned()),
            std::path::Component::ParentDir => {
                if normalized.pop().is_none() {
                    bail!("working directory {declared:?} escapes the repository root");
                }
            }
            other => bail!("unsupported path component {other:?} in {declared:?}"),
        }
    }
    if normalized.is_empty() {
        return Ok(mk_rel_dir!("."));
    }
    let joined: std::path::PathBuf = normalized.iter().collect();
    RelDirPath::try_from(joined)
}
