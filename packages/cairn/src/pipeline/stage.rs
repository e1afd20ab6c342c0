//! The stage entity.
//!
//! A stage has two identities. Its *address* (`<file>:<name>`, or just the
//! file path for single-stage tracking files) is how users refer to it.
//! Its *content identity* is the hash of its resolved definition, which is
//! what the run cache keys on: two stages with different addresses but
//! identical definitions are the same computation.

use std::fmt;

use color_eyre::{Result, eyre::Context};
use serde::Serialize;

use crate::{
    hash::HashValue,
    path::{RelDirPath, RelFilePath},
    pipeline::{dep::Dependency, out::Output},
};

/// How users address a stage.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum StageAddr {
    /// A named stage inside a pipeline file.
    InFile { file: RelFilePath, name: String },

    /// A legacy single-stage tracking file; the file path is the address.
    TrackFile { file: RelFilePath },
}

impl StageAddr {
    /// The stage's bare name: the `name` part, or the file stem for
    /// tracking files.
    pub fn name(&self) -> String {
        match self {
            Self::InFile { name, .. } => name.clone(),
            Self::TrackFile { file } => file.to_posix(),
        }
    }

    /// The file the stage definition lives in.
    pub fn file(&self) -> &RelFilePath {
        match self {
            Self::InFile { file, .. } => file,
            Self::TrackFile { file } => file,
        }
    }
}

impl fmt::Display for StageAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InFile { file, name } => write!(f, "{}:{name}", file.to_posix()),
            Self::TrackFile { file } => write!(f, "{}", file.to_posix()),
        }
    }
}

/// A fully resolved unit of computation.
///
/// All templating and `foreach` fan-out happened in the loader; paths are
/// repo-root-relative; `cmd` is in canonical list form. This is the shape
/// the graph, the rerun decider, and the executor operate on.
#[derive(Clone, Debug)]
pub struct Stage {
    /// User-facing address.
    pub addr: StageAddr,

    /// Working directory for the command, relative to the repo root.
    pub wdir: RelDirPath,

    /// The command in canonical list form; a scalar `cmd` is a one-element
    /// list. Joined with newlines for display and for the lockfile.
    pub cmd: Vec<String>,

    pub deps: Vec<Dependency>,
    pub outs: Vec<Output>,

    /// Frozen stages are always treated as up to date until unfrozen.
    pub frozen: bool,

    /// Always-changed stages are never up to date (import-like stages).
    pub always_changed: bool,
}

/// The serialized shape the content hash is computed over.
///
/// Only fields that change the computation participate; the address does
/// not, which is exactly what makes run-cache reuse across files and
/// branches possible.
#[derive(Serialize)]
struct StageIdentity<'a> {
    cmd: &'a [String],
    wdir: String,
    deps: Vec<&'a Dependency>,
    outs: Vec<&'a Output>,
}

impl Stage {
    /// The command joined for display and for the lockfile.
    pub fn cmd_display(&self) -> String {
        self.cmd.join("\n")
    }

    /// Whether the stage tracks data without running a command.
    pub fn is_data_only(&self) -> bool {
        self.cmd.is_empty()
    }

    /// Whether any output participates in checkpoint signalling.
    pub fn has_checkpoints(&self) -> bool {
        self.outs.iter().any(|out| out.checkpoint)
    }

    /// The stage's content identity: a hash of its resolved definition.
    pub fn content_hash(&self) -> Result<HashValue> {
        let mut deps: Vec<&Dependency> = self.deps.iter().collect();
        deps.sort_by(|a, b| a.path.cmp(&b.path));
        let mut outs: Vec<&Output> = self.outs.iter().collect();
        outs.sort_by(|a, b| a.path.cmp(&b.path));

        let identity = StageIdentity {
            cmd: &self.cmd,
            wdir: self.wdir.to_posix(),
            deps,
            outs,
        };
        let bytes = serde_json::to_vec(&identity).context("serialize stage identity")?;
        Ok(HashValue::of_bytes(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mk_rel_dir;
    use crate::path::RelEntryPath;
    use crate::pipeline::out::OutKind;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn stage(name: &str, cmd: &[&str]) -> Stage {
        Stage {
            addr: StageAddr::InFile {
                file: RelFilePath::try_from("cairn.yaml").unwrap(),
                name: name.to_string(),
            },
            wdir: mk_rel_dir!("."),
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            deps: vec![Dependency::entry(RelEntryPath::try_from("foo").unwrap())],
            outs: vec![Output::new(RelEntryPath::try_from("bar").unwrap(), OutKind::Out)],
            frozen: false,
            always_changed: false,
        }
    }

    #[test]
    fn address_rendering() {
        let s = stage("train", &["python train.py"]);
        pretty_assert_eq!(s.addr.to_string(), "cairn.yaml:train");

        let track = StageAddr::TrackFile {
            file: RelFilePath::try_from("foo.cairn").unwrap(),
        };
        pretty_assert_eq!(track.to_string(), "foo.cairn");
    }

    #[test]
    fn content_hash_ignores_address() {
        let a = stage("first", &["do thing"]);
        let mut b = stage("second", &["do thing"]);
        b.addr = StageAddr::InFile {
            file: RelFilePath::try_from("other/cairn.yaml").unwrap(),
            name: "second".into(),
        };
        pretty_assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());
    }

    #[test]
    fn content_hash_tracks_definition() {
        let base = stage("s", &["do thing"]);
        let changed_cmd = stage("s", &["do other thing"]);
        assert_ne!(
            base.content_hash().unwrap(),
            changed_cmd.content_hash().unwrap()
        );

        let mut changed_outs = stage("s", &["do thing"]);
        changed_outs.outs[0].cache = false;
        assert_ne!(
            base.content_hash().unwrap(),
            changed_outs.content_hash().unwrap()
        );
    }

    #[test]
    fn content_hash_ignores_dep_order() {
        let mut a = stage("s", &["c"]);
        a.deps = vec![
            Dependency::entry(RelEntryPath::try_from("one").unwrap()),
            Dependency::entry(RelEntryPath::try_from("two").unwrap()),
        ];
        let mut b = stage("s", &["c"]);
        b.deps = vec![
            Dependency::entry(RelEntryPath::try_from("two").unwrap()),
            Dependency::entry(RelEntryPath::try_from("one").unwrap()),
        ];
        pretty_assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());
    }
}
