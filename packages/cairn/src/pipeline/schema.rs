//! The pipeline file model and its validation errors.
//!
//! `cairn.yaml` parses into the typed structures here. Syntax and type
//! errors are rendered with the file, line, column, and a short code
//! snippet, because "expected a sequence" with no location is useless in a
//! two-hundred-line pipeline.
//!
//! Semantic validation that spans fields (a `foreach` without a `do`, a
//! stage with neither) lives in the loader, which can cite stages by name.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};

/// Name of the pipeline file, one per directory.
pub const PIPELINE_FILE: &str = "cairn.yaml";

/// Name of the lockfile, sibling to the pipeline file.
pub const LOCKFILE: &str = "cairn.lock";

/// Suffix of legacy single-stage tracking files.
pub const TRACKFILE_SUFFIX: &str = ".cairn";

/// A pipeline file failed to parse or validate.
///
/// Lines and columns are 1-based. The snippet is a three-line window
/// around the offending location with a column marker.
#[derive(Clone, Debug, Display, Error)]
#[display("{path}:{line}:{column}: {message}\n{snippet}")]
pub struct SchemaError {
    pub path: String,
    pub line: usize,
    pub column: usize,
    pub message: String,
    pub snippet: String,
}

/// Render a YAML parse/typing error against its source text.
pub fn render_yaml_error(path: &str, text: &str, err: &serde_yaml::Error) -> SchemaError {
    let (line, column) = err
        .location()
        .map(|loc| (loc.line(), loc.column()))
        .unwrap_or((1, 1));
    SchemaError {
        path: path.to_string(),
        line,
        column,
        message: err.to_string(),
        snippet: snippet_around(text, line, column),
    }
}

/// A three-line window around `line` with a caret under `column`.
fn snippet_around(text: &str, line: usize, column: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = line.saturating_sub(2); // zero-based index of first shown line
    let end = (line + 1).min(lines.len());

    let mut out = String::new();
    for (idx, content) in lines.iter().enumerate().take(end).skip(start) {
        let number = idx + 1;
        let _ = writeln!(out, "{number:>4} | {content}");
        if number == line {
            let _ = writeln!(out, "     | {:>width$}", "^", width = column.max(1));
        }
    }
    out
}

/// The parsed shape of a `cairn.yaml`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDoc {
    /// Stage definitions by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stages: BTreeMap<String, StageDef>,

    /// Additional parameter files available to `${…}` references in this
    /// file, on top of the default `params.yaml`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,

    /// Top-level metrics/plots/artifacts declarations. These belong to
    /// presentation layers; the core accepts them so files validate, and
    /// otherwise leaves them alone.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<serde_yaml::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plots: Vec<serde_yaml::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<serde_yaml::Value>,
}

impl PipelineDoc {
    /// Parse pipeline file text, rendering errors against the source.
    pub fn parse(path: &str, text: &str) -> Result<Self, SchemaError> {
        serde_yaml::from_str(text).map_err(|err| render_yaml_error(path, text, &err))
    }

    /// Serialize back to YAML.
    ///
    /// Formatting is canonical rather than byte-preserving; the engine
    /// never rewrites user pipeline files on its own, so user formatting
    /// and comments survive by virtue of the file not being touched.
    pub fn dump(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

/// One stage definition as written.
///
/// Everything is optional at parse time; the loader enforces the rules
/// that span fields (`cmd` xor `foreach`+`do`, and so on) so that the
/// error can name the stage.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Command>,

    /// Working directory, relative to the pipeline file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wdir: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamDecl>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outs: Vec<OutDecl>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<OutDecl>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plots: Vec<OutDecl>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub frozen: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub always_changed: bool,

    /// Fan-out source: a sequence or a mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<serde_yaml::Value>,

    /// The body instantiated once per `foreach` element.
    #[serde(default, rename = "do", skip_serializing_if = "Option::is_none")]
    pub do_: Option<Box<StageDef>>,
}

/// A command: one shell line or several run in order.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Command {
    Line(String),
    Lines(Vec<String>),
}

impl Command {
    /// The canonical list form; a scalar is a one-element list.
    pub fn into_lines(self) -> Vec<String> {
        match self {
            Self::Line(line) => vec![line],
            Self::Lines(lines) => lines,
        }
    }
}

/// A parameter declaration: a bare key (in the default params file) or a
/// mapping from a params file to the keys read from it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamDecl {
    Key(String),
    File(BTreeMap<String, Vec<String>>),
}

/// An output declaration: a bare path or a path with flags.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutDecl {
    Path(String),
    Flagged(BTreeMap<String, OutFlags>),
}

/// Per-output flags and annotations.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutFlags {
    #[serde(default = "default_true")]
    pub cache: bool,

    #[serde(default)]
    pub persist: bool,

    #[serde(default = "default_true")]
    pub push: bool,

    #[serde(default)]
    pub checkpoint: bool,

    #[serde(default)]
    pub remote: Option<String>,

    #[serde(default)]
    pub desc: Option<String>,

    #[serde(default, rename = "type")]
    pub ty: Option<String>,

    #[serde(default)]
    pub labels: Vec<String>,

    #[serde(default)]
    pub meta: Option<serde_yaml::Value>,
}

impl Default for OutFlags {
    fn default() -> Self {
        Self {
            cache: true,
            persist: false,
            push: true,
            checkpoint: false,
            remote: None,
            desc: None,
            ty: None,
            labels: Vec::new(),
            meta: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    #[test]
    fn parses_the_full_shape() {
        let text = r#"
stages:
  prepare:
    cmd: python prepare.py
    deps: [data/raw.csv]
    params:
      - threshold
      - custom.yaml:
          - lr
          - units
    outs:
      - data/prepared
      - model.pkl:
          cache: false
          persist: true
    metrics:
      - scores.json
    frozen: true
  train:
    foreach: [us, eu]
    do:
      cmd: python train.py ${item}
      outs: ["model-${item}.pkl"]
"#;
        let doc = PipelineDoc::parse("cairn.yaml", text).unwrap();
        pretty_assert_eq!(doc.stages.len(), 2);

        let prepare = &doc.stages["prepare"];
        assert!(prepare.frozen);
        pretty_assert_eq!(prepare.deps, vec!["data/raw.csv"]);
        pretty_assert_eq!(prepare.outs.len(), 2);
        match &prepare.outs[1] {
            OutDecl::Flagged(map) => {
                let flags = &map["model.pkl"];
                assert!(!flags.cache);
                assert!(flags.persist);
            }
            other => panic!("expected flagged out, got {other:?}"),
        }

        let train = &doc.stages["train"];
        assert!(train.foreach.is_some());
        assert!(train.do_.is_some());
    }

    #[test]
    fn command_forms_normalize() {
        pretty_assert_eq!(
            Command::Line("a".into()).into_lines(),
            vec!["a".to_string()]
        );
        pretty_assert_eq!(
            Command::Lines(vec!["a".into(), "b".into()]).into_lines(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn unknown_fields_are_rejected_with_location() {
        let text = "stages:\n  s:\n    cmd: ok\n    cmds: typo\n";
        let err = PipelineDoc::parse("cairn.yaml", text).unwrap_err();
        assert!(err.message.contains("cmds"), "message: {}", err.message);
        pretty_assert_eq!(err.path, "cairn.yaml");
        assert!(err.line > 0);
        assert!(err.snippet.contains("cmds"));
    }

    #[test]
    fn syntax_errors_render_a_snippet() {
        let text = "stages:\n  s:\n   - cmd: [unclosed\n";
        let err = PipelineDoc::parse("cairn.yaml", text).unwrap_err();
        let rendered = err.to_string();
        assert!(rendered.starts_with("cairn.yaml:"), "rendered: {rendered}");
        assert!(rendered.contains(" | "));
    }

    #[test]
    fn dump_round_trips_semantics() {
        let text = "stages:\n  s:\n    cmd: run it\n    outs: [thing]\n";
        let doc = PipelineDoc::parse("cairn.yaml", text).unwrap();
        let dumped = doc.dump().unwrap();
        let again = PipelineDoc::parse("cairn.yaml", &dumped).unwrap();
        pretty_assert_eq!(again.stages.len(), 1);
        let stage = &again.stages["s"];
        match stage.cmd.as_ref().unwrap() {
            Command::Line(line) => pretty_assert_eq!(line, "run it"),
            other => panic!("expected scalar cmd, got {other:?}"),
        }
    }
}
