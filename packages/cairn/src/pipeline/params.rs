//! Parameter files, keypaths, and `${…}` template interpolation.
//!
//! Keypaths address values inside parameter files: `train.lr` descends
//! mappings, `layers[0]` indexes sequences, and the two compose
//! (`model.layers[2].units`). Template references use the same syntax
//! inside `${…}`.
//!
//! Interpolation is string-level for scalars and structural for whole-value
//! references: `"lr=${train.lr}"` splices text, while a field whose entire
//! value is `"${train}"` receives the mapping itself.

use std::collections::BTreeMap;

use color_eyre::{
    Result,
    eyre::{Context as _, bail, eyre},
};
use lazy_regex::{Lazy, lazy_regex, regex::Regex};
use serde_yaml::Value;

use crate::{fs, path::AbsFilePath};

/// The parameter file consulted when a declaration names no file.
pub const DEFAULT_PARAMS_FILE: &str = "params.yaml";

/// Matches one `${…}` reference.
static REFERENCE: Lazy<Regex> = lazy_regex!(r"\$\{([^}]+)\}");

/// Matches one trailing `[index]` on a keypath segment.
static INDEX: Lazy<Regex> = lazy_regex!(r"\[(-?\d+)\]");

/// One step of a parsed keypath.
#[derive(Clone, Eq, PartialEq, Debug)]
enum Step {
    Key(String),
    Index(i64),
}

/// Split `item.subitem[1]` into `[Key("item"), Key("subitem"), Index(1)]`.
fn parse_keypath(keypath: &str) -> Result<Vec<Step>> {
    let mut steps = Vec::new();
    for segment in keypath.split('.') {
        let (name, rest) = match segment.find('[') {
            Some(bracket) if segment.ends_with(']') => segment.split_at(bracket),
            _ => (segment, ""),
        };
        if name.is_empty() && rest.is_empty() {
            bail!("empty segment in keypath {keypath:?}");
        }
        if !name.is_empty() {
            steps.push(Step::Key(name.to_string()));
        }
        for capture in INDEX.captures_iter(rest) {
            let index: i64 = capture[1].parse().context("parse index")?;
            steps.push(Step::Index(index));
        }
    }
    Ok(steps)
}

/// The values visible to `${…}` references at one resolution site.
///
/// Built from the default params file, any files the stage names, and the
/// `foreach` loop variables (`item`, `key`).
#[derive(Clone, Debug, Default)]
pub struct Context {
    values: BTreeMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a single name, as `foreach` does for `item` and `key`.
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Merge a parameter file's top-level mapping into the context.
    /// Later merges win on key collisions.
    pub fn merge_file(&mut self, contents: &Value) -> Result<()> {
        let Value::Mapping(mapping) = contents else {
            bail!("parameter file root must be a mapping");
        };
        for (key, value) in mapping {
            let Value::String(key) = key else {
                bail!("parameter keys must be strings, got {key:?}");
            };
            self.values.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    /// Resolve a keypath to its value, if present.
    pub fn resolve(&self, keypath: &str) -> Result<Option<Value>> {
        let steps = parse_keypath(keypath)?;
        let [Step::Key(root), rest @ ..] = steps.as_slice() else {
            bail!("keypath {keypath:?} must start with a name");
        };
        let Some(mut current) = self.values.get(root) else {
            return Ok(None);
        };
        for step in rest {
            current = match (step, current) {
                (Step::Key(key), Value::Mapping(map)) => {
                    match map.get(Value::String(key.clone())) {
                        Some(value) => value,
                        None => return Ok(None),
                    }
                }
                (Step::Index(index), Value::Sequence(seq)) => {
                    let index = if *index < 0 {
                        seq.len() as i64 + index
                    } else {
                        *index
                    };
                    match usize::try_from(index).ok().and_then(|i| seq.get(i)) {
                        Some(value) => value,
                        None => return Ok(None),
                    }
                }
                _ => return Ok(None),
            };
        }
        Ok(Some(current.clone()))
    }
}

/// Interpolate `${…}` references in one string.
///
/// A string that is exactly one reference resolves structurally to the
/// referenced value; anything else splices scalar renderings into the text.
/// Undefined references and non-scalars in text position are errors.
pub fn interpolate_str(text: &str, ctx: &Context) -> Result<Value> {
    // Whole-string reference: structural substitution.
    if let Some(capture) = REFERENCE.captures(text) {
        if capture.get(0).map(|m| m.as_str()) == Some(text) {
            let keypath = capture[1].trim();
            return ctx
                .resolve(keypath)?
                .ok_or_else(|| eyre!("undefined reference ${{{keypath}}}"));
        }
    }

    let mut out = String::new();
    let mut cursor = 0;
    for capture in REFERENCE.captures_iter(text) {
        let whole = capture.get(0).expect("capture 0 always present");
        let keypath = capture[1].trim();
        let value = ctx
            .resolve(keypath)?
            .ok_or_else(|| eyre!("undefined reference ${{{keypath}}}"))?;
        out.push_str(&text[cursor..whole.start()]);
        out.push_str(&render_scalar(keypath, &value)?);
        cursor = whole.end();
    }
    if cursor == 0 {
        return Ok(Value::String(text.to_string()));
    }
    out.push_str(&text[cursor..]);
    Ok(Value::String(out))
}

/// Recursively interpolate every string in a YAML value.
pub fn interpolate_value(value: &Value, ctx: &Context) -> Result<Value> {
    match value {
        Value::String(text) => interpolate_str(text, ctx),
        Value::Sequence(seq) => seq
            .iter()
            .map(|v| interpolate_value(v, ctx))
            .collect::<Result<Vec<_>>>()
            .map(Value::Sequence),
        Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::new();
            for (key, val) in map {
                out.insert(key.clone(), interpolate_value(val, ctx)?);
            }
            Ok(Value::Mapping(out))
        }
        other => Ok(other.clone()),
    }
}

fn render_scalar(keypath: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => bail!("reference ${{{keypath}}} is null"),
        Value::Sequence(_) | Value::Mapping(_) => {
            bail!("reference ${{{keypath}}} is not a scalar and cannot be spliced into a string")
        }
        Value::Tagged(_) => bail!("reference ${{{keypath}}} has an unsupported tagged value"),
    }
}

/// Load and parse a parameter file. A missing file is `None`.
pub async fn load_params_file(path: &AbsFilePath) -> Result<Option<Value>> {
    let Some(text) = fs::read_buffered_utf8(path).await? else {
        return Ok(None);
    };
    serde_yaml::from_str(&text)
        .with_context(|| format!("parse parameter file {path:?}"))
        .map(Some)
}

/// Select the values of `keys` (keypaths) out of a parameter file context.
///
/// Missing keys select `null`, which is distinct from every real value, so
/// "key was removed" registers as a change without being an error here.
pub fn select_keys(ctx: &Context, keys: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut selected = BTreeMap::new();
    for key in keys {
        let value = ctx.resolve(key)?.unwrap_or(Value::Null);
        selected.insert(key.clone(), value);
    }
    Ok(selected)
}
