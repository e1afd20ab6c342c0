//! Stage outputs.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use strum::Display as StrumDisplay;

use crate::path::RelEntryPath;

/// What role an output plays. Metrics and plots are tracked exactly like
/// plain outputs; the kind only matters to presentation layers outside the
/// core.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, StrumDisplay, Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OutKind {
    #[default]
    Out,
    Metric,
    Plot,
}

/// User-declared descriptive metadata on an output.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct Annotations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub ty: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_yaml::Value>,
}

impl Annotations {
    pub fn is_empty(&self) -> bool {
        self.desc.is_none() && self.ty.is_none() && self.labels.is_empty() && self.meta.is_none()
    }
}

/// A declared product of a stage.
///
/// Paths are relative to the repo root after loading.
#[derive(Clone, Eq, PartialEq, Debug, Display, Serialize, Deserialize)]
#[display("{path}")]
pub struct Output {
    /// Workspace-relative path of the product.
    pub path: RelEntryPath,

    /// The output's role.
    #[serde(default, skip_serializing_if = "is_default_kind")]
    pub kind: OutKind,

    /// Whether the content is ingested into the object database. Uncached
    /// outputs are only checked for presence, never restored.
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub cache: bool,

    /// Whether the output survives in the workspace across reruns instead
    /// of being removed before the command starts.
    #[serde(default, skip_serializing_if = "is_false")]
    pub persist: bool,

    /// Whether `push` sends this output to remotes.
    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub push: bool,

    /// Whether this output participates in checkpoint signalling.
    #[serde(default, skip_serializing_if = "is_false")]
    pub checkpoint: bool,

    /// Preferred remote for this output, overriding the repo default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,

    /// Descriptive metadata; never affects hashing or rerun decisions.
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

impl Output {
    /// A plain cached output at `path`.
    pub fn new(path: RelEntryPath, kind: OutKind) -> Self {
        Self {
            path,
            kind,
            cache: true,
            persist: false,
            push: true,
            checkpoint: false,
            remote: None,
            annotations: Annotations::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_default_kind(kind: &OutKind) -> bool {
    *kind == OutKind::Out
}
