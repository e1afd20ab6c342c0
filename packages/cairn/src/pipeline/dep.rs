//! Stage dependencies.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::path::RelEntryPath;

/// A declared input of a stage.
///
/// Paths are relative to the repo root after loading (the loader resolves
/// the stage working directory). A dependency either names a workspace
/// entry (file or directory) or, when `param_keys` is set, a set of keys
/// inside a parameters file.
#[derive(Clone, Eq, PartialEq, Debug, Display, Serialize, Deserialize)]
#[display("{path}")]
pub struct Dependency {
    /// Workspace-relative path of the input.
    pub path: RelEntryPath,

    /// For parameter dependencies: the keys inside the file this stage
    /// reads. The dependency then tracks those values, not the file bytes,
    /// so unrelated edits to the file do not invalidate the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_keys: Option<Vec<String>>,
}

impl Dependency {
    /// A plain file/directory dependency.
    pub fn entry(path: RelEntryPath) -> Self {
        Self {
            path,
            param_keys: None,
        }
    }

    /// A parameter-key dependency on `path`.
    pub fn params(path: RelEntryPath, mut keys: Vec<String>) -> Self {
        keys.sort();
        Self {
            path,
            param_keys: Some(keys),
        }
    }

    /// Whether this dependency tracks parameter values rather than bytes.
    pub fn is_params(&self) -> bool {
        self.param_keys.is_some()
    }
}
