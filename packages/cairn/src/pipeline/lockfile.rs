//! Lockfiles: the authoritative record of "what was produced last".
//!
//! `cairn.lock` sits next to its pipeline file and records, per stage, the
//! resolved command, the hash and metadata of every dependency and output,
//! and the stage's content hash. The workspace is advisory; this file is
//! not. It is always rewritten atomically, and it is written *last* during
//! stage execution so a crash can only ever leave the previous consistent
//! record in place.
//!
//! Legacy single-stage tracking files (`<name>.cairn`) carry the same
//! information inline; they are their own lockfile.

use std::collections::BTreeMap;

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};

use crate::{
    fs,
    hash::HashValue,
    odb::Meta,
    path::{AbsFilePath, RelEntryPath},
    pipeline::schema::{Command, SchemaError, render_yaml_error},
};

/// Schema tag written to every lockfile.
pub const LOCKFILE_SCHEMA: &str = "2.0";

/// A `cairn.lock` document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockfileDoc {
    pub schema: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stages: BTreeMap<String, StageLock>,
}

impl Default for LockfileDoc {
    fn default() -> Self {
        Self {
            schema: LOCKFILE_SCHEMA.to_string(),
            stages: BTreeMap::new(),
        }
    }
}

/// The committed record of one stage.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct StageLock {
    /// The resolved command, list entries joined with newlines.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cmd: String,

    /// Content hash of the resolved stage definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<HashValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<LockedEntry>,

    /// Parameter values at commit time: file → keypath → value.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outs: Vec<LockedEntry>,
}

/// One dependency or output with its committed hash and metadata.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LockedEntry {
    pub path: RelEntryPath,

    /// The digest algorithm name; travels with the value.
    pub hash: String,

    pub md5: HashValue,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nfiles: Option<u64>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub isexec: bool,
}

impl LockedEntry {
    /// Build an entry from a computed hash and metadata.
    pub fn new(path: RelEntryPath, hash: HashValue, meta: &Meta) -> Self {
        Self {
            path,
            hash: hash.algo().to_string(),
            md5: hash,
            size: meta.size,
            nfiles: meta.nfiles,
            isexec: meta.isexec,
        }
    }

    /// Reconstruct the metadata recorded in this entry.
    pub fn meta(&self) -> Meta {
        Meta {
            size: self.size,
            nfiles: self.nfiles,
            isdir: self.md5.is_tree(),
            isexec: self.isexec,
            version_id: None,
            remote: None,
        }
    }
}

impl LockfileDoc {
    /// Read a lockfile; a missing file is an empty lock. Parse failures
    /// render the location and a snippet, like pipeline files.
    pub async fn load(path: &AbsFilePath) -> Result<Self> {
        let Some(text) = fs::read_buffered_utf8(path).await? else {
            return Ok(Self::default());
        };
        Self::parse(&path.as_str_lossy(), &text).map_err(Into::into)
    }

    /// Parse lockfile text, rendering errors against the source.
    pub fn parse(path: &str, text: &str) -> Result<Self, SchemaError> {
        serde_yaml::from_str(text).map_err(|err| render_yaml_error(path, text, &err))
    }

    /// Write the lockfile atomically.
    pub async fn save(&self, path: &AbsFilePath) -> Result<()> {
        let text = serde_yaml::to_string(self).context("serialize lockfile")?;
        fs::write_atomic(path, text.as_bytes()).await
    }
}

/// A legacy single-stage tracking file (`<name>.cairn`).
///
/// Definition and lock in one document: `cairn add data.csv` writes
/// `data.csv.cairn` with the output's hash inline.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackFileDoc {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Command>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wdir: Option<String>,

    /// Content hash of the stage definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<HashValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<LockedEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outs: Vec<LockedEntry>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub frozen: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub always_changed: bool,
}

impl TrackFileDoc {
    /// Read a tracking file; `None` if it does not exist.
    pub async fn load(path: &AbsFilePath) -> Result<Option<Self>> {
        let Some(text) = fs::read_buffered_utf8(path).await? else {
            return Ok(None);
        };
        let doc = serde_yaml::from_str(&text)
            .map_err(|err| render_yaml_error(&path.as_str_lossy(), &text, &err))?;
        Ok(Some(doc))
    }

    /// Write the tracking file atomically.
    pub async fn save(&self, path: &AbsFilePath) -> Result<()> {
        let text = serde_yaml::to_string(self).context("serialize tracking file")?;
        fs::write_atomic(path, text.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{AbsDirPath, JoinWith as _};
    use crate::{mk_rel_file, odb::Meta};
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn entry(path: &str, content: &[u8], size: u64) -> LockedEntry {
        LockedEntry::new(
            RelEntryPath::try_from(path).unwrap(),
            HashValue::of_bytes(content),
            &Meta::file(size, false),
        )
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        let path = root.join(mk_rel_file!("cairn.lock"));

        let mut doc = LockfileDoc::default();
        doc.stages.insert(
            "train".to_string(),
            StageLock {
                cmd: "python train.py".to_string(),
                md5: Some(HashValue::of_bytes(b"stage")),
                deps: vec![entry("data.csv", b"data", 4)],
                params: BTreeMap::new(),
                outs: vec![entry("model.pkl", b"model", 5)],
            },
        );
        doc.save(&path).await.unwrap();

        let loaded = LockfileDoc::load(&path).await.unwrap();
        pretty_assert_eq!(loaded.schema, LOCKFILE_SCHEMA);
        pretty_assert_eq!(loaded.stages["train"], doc.stages["train"]);
    }

    #[tokio::test]
    async fn missing_lockfile_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        let path = root.join(mk_rel_file!("cairn.lock"));

        let loaded = LockfileDoc::load(&path).await.unwrap();
        assert!(loaded.stages.is_empty());
    }

    #[test]
    fn corrupt_lockfile_renders_location() {
        let err = LockfileDoc::parse("cairn.lock", "schema: '2.0'\nstages: [oops\n").unwrap_err();
        assert!(err.to_string().starts_with("cairn.lock:"));
        assert!(err.line >= 1);
    }

    #[test]
    fn entry_records_algorithm_and_meta() {
        let e = entry("dir", b"tree", 10);
        pretty_assert_eq!(e.hash, "md5");
        let meta = e.meta();
        pretty_assert_eq!(meta.size, Some(10));
        assert!(!meta.isdir);
    }
}
