//! Tree objects: canonical serializations of directory contents.
//!
//! A tree is a sorted list of `(relative path, hash, metadata)` entries.
//! The serialization is a compact JSON array sorted by path bytes, so the
//! tree hash is a pure function of the filtered directory contents and
//! never of filesystem iteration order. The serialized form is stored in
//! the object database as an ordinary blob whose hash carries the `.dir`
//! suffix.

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};

use crate::{hash::HashValue, odb::Meta, path::RelFilePath};

/// One file inside a tree.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Path of the member, relative to the tree root, POSIX separators.
    pub relpath: RelFilePath,

    /// Content hash of the member file.
    #[serde(rename = "md5")]
    pub hash: HashValue,

    /// Member size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// Whether the member carries an executable bit.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub isexec: bool,
}

/// A directory's contents in canonical order.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// Build a tree from entries in any order; entries are sorted here.
    pub fn from_entries(mut entries: Vec<TreeEntry>) -> Self {
        entries.sort_by(|a, b| a.relpath.cmp(&b.relpath));
        Self { entries }
    }

    /// The entries in canonical (path-sorted) order.
    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    /// Number of member files.
    pub fn nfiles(&self) -> u64 {
        self.entries.len() as u64
    }

    /// Sum of member sizes, where known.
    pub fn total_size(&self) -> u64 {
        self.entries.iter().filter_map(|e| e.size).sum()
    }

    /// The canonical serialized form.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.entries).context("serialize tree")
    }

    /// Hash the canonical form. The result carries the `.dir` suffix.
    ///
    /// Returns the hash together with the serialized bytes so callers can
    /// ingest without serializing twice.
    pub fn digest(&self) -> Result<(HashValue, Vec<u8>)> {
        let bytes = self.canonical_bytes()?;
        let hash = HashValue::of_bytes(&bytes).into_tree();
        Ok((hash, bytes))
    }

    /// Parse a serialized tree object.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let entries: Vec<TreeEntry> = serde_json::from_slice(bytes).context("parse tree")?;
        Ok(Self::from_entries(entries))
    }

    /// Aggregate metadata for the whole tree.
    pub fn meta(&self) -> Meta {
        Meta::dir(self.total_size(), self.nfiles())
    }
}
