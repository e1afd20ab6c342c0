//! Per-object metadata carried alongside hashes.

use bon::Builder;
use serde::{Deserialize, Serialize};

/// Metadata describing a tracked object.
///
/// All fields except the directory flag are advisory: they speed up status
/// checks and make transfer progress bars honest, but the hash alone decides
/// identity.
#[derive(Clone, Eq, PartialEq, Debug, Default, Serialize, Deserialize, Builder)]
pub struct Meta {
    /// Total size in bytes. For directories, the sum over member files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// Number of member files; only meaningful for directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nfiles: Option<u64>,

    /// Whether the object is a directory tree.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    #[builder(default)]
    pub isdir: bool,

    /// Whether the file carries an executable bit.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    #[builder(default)]
    pub isexec: bool,

    /// Version identifier assigned by a remote, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,

    /// Name of the remote this object prefers, when pinned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
}

impl Meta {
    /// Metadata for a plain file of known size.
    pub fn file(size: u64, isexec: bool) -> Self {
        Self {
            size: Some(size),
            isexec,
            ..Self::default()
        }
    }

    /// Metadata for a directory with known totals.
    pub fn dir(size: u64, nfiles: u64) -> Self {
        Self {
            size: Some(size),
            nfiles: Some(nfiles),
            isdir: true,
            ..Self::default()
        }
    }
}
