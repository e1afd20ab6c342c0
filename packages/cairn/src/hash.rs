//! Hashing operations and types.
//!
//! Every object cairn tracks is identified by a content hash. The algorithm
//! name travels with the digest so that a future algorithm migration is a
//! non-breaking extension of the on-disk formats rather than a flag day.
//!
//! Files sniffed as text are hashed after normalizing CRLF line endings to
//! LF, so that the same file checked out on different platforms produces the
//! same digest. Binary files are hashed byte-for-byte. A file is binary if
//! its first 8 KiB contain a null byte.

use std::fmt;

use color_eyre::{Result, eyre::Context};
use md5::{Digest as _, Md5};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::{Display as StrumDisplay, EnumString};
use tokio::io::AsyncReadExt;
use tracing::{instrument, trace};

use crate::{fs, path::AbsFilePath};

/// Chunk size for streaming reads.
const CHUNK_SIZE: usize = 64 * 1024;

/// How many leading bytes are sniffed for the text/binary decision.
const SNIFF_SIZE: usize = 8 * 1024;

/// Suffix that distinguishes tree object hashes from plain blob hashes, so
/// callers can tell the two apart without reading the object.
pub const TREE_SUFFIX: &str = ".dir";

/// The digest algorithm of a [`HashValue`].
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, StrumDisplay, EnumString, Default,
)]
#[strum(serialize_all = "lowercase")]
pub enum HashAlgo {
    #[default]
    Md5,
}

/// A content hash: algorithm plus hex digest.
///
/// Tree hashes carry a `.dir` suffix on the digest by convention.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct HashValue {
    algo: HashAlgo,
    hex: String,
}

impl HashValue {
    /// Wrap an existing hex digest.
    pub fn new(algo: HashAlgo, hex: impl Into<String>) -> Self {
        Self {
            algo,
            hex: hex.into(),
        }
    }

    /// Hash a byte buffer directly, without text normalization.
    ///
    /// Used for serialized objects (trees, run manifests, stage definitions)
    /// whose bytes are already canonical.
    pub fn of_bytes(data: impl AsRef<[u8]>) -> Self {
        let digest = Md5::digest(data.as_ref());
        Self {
            algo: HashAlgo::Md5,
            hex: hex::encode(digest),
        }
    }

    /// The digest algorithm.
    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    /// The hex digest, including any `.dir` suffix.
    pub fn as_str(&self) -> &str {
        &self.hex
    }

    /// Whether this hash names a tree object.
    pub fn is_tree(&self) -> bool {
        self.hex.ends_with(TREE_SUFFIX)
    }

    /// This hash with the tree suffix appended.
    pub fn into_tree(self) -> Self {
        debug_assert!(!self.is_tree(), "hash is already a tree hash");
        Self {
            algo: self.algo,
            hex: format!("{}{TREE_SUFFIX}", self.hex),
        }
    }

    /// The digest without the tree suffix: the name of the underlying blob.
    pub fn as_blob_str(&self) -> &str {
        self.hex.strip_suffix(TREE_SUFFIX).unwrap_or(&self.hex)
    }
}

impl fmt::Display for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex)
    }
}

impl fmt::Debug for HashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algo, self.hex)
    }
}

impl Serialize for HashValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.hex.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for HashValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Ok(Self {
            algo: HashAlgo::Md5,
            hex,
        })
    }
}

/// Hash the contents of the file at the specified path.
///
/// The first 8 KiB decide text vs binary; text content is hashed with CRLF
/// normalized to LF. I/O problems fail the call; there is no sentinel value
/// for an unreadable file.
#[instrument(name = "hash_file")]
pub async fn hash_file(path: &AbsFilePath) -> Result<HashValue> {
    let mut file = fs::open_file(path).await.context("open file")?;

    let mut sniff = vec![0; SNIFF_SIZE];
    let mut filled = 0;
    while filled < sniff.len() {
        let len = file
            .read(&mut sniff[filled..])
            .await
            .context("read leading chunk")?;
        if len == 0 {
            break;
        }
        filled += len;
    }
    sniff.truncate(filled);
    let is_text = !sniff.contains(&0);

    let mut hasher = Md5::new();
    let mut normalizer = CrlfNormalizer::new(is_text);
    let mut bytes = filled;

    normalizer.update(&mut hasher, &sniff);

    let mut data = vec![0; CHUNK_SIZE];
    loop {
        let len = file.read(&mut data).await.context("read chunk")?;
        if len == 0 {
            break;
        }
        normalizer.update(&mut hasher, &data[..len]);
        bytes += len;
    }
    normalizer.finish(&mut hasher);

    let hash = HashValue {
        algo: HashAlgo::Md5,
        hex: hex::encode(hasher.finalize()),
    };
    trace!(?path, hash = %hash, ?bytes, ?is_text, "hash file");
    Ok(hash)
}

/// Feeds chunks to a digest, rewriting `\r\n` to `\n` for text content.
///
/// A trailing `\r` at a chunk boundary is held back until the next chunk
/// reveals whether it starts a CRLF pair.
struct CrlfNormalizer {
    enabled: bool,
    pending_cr: bool,
}

impl CrlfNormalizer {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            pending_cr: false,
        }
    }

    fn update(&mut self, hasher: &mut Md5, chunk: &[u8]) {
        if !self.enabled {
            hasher.update(chunk);
            return;
        }
        if chunk.is_empty() {
            return;
        }

        let mut chunk = chunk;
        if self.pending_cr {
            if chunk[0] != b'\n' {
                hasher.update(b"\r");
            }
            self.pending_cr = false;
        }

        while let Some(pos) = chunk.windows(2).position(|w| w == b"\r\n") {
            hasher.update(&chunk[..pos]);
            hasher.update(b"\n");
            chunk = &chunk[pos + 2..];
        }

        if let [head @ .., b'\r'] = chunk {
            hasher.update(head);
            self.pending_cr = true;
        } else {
            hasher.update(chunk);
        }
    }

    fn finish(&mut self, hasher: &mut Md5) {
        if self.pending_cr {
            hasher.update(b"\r");
            self.pending_cr = false;
        }
    }
}
