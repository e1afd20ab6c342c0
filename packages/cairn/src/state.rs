//! The state index: a persistent fingerprint-to-hash cache.
//!
//! Hashing a large data file is the single most expensive thing the engine
//! does, and most invocations hash files that have not changed since last
//! time. The state index maps `(path, inode, size, mtime)` to the hash and
//! metadata computed when that fingerprint was last seen, so an unchanged
//! file is never even opened.
//!
//! The fingerprint tuple is the entirety of the trust decision: if any
//! component disagrees with a fresh stat, the entry is dead and the file is
//! rehashed. Entries are written lazily after successful hashing.

use std::sync::{Arc, Mutex};

use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use derive_more::Debug;
use rusqlite::{Connection, OptionalExtension as _, params};
use tracing::{instrument, trace, warn};

use crate::{
    fs::Fingerprint,
    hash::HashValue,
    odb::Meta,
    path::AbsFilePath,
};

/// SQLite-backed fingerprint cache.
///
/// Opening can fall back to an inert instance (see
/// [`StateIndex::open_or_bypass`]): a process that cannot use the database
/// simply rehashes everything, trading speed for progress.
#[derive(Clone, Debug)]
pub struct StateIndex {
    #[debug("{}", if inner.is_some() { "<db>" } else { "<bypassed>" })]
    inner: Option<Arc<Mutex<Connection>>>,
}

impl StateIndex {
    /// Open or create the database at the given path.
    ///
    /// A corrupt database is removed and rebuilt: the index is purely a
    /// cache, so dropping it costs time, never correctness.
    #[instrument(name = "StateIndex::open", skip(path))]
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            #[allow(clippy::disallowed_methods, reason = "runs synchronously at startup")]
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create state directory {parent:?}"))?;
        }

        let conn = match Self::open_conn(path) {
            Ok(conn) => conn,
            Err(err) => {
                warn!(?path, ?err, "state index unreadable, rebuilding");
                #[allow(clippy::disallowed_methods, reason = "runs synchronously at startup")]
                std::fs::remove_file(path)
                    .with_context(|| format!("remove corrupt state index {path:?}"))?;
                Self::open_conn(path)?
            }
        };

        Ok(Self {
            inner: Some(Arc::new(Mutex::new(conn))),
        })
    }

    /// Open the database, or fall back to an inert instance when the store
    /// is unavailable (held by an uncooperative process, unwritable, ...).
    #[instrument(name = "StateIndex::open_or_bypass", skip(path))]
    pub fn open_or_bypass(path: impl AsRef<std::path::Path>) -> Self {
        match Self::open(path.as_ref()) {
            Ok(index) => index,
            Err(err) => {
                warn!(?err, "proceeding without state index");
                Self { inner: None }
            }
        }
    }

    /// An inert index that caches nothing. Every lookup misses.
    pub fn bypassed() -> Self {
        Self { inner: None }
    }

    /// An in-memory database for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            inner: Some(Arc::new(Mutex::new(conn))),
        })
    }

    fn open_conn(path: &std::path::Path) -> Result<Connection> {
        let conn =
            Connection::open(path).with_context(|| format!("open state index at {path:?}"))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .context("set busy timeout")?;
        Self::init_schema(&conn)?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS state (
                path TEXT PRIMARY KEY,
                inode INTEGER NOT NULL,
                size INTEGER NOT NULL,
                mtime_ns INTEGER NOT NULL,
                hash TEXT NOT NULL,
                meta TEXT NOT NULL
            );
            "#,
        )
        .context("initialize state schema")?;
        Ok(())
    }

    /// Look up the hash recorded for `path` under `fingerprint`.
    ///
    /// A stored entry whose fingerprint disagrees is void and reported as a
    /// miss; it stays on disk until the next [`StateIndex::put`] overwrites
    /// it.
    #[instrument(name = "StateIndex::get", skip(self))]
    pub fn get(&self, path: &AbsFilePath, fingerprint: &Fingerprint) -> Result<Option<(HashValue, Meta)>> {
        let Some(inner) = &self.inner else {
            return Ok(None);
        };
        let conn = inner.lock().map_err(|e| eyre!("state lock poisoned: {e}"))?;

        let key = path.as_str_lossy();
        let row = conn
            .query_row(
                "SELECT inode, size, mtime_ns, hash, meta FROM state WHERE path = ?1",
                params![key.as_ref()],
                |row| {
                    Ok((
                        row.get::<_, u64>(0)?,
                        row.get::<_, u64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("query state entry")?;

        let Some((inode, size, mtime_ns, hash, meta)) = row else {
            return Ok(None);
        };

        let stored = Fingerprint {
            inode,
            size,
            mtime_ns,
        };
        if stored != *fingerprint {
            trace!(?path, ?stored, current = ?fingerprint, "state entry void");
            return Ok(None);
        }

        let hash = HashValue::new(crate::hash::HashAlgo::Md5, hash);
        let meta: Meta = serde_json::from_str(&meta).context("parse state meta")?;
        trace!(?path, %hash, "state hit");
        Ok(Some((hash, meta)))
    }

    /// Record the hash computed for `path` under `fingerprint`.
    #[instrument(name = "StateIndex::put", skip(self, meta))]
    pub fn put(
        &self,
        path: &AbsFilePath,
        fingerprint: &Fingerprint,
        hash: &HashValue,
        meta: &Meta,
    ) -> Result<()> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        let conn = inner.lock().map_err(|e| eyre!("state lock poisoned: {e}"))?;

        let meta = serde_json::to_string(meta).context("serialize meta")?;
        let key = path.as_str_lossy();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO state (path, inode, size, mtime_ns, hash, meta)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                key.as_ref(),
                fingerprint.inode,
                fingerprint.size,
                fingerprint.mtime_ns,
                hash.as_str(),
                meta,
            ],
        )
        .context("insert state entry")?;
        Ok(())
    }

    /// Drop every entry.
    #[instrument(name = "StateIndex::clear", skip(self))]
    pub fn clear(&self) -> Result<()> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        let conn = inner.lock().map_err(|e| eyre!("state lock poisoned: {e}"))?;
        conn.execute("DELETE FROM state", [])
            .context("clear state")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq as pretty_assert_eq;

    fn sample() -> (AbsFilePath, Fingerprint, HashValue, Meta) {
        (
            AbsFilePath::try_from("/work/repo/data.csv").unwrap(),
            Fingerprint {
                inode: 42,
                size: 100,
                mtime_ns: 1_700_000_000_000,
            },
            HashValue::of_bytes(b"data"),
            Meta::file(100, false),
        )
    }

    #[test]
    fn hit_on_matching_fingerprint() {
        let index = StateIndex::in_memory().unwrap();
        let (path, fp, hash, meta) = sample();

        index.put(&path, &fp, &hash, &meta).unwrap();
        let (got_hash, got_meta) = index.get(&path, &fp).unwrap().unwrap();
        pretty_assert_eq!(got_hash, hash);
        pretty_assert_eq!(got_meta, meta);
    }

    #[test]
    fn miss_on_any_fingerprint_change() {
        let index = StateIndex::in_memory().unwrap();
        let (path, fp, hash, meta) = sample();
        index.put(&path, &fp, &hash, &meta).unwrap();

        for changed in [
            Fingerprint { inode: 43, ..fp },
            Fingerprint { size: 101, ..fp },
            Fingerprint {
                mtime_ns: fp.mtime_ns + 1,
                ..fp
            },
        ] {
            assert!(index.get(&path, &changed).unwrap().is_none());
        }
    }

    #[test]
    fn overwrite_replaces_entry() {
        let index = StateIndex::in_memory().unwrap();
        let (path, fp, hash, meta) = sample();
        index.put(&path, &fp, &hash, &meta).unwrap();

        let newer = Fingerprint {
            mtime_ns: fp.mtime_ns + 5,
            ..fp
        };
        let new_hash = HashValue::of_bytes(b"changed");
        index.put(&path, &newer, &new_hash, &meta).unwrap();

        assert!(index.get(&path, &fp).unwrap().is_none());
        let (got, _) = index.get(&path, &newer).unwrap().unwrap();
        pretty_assert_eq!(got, new_hash);
    }

    #[test]
    fn bypassed_index_always_misses() {
        let index = StateIndex::bypassed();
        let (path, fp, hash, meta) = sample();
        index.put(&path, &fp, &hash, &meta).unwrap();
        assert!(index.get(&path, &fp).unwrap().is_none());
    }
}
