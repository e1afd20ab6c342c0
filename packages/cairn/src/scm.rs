//! The narrow SCM interface the core consumes.
//!
//! The engine does not drive version control; it only needs one favor from
//! it: keep tracked outputs out of source control. With git present that
//! means maintaining `.gitignore` entries next to outputs; without it,
//! nothing.

use color_eyre::{Result, eyre::Context};
use tracing::{instrument, trace};

use crate::path::{AbsDirPath, AbsEntryPath};

/// What the engine asks of version control.
pub trait Scm: Send + Sync {
    /// Make sure `target` is excluded from source control.
    fn ignore(&self, target: &AbsEntryPath) -> Result<()>;

    /// Undo [`Scm::ignore`] for `target`.
    fn ignore_remove(&self, target: &AbsEntryPath) -> Result<()>;
}

/// Pick the SCM implementation for a repo root.
pub fn detect(root: &AbsDirPath) -> Box<dyn Scm> {
    let git_dir = root.as_std_path().join(".git");
    if git_dir.exists() {
        trace!(?root, "git detected");
        Box::new(GitScm)
    } else {
        Box::new(NoScm)
    }
}

/// Git: maintain a `.gitignore` in the target's directory.
#[derive(Clone, Copy, Debug, Default)]
pub struct GitScm;

const GITIGNORE: &str = ".gitignore";

impl GitScm {
    fn entry_for(target: &AbsEntryPath) -> Option<(std::path::PathBuf, String)> {
        let name = target.file_name()?.to_string_lossy().into_owned();
        let gitignore = target.as_std_path().parent()?.join(GITIGNORE);
        Some((gitignore, format!("/{name}")))
    }
}

#[allow(
    clippy::disallowed_methods,
    reason = "gitignore updates are tiny synchronous writes"
)]
impl Scm for GitScm {
    #[instrument(name = "GitScm::ignore", skip(self))]
    fn ignore(&self, target: &AbsEntryPath) -> Result<()> {
        let Some((gitignore, entry)) = Self::entry_for(target) else {
            return Ok(());
        };
        let current = match std::fs::read_to_string(&gitignore) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err).context(format!("read {gitignore:?}")),
        };
        if current.lines().any(|line| line == entry) {
            return Ok(());
        }
        let mut updated = current;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(&entry);
        updated.push('\n');
        std::fs::write(&gitignore, updated).with_context(|| format!("write {gitignore:?}"))?;
        trace!(?gitignore, entry, "added ignore entry");
        Ok(())
    }

    #[instrument(name = "GitScm::ignore_remove", skip(self))]
    fn ignore_remove(&self, target: &AbsEntryPath) -> Result<()> {
        let Some((gitignore, entry)) = Self::entry_for(target) else {
            return Ok(());
        };
        let current = match std::fs::read_to_string(&gitignore) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err).context(format!("read {gitignore:?}")),
        };
        let remaining: Vec<&str> = current.lines().filter(|line| *line != entry).collect();
        if remaining.is_empty() {
            std::fs::remove_file(&gitignore).with_context(|| format!("remove {gitignore:?}"))?;
        } else {
            let mut text = remaining.join("\n");
            text.push('\n');
            std::fs::write(&gitignore, text).with_context(|| format!("write {gitignore:?}"))?;
        }
        Ok(())
    }
}

/// No version control, no favors needed.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoScm;

impl Scm for NoScm {
    fn ignore(&self, _target: &AbsEntryPath) -> Result<()> {
        Ok(())
    }

    fn ignore_remove(&self, _target: &AbsEntryPath) -> Result<()> {
        Ok(())
    }
}
