//! Hierarchical `.cairnignore` resolution.
//!
//! Ignore files use gitignore syntax (`!` re-includes, trailing `/` for
//! directories, `**`, `#` comments, backslash escapes) and attach to the
//! directory they live in. The effective rules at any path are the union
//! along the ancestor chain; when files disagree, the deeper file wins.
//! Pattern matching itself is delegated to the `ignore` crate; this module
//! owns the hierarchy and the walk.
//!
//! The repo's own metadata directory and `.git` are always skipped, and an
//! ignore file inside an ignored directory is never loaded.

#![allow(
    clippy::disallowed_methods,
    reason = "The walk is deliberately synchronous; callers run it in spawn_blocking."
)]

use color_eyre::{Result, eyre::Context};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::{instrument, trace};

use crate::path::{AbsDirPath, AbsFilePath, TryJoinWith as _};

/// Name of the per-directory ignore file.
pub const IGNORE_FILE: &str = ".cairnignore";

/// Directories never walked, regardless of ignore rules.
const ALWAYS_SKIPPED: &[&str] = &[".git", crate::repo::REPO_DIR];

/// The compiled ignore rules of a workspace.
///
/// Matchers are held in discovery order, which is ancestors-first; lookup
/// scans all applicable matchers and lets the deepest decisive answer win.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    matchers: Vec<Gitignore>,
}

impl IgnoreRules {
    /// Rules that ignore nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Collect and compile every ignore file under `root`.
    #[instrument(name = "IgnoreRules::load")]
    pub fn load(root: &AbsDirPath) -> Result<Self> {
        let mut rules = Self::default();
        rules.visit(root)?;
        Ok(rules)
    }

    fn visit(&mut self, dir: &AbsDirPath) -> Result<()> {
        let ignore_file = dir.try_join_file(IGNORE_FILE)?;
        if ignore_file.as_std_path().is_file() {
            let mut builder = GitignoreBuilder::new(dir.as_std_path());
            if let Some(err) = builder.add(ignore_file.as_std_path()) {
                return Err(err).context(format!("parse {ignore_file:?}"));
            }
            let matcher = builder
                .build()
                .with_context(|| format!("compile {ignore_file:?}"))?;
            trace!(?dir, patterns = matcher.len(), "loaded ignore file");
            self.matchers.push(matcher);
        }

        let mut subdirs = Vec::new();
        let entries = std::fs::read_dir(dir.as_std_path())
            .with_context(|| format!("read directory {dir:?}"))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("read entry in {dir:?}"))?;
            let file_type = entry.file_type().context("entry file type")?;
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if ALWAYS_SKIPPED.iter().any(|skip| name == *skip) {
                continue;
            }
            let sub = AbsDirPath::try_from(entry.path())?;
            if !self.is_ignored_dir(&sub) {
                subdirs.push(sub);
            }
        }

        // Deterministic discovery order so matcher precedence is stable.
        subdirs.sort();
        for sub in &subdirs {
            self.visit(sub)?;
        }
        Ok(())
    }

    /// Whether the file at `path` is excluded from the workspace.
    pub fn is_ignored_file(&self, path: &AbsFilePath) -> bool {
        self.decide(path.as_std_path(), false)
    }

    /// Whether the directory at `path` is excluded from the workspace.
    pub fn is_ignored_dir(&self, path: &AbsDirPath) -> bool {
        if path
            .file_name()
            .is_some_and(|name| ALWAYS_SKIPPED.iter().any(|skip| name == *skip))
        {
            return true;
        }
        self.decide(path.as_std_path(), true)
    }

    fn decide(&self, path: &std::path::Path, is_dir: bool) -> bool {
        let mut ignored = false;
        // Matchers are in ancestors-first order; a deeper decisive match
        // overrides a shallower one, including `!` re-includes.
        for matcher in &self.matchers {
            if !path.starts_with(matcher.path()) {
                continue;
            }
            let verdict = matcher.matched_path_or_any_parents(path, is_dir);
            if verdict.is_ignore() {
                ignored = true;
            } else if verdict.is_whitelist() {
                ignored = false;
            }
        }
        ignored
    }

    /// Walk all non-ignored files under `dir`, depth-first, sorted by name
    /// at every level. The order is deterministic, which makes it safe to
    /// feed straight into tree hashing.
    #[instrument(name = "IgnoreRules::walk", skip(self))]
    pub fn walk(&self, dir: &AbsDirPath) -> Result<Vec<AbsFilePath>> {
        let mut files = Vec::new();
        self.walk_into(dir, &mut files)?;
        Ok(files)
    }

    fn walk_into(&self, dir: &AbsDirPath, files: &mut Vec<AbsFilePath>) -> Result<()> {
        let mut entries: Vec<_> = std::fs::read_dir(dir.as_std_path())
            .with_context(|| format!("read directory {dir:?}"))?
            .collect::<std::io::Result<_>>()
            .with_context(|| format!("read entries in {dir:?}"))?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let file_type = entry.file_type().context("entry file type")?;
            if file_type.is_dir() {
                let name = entry.file_name();
                if ALWAYS_SKIPPED.iter().any(|skip| name == *skip) {
                    continue;
                }
                let sub = AbsDirPath::try_from(entry.path())?;
                if !self.is_ignored_dir(&sub) {
                    self.walk_into(&sub, files)?;
                }
            } else if file_type.is_file() {
                if entry.file_name() == IGNORE_FILE {
                    continue;
                }
                let file = AbsFilePath::try_from(entry.path())?;
                if !self.is_ignored_file(&file) {
                    files.push(file);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{JoinWith as _, RelativeTo as _};
    use crate::{fs, mk_rel_dir, mk_rel_file};
    use pretty_assertions::assert_eq as pretty_assert_eq;

    async fn scaffold(files: &[(&str, &str)]) -> (tempfile::TempDir, AbsDirPath) {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsDirPath::try_from(dir.path()).unwrap();
        for (path, content) in files {
            let target = root.try_join_file(path).unwrap();
            fs::write(&target, content).await.unwrap();
        }
        (dir, root)
    }

    fn rel_names(root: &AbsDirPath, files: Vec<AbsFilePath>) -> Vec<String> {
        files
            .into_iter()
            .map(|f| f.relative_to(root).unwrap().to_posix())
            .collect()
    }

    #[tokio::test]
    async fn plain_patterns_filter_the_walk() {
        let (_guard, root) = scaffold(&[
            (".cairnignore", "*.log\ntmp/\n"),
            ("keep.txt", "k"),
            ("noise.log", "n"),
            ("tmp/scratch", "s"),
            ("sub/nested.log", "n"),
            ("sub/data.csv", "d"),
        ])
        .await;

        let rules = IgnoreRules::load(&root).unwrap();
        let files = rules.walk(&root).unwrap();
        pretty_assert_eq!(rel_names(&root, files), vec!["keep.txt", "sub/data.csv"]);
    }

    #[tokio::test]
    async fn deeper_ignore_file_wins() {
        let (_guard, root) = scaffold(&[
            (".cairnignore", "*.dat\n"),
            ("sub/.cairnignore", "!special.dat\n"),
            ("top.dat", "t"),
            ("sub/special.dat", "s"),
            ("sub/other.dat", "o"),
        ])
        .await;

        let rules = IgnoreRules::load(&root).unwrap();
        let files = rules.walk(&root).unwrap();
        pretty_assert_eq!(rel_names(&root, files), vec!["sub/special.dat"]);
    }

    #[tokio::test]
    async fn ignored_directories_prune_their_subtrees() {
        let (_guard, root) = scaffold(&[
            (".cairnignore", "build/\n"),
            ("build/.cairnignore", "!everything\n"),
            ("build/artifact", "a"),
            ("src/main.rs", "m"),
        ])
        .await;

        let rules = IgnoreRules::load(&root).unwrap();
        // The ignore file inside the ignored directory is never loaded.
        let files = rules.walk(&root).unwrap();
        pretty_assert_eq!(rel_names(&root, files), vec!["src/main.rs"]);
    }

    #[tokio::test]
    async fn repo_metadata_always_skipped() {
        let (_guard, root) = scaffold(&[
            (".cairn/config", "c"),
            (".git/HEAD", "h"),
            ("data.txt", "d"),
        ])
        .await;

        let rules = IgnoreRules::load(&root).unwrap();
        let files = rules.walk(&root).unwrap();
        pretty_assert_eq!(rel_names(&root, files), vec!["data.txt"]);

        let meta_dir = root.join(mk_rel_dir!(".cairn"));
        assert!(rules.is_ignored_dir(&meta_dir));
    }

    #[tokio::test]
    async fn no_rules_means_nothing_ignored() {
        let (_guard, root) = scaffold(&[("a", "a"), ("b/c", "c")]).await;
        let rules = IgnoreRules::load(&root).unwrap();
        let file = root.join(mk_rel_file!("a"));
        assert!(!rules.is_ignored_file(&file));
        pretty_assert_eq!(rel_names(&root, rules.walk(&root).unwrap()), vec!["a", "b/c"]);
    }
}
