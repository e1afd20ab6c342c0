//! Integration tests for the `cairn` engine, driven through the repo API.

use cairn::{
    fs,
    path::{AbsDirPath, TryJoinWith as _},
    repo::Repo,
};
use tempfile::TempDir;

pub mod add;
pub mod pipeline;
pub mod transfer;

/// A scratch workspace with an initialized repo and some seed files.
pub struct Workspace {
    _guard: TempDir,
    pub root: AbsDirPath,
    pub repo: Repo,
}

pub async fn workspace(files: &[(&str, &str)]) -> Workspace {
    let guard = TempDir::new().expect("create temporary directory");
    let root = AbsDirPath::try_from(guard.path()).expect("read temp dir as abs dir");
    for (path, content) in files {
        let target = root.try_join_file(path).expect("join seed path");
        fs::write(&target, content).await.expect("write seed file");
    }
    let repo = Repo::init(&root, false).await.expect("init repo");
    Workspace {
        _guard: guard,
        root,
        repo,
    }
}

impl Workspace {
    pub async fn write(&self, path: &str, content: &str) {
        let target = self.root.try_join_file(path).expect("join path");
        fs::write(&target, content).await.expect("write file");
    }

    pub async fn read(&self, path: &str) -> String {
        let target = self.root.try_join_file(path).expect("join path");
        fs::must_read_buffered_utf8(&target).await.expect("read file")
    }

    pub async fn remove(&self, path: &str) {
        let target = self.root.try_join_file(path).expect("join path");
        fs::remove_file(&target).await.expect("remove file");
    }

    pub async fn exists(&self, path: &str) -> bool {
        let target = self.root.try_join_file(path).expect("join path");
        fs::exists(target.as_std_path()).await
    }

    /// Reopen the repo, dropping all in-memory state (linker memory,
    /// loaded config). The on-disk state index persists, like a second
    /// invocation of the CLI would see it.
    pub async fn reopen(&mut self) {
        self.repo = Repo::open(&self.root).await.expect("reopen repo");
    }
}
